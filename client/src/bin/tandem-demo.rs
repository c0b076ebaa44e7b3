//! Tandem demo - a scripted sync session against the in-memory remote store.
//!
//! Shows a scope switch, optimistic creates confirmed by the remote store,
//! a burst of toggles collapsing into one write, a dropped connection being
//! repaired by a resync, and projections over the result.

use futures::future::join_all;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tandem_client::{ClientConfig, MemoryRemote, MirrorEvent, SyncClient};
use tandem_engine::{
    CollectionSchema, FieldDef, FieldType, Mutation, Predicate, Schema, Scope, ViewSpec,
};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tandem_client=debug,tandem_engine=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration, falling back to a demo user
    dotenvy::dotenv().ok();
    let config = match ClientConfig::from_env() {
        Ok(config) => config,
        Err(err) => {
            tracing::warn!(error = %err, "Using demo configuration");
            ClientConfig::new("alice")
        }
    };
    let user_id = config.user_id.clone();

    let schema = Schema::new(1)
        .with_collection(CollectionSchema::new(
            "photos",
            vec![
                FieldDef::required("title", FieldType::String),
                FieldDef::optional("album", FieldType::String),
            ],
        ))
        .with_collection(
            CollectionSchema::new(
                "favorites",
                vec![FieldDef::required("photoId", FieldType::String)],
            )
            .joined_on("photoId"),
        );

    let remote = Arc::new(MemoryRemote::new().with_unique("favorites", "photoId"));
    let home = Scope::new("home", "photos");
    let work = Scope::new("work", "photos");
    let favorites = Scope::new("home", "favorites");
    remote.insert_external(
        &home.key(),
        "bob",
        json!({"title": "Lighthouse", "album": "coast"}),
    );
    remote.insert_external(&work.key(), "bob", json!({"title": "Quarterly chart"}));
    remote.set_write_delay(Duration::from_millis(40));

    let client = SyncClient::new(config, schema, remote.clone());
    let mut events = client.changes();
    let watcher = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if !matches!(event, MirrorEvent::Changed { .. }) {
                tracing::info!(event = ?event, "Session event");
            }
        }
    });

    // Scope switch: work first, then home; the work mirror is discarded
    client.switch_to(work.clone()).await?;
    client.switch_to(home.clone()).await?;
    client.switch_to(favorites.clone()).await?;

    // Optimistic creates show up before the remote store answers
    let tickets = ["Dunes", "Harbor"]
        .into_iter()
        .map(|title| {
            let draft = json!({"title": title, "album": "coast"});
            client.submit(&home.key(), Mutation::create(draft))
        })
        .collect::<Result<Vec<_>, _>>()?;
    let shown = client.get_mirror(&home.key())?;
    tracing::info!(
        entities = shown.len(),
        speculative = shown.speculative_count(),
        "Before confirmation"
    );
    for outcome in join_all(tickets.into_iter().map(|ticket| ticket.outcome())).await {
        outcome?;
    }

    // Rapid toggles on one photo collapse into a single write
    let photo_id = client
        .get_mirror(&home.key())?
        .ids()
        .first()
        .map(|id| id.to_string())
        .ok_or("home scope is empty")?;
    let taps = [true, false, true]
        .into_iter()
        .map(|flag| client.submit(&favorites.key(), Mutation::toggle(photo_id.clone(), flag)))
        .collect::<Result<Vec<_>, _>>()?;
    for outcome in join_all(taps.into_iter().map(|ticket| ticket.outcome())).await {
        let outcome = outcome?;
        tracing::info!(outcome = ?outcome, "Toggle settled");
    }

    // A dropped connection loses events; the resync repairs the mirror
    remote.disconnect(&home.key());
    remote.insert_external(
        &home.key(),
        "carol",
        json!({"title": "Pier", "album": "coast"}),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;

    let albums = client.project(&home.key(), &ViewSpec::group_count("album"))?;
    let mine = client.project(
        &home.key(),
        &ViewSpec::filter(Predicate::authored_by(user_id.clone())),
    )?;
    let favorite = client.project(
        &favorites.key(),
        &ViewSpec::membership("photoId", photo_id, user_id),
    )?;
    tracing::info!(
        coast = albums.count("coast"),
        mine = mine.entities().len(),
        favorite = favorite.is_member(),
        "Projections"
    );

    let snapshot = client.get_mirror(&home.key())?;
    println!("{}", snapshot.to_json()?);

    client.teardown();
    drop(client);
    watcher.abort();
    Ok(())
}
