// Duru sync daemon
// Headless entry point: unlock, migrate, sync, then follow remote changes

use anyhow::Context;
use duru_core::app::AppState;
use duru_core::cancel::Cancellation;
use duru_core::services::{KeyringStorage, SettingsService};
use duru_core::sync::HttpBackend;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use zeroize::Zeroizing;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "duru_core=debug,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Duru sync");

    let data_dir = std::env::var_os("DURU_DATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".duru"));

    let settings = SettingsService::new(data_dir.clone())
        .load()
        .await
        .context("Failed to load settings")?;
    let backend_url = settings
        .account
        .backend_url
        .clone()
        .context("No backend_url configured in settings")?;

    let passphrase = Zeroizing::new(std::env::var("DURU_PASSPHRASE").context("DURU_PASSPHRASE is not set")?);
    let refresh_token = std::env::var("DURU_REFRESH_TOKEN").ok();

    let backend = Arc::new(HttpBackend::new(
        &backend_url,
        refresh_token,
        settings.sync.network_timeout(),
    )?);
    let storage = Arc::new(KeyringStorage::new());

    let state = AppState::open(data_dir, settings, storage, backend).await?;

    if state.unlock_or_provision(&passphrase).await? {
        tracing::info!("Provisioned a new account key");
    }
    drop(passphrase);

    let migrated = state
        .keys
        .migrate_legacy_content_and_enqueue(&state.store, &state.notes)
        .await?;
    if migrated > 0 {
        tracing::info!("Migrated {} legacy entities", migrated);
    }

    if !state.sync.manual_sync().await {
        tracing::warn!("Initial sync failed; continuing with background sync");
    }

    for note in state.notes.list_notes().await? {
        if let Err(e) = state.tasks.start_watching_note(&note.id).await {
            tracing::warn!("Could not watch note {}: {}", note.id, e);
        }
    }

    let cancel = Cancellation::new();
    let realtime = {
        let bridge = state.realtime.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { bridge.run(cancel).await })
    };
    let coordinator = {
        let tasks = state.tasks.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { tasks.run(cancel).await })
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down");

    cancel.cancel();
    let _ = tokio::join!(realtime, coordinator);

    Ok(())
}
