//! Realtime bridge
//!
//! Listens on the backend's change-notification channel and turns
//! notifications into incremental pulls. Notifications carry no payload,
//! so duplicates and reordering are harmless: a burst of them collapses into
//! one pending pull. While the channel is down the bridge falls back to a
//! periodic full sync and keeps trying to resubscribe with the cached
//! session.

use super::backend::{ChangeNotification, RemoteBackend};
use super::engine::SyncEngine;
use crate::cancel::Cancellation;
use crate::config::REALTIME_PULL_TIMEOUT_SECS;
use crate::error::{AppError, Result};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, Notify};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeMode {
    Connecting,
    /// Subscribed; pulls follow notifications
    Live,
    /// Channel down; periodic full sync
    Polling,
}

pub struct RealtimeBridge {
    engine: Arc<SyncEngine>,
    backend: Arc<dyn RemoteBackend>,
    poll_interval: Duration,
    mode_tx: watch::Sender<BridgeMode>,
}

impl RealtimeBridge {
    pub fn new(engine: Arc<SyncEngine>, backend: Arc<dyn RemoteBackend>) -> Self {
        let poll_interval = engine.settings().poll_interval();
        let (mode_tx, _) = watch::channel(BridgeMode::Connecting);
        Self {
            engine,
            backend,
            poll_interval,
            mode_tx,
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn mode(&self) -> BridgeMode {
        *self.mode_tx.borrow()
    }

    pub fn subscribe_mode(&self) -> watch::Receiver<BridgeMode> {
        self.mode_tx.subscribe()
    }

    fn set_mode(&self, mode: BridgeMode) {
        let previous = self.mode_tx.send_replace(mode);
        if previous != mode {
            tracing::info!("Realtime bridge mode: {:?}", mode);
        }
    }

    async fn connect(&self) -> Result<mpsc::Receiver<ChangeNotification>> {
        let session = self.engine.current_session().await?;
        tokio::time::timeout(
            self.engine.settings().network_timeout(),
            self.backend.subscribe(&session),
        )
        .await
        .map_err(|_| AppError::TransientNetwork("subscribe timed out".to_string()))?
    }

    /// Run until cancelled or until sync is disabled, whichever mode the
    /// bridge is in
    pub async fn run(&self, cancel: Cancellation) {
        let notify = Arc::new(Notify::new());
        let stop = Cancellation::new();
        let puller = tokio::spawn(pull_on_notify(self.engine.clone(), notify.clone(), stop.clone()));
        let mut state = self.engine.subscribe_state();

        'outer: loop {
            if cancel.is_cancelled() || self.engine.is_disabled() {
                break;
            }

            match self.connect().await {
                Ok(mut rx) => {
                    self.set_mode(BridgeMode::Live);
                    // Catch up on anything missed while disconnected
                    notify.notify_one();

                    loop {
                        tokio::select! {
                            _ = cancel.cancelled() => break 'outer,
                            changed = state.changed() => {
                                if changed.is_err() || self.engine.is_disabled() {
                                    break 'outer;
                                }
                            }
                            received = rx.recv() => match received {
                                Some(n) => {
                                    tracing::debug!("Remote change notification: {} {}", n.entity_type, n.entity_id);
                                    notify.notify_one();
                                }
                                None => break,
                            },
                        }
                    }
                    tracing::warn!("Realtime channel closed, falling back to polling");
                }
                Err(e) => tracing::warn!("Realtime subscribe failed: {}", e),
            }

            self.set_mode(BridgeMode::Polling);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
            }

            if self.engine.is_disabled() {
                break;
            }
            if self.engine.needs_reauth() {
                tracing::debug!("Polling sync skipped: re-authentication required");
            } else if !self.engine.manual_sync_with_cancel(&cancel).await {
                tracing::warn!("Polling sync failed");
            }
        }

        stop.cancel();
        let _ = puller.await;
        tracing::info!("Realtime bridge stopped");
    }
}

/// Runs one bounded pull per wake-up. `Notify` keeps at most one permit, so
/// notifications arriving during a pull are served by a single follow-up.
async fn pull_on_notify(engine: Arc<SyncEngine>, notify: Arc<Notify>, stop: Cancellation) {
    let limit = Duration::from_secs(REALTIME_PULL_TIMEOUT_SECS);

    loop {
        tokio::select! {
            _ = stop.cancelled() => break,
            _ = notify.notified() => {}
        }

        match tokio::time::timeout(limit, engine.pull()).await {
            Ok(Ok(report)) => {
                if report.applied > 0 {
                    tracing::debug!("Realtime pull applied {} change(s)", report.applied);
                }
            }
            Ok(Err(AppError::SyncDisabled)) => break,
            Ok(Err(e)) => tracing::warn!("Realtime pull failed: {}", e),
            Err(_) => tracing::warn!("Realtime pull timed out"),
        }
    }
}
