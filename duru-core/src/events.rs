//! In-process change bus
//!
//! The core publishes one event per committed entity change. Observers own
//! their subscription; a slow observer lags and skips events instead of
//! blocking the publisher.

use crate::config::CHANGE_BUS_CAPACITY;
use crate::database::EntityKind;
use serde::Serialize;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// Where a change came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeOrigin {
    Local,
    Remote,
    Migration,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChangeEvent {
    pub entity: EntityKind,
    pub id: String,
    pub kind: ChangeKind,
    pub origin: ChangeOrigin,
}

impl ChangeEvent {
    pub fn new(entity: EntityKind, id: impl Into<String>, kind: ChangeKind, origin: ChangeOrigin) -> Self {
        Self {
            entity,
            id: id.into(),
            kind,
            origin,
        }
    }
}

#[derive(Clone)]
pub struct ChangeBus {
    tx: broadcast::Sender<ChangeEvent>,
}

impl ChangeBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANGE_BUS_CAPACITY);
        Self { tx }
    }

    /// Publish an event; having no subscribers is not an error
    pub fn publish(&self, event: ChangeEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ChangeEvent> {
        self.tx.subscribe()
    }
}

impl Default for ChangeBus {
    fn default() -> Self {
        Self::new()
    }
}
