//! Remote backend contract
//!
//! The sync engine talks to the backend only through [`RemoteBackend`].
//! Production uses [`super::HttpBackend`]; tests use
//! [`super::InMemoryBackend`].

use super::wire::RemoteChange;
use crate::database::EntityKind;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

/// Bearer session issued by the backend
#[derive(Clone, Serialize, Deserialize)]
pub struct SessionToken {
    pub account_id: String,
    pub token: String,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
}

impl SessionToken {
    pub fn is_expired(&self) -> bool {
        self.expires_at.is_some_and(|at| at <= Utc::now())
    }
}

impl std::fmt::Debug for SessionToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionToken")
            .field("account_id", &self.account_id)
            .field("expires_at", &self.expires_at)
            .finish_non_exhaustive()
    }
}

/// Local changes sent in one push. `cursor` is the last pulled position and
/// acts as the optimistic-concurrency token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushBatch {
    pub account_id: String,
    pub device_id: String,
    pub cursor: Option<String>,
    pub changes: Vec<RemoteChange>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushOutcome {
    /// Stored. `cursor` is the position right after this batch; nothing
    /// from other devices lies between the pushed cursor and it.
    Accepted { cursor: Option<String> },
    /// Someone else pushed since our last pull
    StaleCursor,
}

/// Remote changes after a cursor
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullBatch {
    pub account_id: String,
    pub changes: Vec<RemoteChange>,
    pub cursor: Option<String>,
    #[serde(default)]
    pub has_more: bool,
}

/// Something changed remotely; no payload, the receiver pulls
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeNotification {
    pub entity_type: EntityKind,
    pub entity_id: String,
}

#[async_trait]
pub trait RemoteBackend: Send + Sync {
    /// Issue or refresh a session for `account_id`
    async fn authenticate(&self, account_id: &str) -> Result<SessionToken>;

    async fn push(&self, session: &SessionToken, batch: PushBatch) -> Result<PushOutcome>;

    async fn pull(&self, session: &SessionToken, since: Option<&str>) -> Result<PullBatch>;

    /// Change notifications for the session's account. The channel closing
    /// means the connection was lost.
    async fn subscribe(&self, session: &SessionToken) -> Result<mpsc::Receiver<ChangeNotification>>;
}
