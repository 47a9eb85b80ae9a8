//! Synchronization with the remote backend
//!
//! - `backend`: the backend contract and its message types
//! - `wire`: ciphertext-only entity snapshots exchanged with the backend
//! - `engine`: push, pull, conflict resolution and the sync state machine
//! - `realtime`: notification-driven pulls with polling fallback
//! - `http` / `memory`: production and in-process backends

pub mod backend;
pub mod conflict;
pub mod engine;
pub mod http;
pub mod memory;
pub mod realtime;
pub mod retry;
pub mod wire;

pub use backend::{ChangeNotification, PullBatch, PushBatch, PushOutcome, RemoteBackend, SessionToken};
pub use engine::{SyncEngine, SyncReport, SyncState};
pub use http::HttpBackend;
pub use memory::InMemoryBackend;
pub use realtime::{BridgeMode, RealtimeBridge};
pub use wire::{EntityPayload, RemoteChange};
