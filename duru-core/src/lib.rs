//! Duru core library
//!
//! Account key lifecycle, the local encrypted note store and its sync
//! engine, and the checklist/task link. UI layers call in through
//! `app::AppState` and the services it composes.

pub mod app;
pub mod cancel;
pub mod config;
pub mod crypto;
pub mod database;
pub mod encoding;
pub mod error;
pub mod events;
pub mod services;
pub mod sync;
