//! Services module
//!
//! Key lifecycle, the notes repository, task coordination and settings.
//! Each service takes its collaborators explicitly at construction.

pub mod account_keys;
pub mod checklist;
pub mod key_manager;
pub mod migration;
pub mod notes;
pub mod settings;
pub mod tasks;

pub use account_keys::{AccountKeyInfo, AccountKeyService};
pub use key_manager::{
    InMemorySecureStorage, KeyManager, KeyringStorage, SecureStorage, SqliteKeyStorage, WrappedAccountKey,
};
pub use migration::MigrationReport;
pub use notes::NotesRepository;
pub use settings::{AppSettings, SettingsService, SyncSettings};
pub use tasks::{ReconcileOutcome, TaskSyncCoordinator};
