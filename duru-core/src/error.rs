//! Error types for the Duru core
//!
//! All errors use thiserror for structured error handling.
//! Messages never carry key material or note plaintext, so every variant
//! is safe to log and to hand to collaborators as a string.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Wrong passphrase (authentication tag mismatch while unwrapping)
    #[error("Invalid passphrase")]
    InvalidPassphrase,

    #[error("Key provisioning failed: {0}")]
    KeyProvisioning(String),

    #[error("Key storage error: {0}")]
    KeyStorage(String),

    #[error("Crypto error: {0}")]
    Crypto(String),

    /// No unwrapped account key in memory
    #[error("Account is locked")]
    Locked,

    #[error("Sync conflict persisted after {attempts} attempts")]
    SyncConflict { attempts: u32 },

    #[error("Transient network error: {0}")]
    TransientNetwork(String),

    #[error("Session expired, re-authentication required")]
    AuthExpired,

    #[error("Account mismatch: expected {expected}, got {actual}")]
    AccountMismatch { expected: String, actual: String },

    #[error("Migration failed for {entity_id}: {reason}")]
    Migration { entity_id: String, reason: String },

    #[error("Note not found: {0}")]
    NoteNotFound(String),

    #[error("Folder not found: {0}")]
    FolderNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Folder {folder_id} cannot be moved under its own descendant {parent_id}")]
    FolderCycle { folder_id: String, parent_id: String },

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Sync is disabled for this session")]
    SyncDisabled,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Whether the failure may clear up on its own and is worth retrying.
    pub fn is_transient(&self) -> bool {
        match self {
            AppError::TransientNetwork(_) => true,
            AppError::Http(e) => {
                e.is_timeout()
                    || e.is_connect()
                    || e.status().map(|s| s.is_server_error()).unwrap_or(false)
            }
            _ => false,
        }
    }
}

impl serde::Serialize for AppError {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(AppError::TransientNetwork("reset".into()).is_transient());
        assert!(!AppError::AuthExpired.is_transient());
        assert!(!AppError::SyncConflict { attempts: 3 }.is_transient());
        assert!(!AppError::InvalidPassphrase.is_transient());
    }

    #[test]
    fn test_serializes_as_message() {
        let json = serde_json::to_string(&AppError::NoteNotFound("n1".into())).unwrap();
        assert_eq!(json, "\"Note not found: n1\"");
    }
}
