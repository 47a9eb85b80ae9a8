//! Settings service
//!
//! Persists account, sync and key-derivation settings as a JSON file in the
//! data directory. Unknown or missing fields fall back to defaults so older
//! files keep loading.

use crate::config::*;
use crate::crypto::KdfParams;
use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

/// Identity of this installation and the account it syncs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountSettings {
    /// Account to sync; `None` until the user signs in
    #[serde(default)]
    pub account_id: Option<String>,
    /// Base URL of the remote backend
    #[serde(default)]
    pub backend_url: Option<String>,
    /// Stable per-installation id, used as the LWW tie-breaker
    #[serde(default = "default_device_id")]
    pub device_id: String,
}

fn default_device_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

impl Default for AccountSettings {
    fn default() -> Self {
        Self {
            account_id: None,
            backend_url: None,
            device_id: default_device_id(),
        }
    }
}

/// Sync engine tuning
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncSettings {
    #[serde(default = "default_push_batch_size")]
    pub push_batch_size: u32,
    /// Stale-cursor retries before a conflict is surfaced
    #[serde(default = "default_max_push_attempts")]
    pub max_push_attempts: u32,
    #[serde(default = "default_max_transient_retries")]
    pub max_transient_retries: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,
    #[serde(default = "default_network_timeout_secs")]
    pub network_timeout_secs: u64,
    /// Fallback polling interval while the realtime channel is down
    #[serde(default = "default_poll_interval_secs")]
    pub poll_interval_secs: u64,
}

fn default_push_batch_size() -> u32 {
    DEFAULT_PUSH_BATCH_SIZE
}

fn default_max_push_attempts() -> u32 {
    DEFAULT_MAX_PUSH_ATTEMPTS
}

fn default_max_transient_retries() -> u32 {
    DEFAULT_MAX_TRANSIENT_RETRIES
}

fn default_backoff_base_ms() -> u64 {
    DEFAULT_BACKOFF_BASE_MS
}

fn default_backoff_max_ms() -> u64 {
    DEFAULT_BACKOFF_MAX_MS
}

fn default_network_timeout_secs() -> u64 {
    DEFAULT_NETWORK_TIMEOUT_SECS
}

fn default_poll_interval_secs() -> u64 {
    DEFAULT_POLL_INTERVAL_SECS
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            push_batch_size: default_push_batch_size(),
            max_push_attempts: default_max_push_attempts(),
            max_transient_retries: default_max_transient_retries(),
            backoff_base_ms: default_backoff_base_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            network_timeout_secs: default_network_timeout_secs(),
            poll_interval_secs: default_poll_interval_secs(),
        }
    }
}

impl SyncSettings {
    /// Clamp every field into its supported range
    pub fn validated(mut self) -> Self {
        self.push_batch_size = self
            .push_batch_size
            .clamp(MIN_PUSH_BATCH_SIZE, MAX_PUSH_BATCH_SIZE);
        self.max_push_attempts = self.max_push_attempts.clamp(1, MAX_PUSH_ATTEMPTS);
        self.max_transient_retries = self.max_transient_retries.min(MAX_TRANSIENT_RETRIES);
        self.backoff_max_ms = self.backoff_max_ms.max(self.backoff_base_ms);
        self.network_timeout_secs = self
            .network_timeout_secs
            .clamp(MIN_NETWORK_TIMEOUT_SECS, MAX_NETWORK_TIMEOUT_SECS);
        self.poll_interval_secs = self
            .poll_interval_secs
            .clamp(MIN_POLL_INTERVAL_SECS, MAX_POLL_INTERVAL_SECS);
        self
    }

    pub fn network_timeout(&self) -> Duration {
        Duration::from_secs(self.network_timeout_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    /// Settings with no waiting, for tests
    pub fn for_test() -> Self {
        Self {
            backoff_base_ms: 1,
            backoff_max_ms: 2,
            network_timeout_secs: 5,
            ..Self::default()
        }
    }
}

/// All persisted settings
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppSettings {
    #[serde(default)]
    pub account: AccountSettings,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub kdf: KdfParams,
}

impl AppSettings {
    /// Clamp KDF costs; the values are stored with every wrapped key, so
    /// changing them only affects keys wrapped afterwards.
    pub fn validated(mut self) -> Self {
        self.sync = self.sync.validated();
        self.kdf.memory_kib = self
            .kdf
            .memory_kib
            .clamp(MIN_KDF_MEMORY_KIB, MAX_KDF_MEMORY_KIB);
        self.kdf.iterations = self.kdf.iterations.max(1);
        self.kdf.parallelism = self.kdf.parallelism.max(1);
        self
    }
}

/// Service for managing settings
#[derive(Clone)]
pub struct SettingsService {
    settings_path: PathBuf,
}

impl SettingsService {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            settings_path: data_dir.join(SETTINGS_FILE),
        }
    }

    /// Load settings from disk or create defaults if the file does not exist
    pub async fn load(&self) -> Result<AppSettings> {
        if !self.settings_path.exists() {
            tracing::info!("Settings file not found, creating default settings");
            let default = AppSettings::default();
            self.save(&default).await?;
            return Ok(default);
        }

        let content = fs::read_to_string(&self.settings_path).await?;
        let settings: AppSettings = serde_json::from_str(&content)
            .map_err(|e| AppError::Config(format!("Failed to parse settings: {}", e)))?;

        Ok(settings.validated())
    }

    /// Save settings to disk
    pub async fn save(&self, settings: &AppSettings) -> Result<()> {
        if let Some(parent) = self.settings_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let content = serde_json::to_string_pretty(settings)?;
        fs::write(&self.settings_path, content).await?;
        tracing::info!("Settings saved to {:?}", self.settings_path);

        Ok(())
    }

    /// Record the signed-in account
    pub async fn set_account(&self, account_id: Option<String>, backend_url: Option<String>) -> Result<()> {
        let mut settings = self.load().await?;
        settings.account.account_id = account_id;
        settings.account.backend_url = backend_url;
        self.save(&settings).await
    }

    pub async fn update_sync(&self, sync: SyncSettings) -> Result<()> {
        let mut settings = self.load().await?;
        settings.sync = sync.validated();
        self.save(&settings).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn create_test_service() -> (SettingsService, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let service = SettingsService::new(temp_dir.path().to_path_buf());
        (service, temp_dir)
    }

    #[tokio::test]
    async fn test_default_settings_created_on_load() {
        let (service, _temp) = create_test_service();

        let settings = service.load().await.unwrap();

        assert!(settings.account.account_id.is_none());
        assert!(!settings.account.device_id.is_empty());
        assert_eq!(settings.sync.max_push_attempts, DEFAULT_MAX_PUSH_ATTEMPTS);
        assert_eq!(settings.kdf, KdfParams::default());
    }

    #[tokio::test]
    async fn test_device_id_is_stable_across_loads() {
        let (service, _temp) = create_test_service();

        let first = service.load().await.unwrap();
        let second = service.load().await.unwrap();

        assert_eq!(first.account.device_id, second.account.device_id);
    }

    #[tokio::test]
    async fn test_account_update_preserves_sync_settings() {
        let (service, _temp) = create_test_service();

        let tuned = SyncSettings {
            push_batch_size: 25,
            ..SyncSettings::default()
        };
        service.update_sync(tuned).await.unwrap();
        service
            .set_account(Some("acct-1".to_string()), Some("https://sync.example".to_string()))
            .await
            .unwrap();

        let loaded = service.load().await.unwrap();
        assert_eq!(loaded.account.account_id.as_deref(), Some("acct-1"));
        assert_eq!(loaded.sync.push_batch_size, 25);
    }

    #[test]
    fn test_validation_clamps_values() {
        let sync = SyncSettings {
            push_batch_size: 0,
            max_push_attempts: 500,
            poll_interval_secs: 1,
            backoff_base_ms: 10_000,
            backoff_max_ms: 10,
            ..SyncSettings::default()
        }
        .validated();

        assert_eq!(sync.push_batch_size, MIN_PUSH_BATCH_SIZE);
        assert_eq!(sync.max_push_attempts, MAX_PUSH_ATTEMPTS);
        assert_eq!(sync.poll_interval_secs, MIN_POLL_INTERVAL_SECS);
        assert_eq!(sync.backoff_max_ms, 10_000);
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let parsed: AppSettings =
            serde_json::from_str(r#"{"account":{"account_id":"a"}}"#).unwrap();
        assert_eq!(parsed.account.account_id.as_deref(), Some("a"));
        assert_eq!(parsed.sync, SyncSettings::default());
    }
}
