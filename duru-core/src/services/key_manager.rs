//! Key manager
//!
//! Device-local persistence of wrapped account keys, keyed by account id.
//! The production backend is the OS credential store; a SQLite table and an
//! in-memory map implement the same trait for headless installs and tests.
//! Only wrapped (encrypted) key material ever reaches storage, except the
//! legacy per-device key, which predates account keys.

use crate::config::{KEY_SIZE, WRAPPED_KEY_VERSION};
use crate::crypto::{KdfParams, SecretKey};
use crate::encoding;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use keyring::Entry;
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use zeroize::Zeroizing;

const SERVICE_NAME: &str = "DuruNotes";

/// Device-scoped secret storage
#[async_trait]
pub trait SecureStorage: Send + Sync {
    async fn put(&self, key: &str, value: &str) -> Result<()>;
    async fn get(&self, key: &str) -> Result<Option<String>>;
    async fn delete(&self, key: &str) -> Result<()>;
}

/// OS credential store (Windows Credential Manager, macOS Keychain, ...)
pub struct KeyringStorage {
    service: String,
}

impl KeyringStorage {
    pub fn new() -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
        }
    }

    fn entry(&self, key: &str) -> Result<Entry> {
        Entry::new(&self.service, key)
            .map_err(|e| AppError::KeyStorage(format!("Failed to create keyring entry: {}", e)))
    }
}

impl Default for KeyringStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SecureStorage for KeyringStorage {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        self.entry(key)?
            .set_password(value)
            .map_err(|e| AppError::KeyStorage(format!("Failed to store credential: {}", e)))
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        match self.entry(key)?.get_password() {
            Ok(value) => Ok(Some(value)),
            Err(keyring::Error::NoEntry) => Ok(None),
            Err(e) => Err(AppError::KeyStorage(format!("Failed to read credential: {}", e))),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match self.entry(key)?.delete_credential() {
            Ok(()) | Err(keyring::Error::NoEntry) => Ok(()),
            Err(e) => Err(AppError::KeyStorage(format!("Failed to delete credential: {}", e))),
        }
    }
}

/// Secure storage in the local database's `wrapped_account_keys` table
#[derive(Clone)]
pub struct SqliteKeyStorage {
    pool: SqlitePool,
}

impl SqliteKeyStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SecureStorage for SqliteKeyStorage {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO wrapped_account_keys (item_key, item_value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(item_key) DO UPDATE SET
                item_value = excluded.item_value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value = sqlx::query_scalar("SELECT item_value FROM wrapped_account_keys WHERE item_key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM wrapped_account_keys WHERE item_key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Process-local storage for tests and ephemeral sessions
#[derive(Default)]
pub struct InMemorySecureStorage {
    entries: Mutex<HashMap<String, String>>,
    fail_writes: AtomicBool,
}

impl InMemorySecureStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent `put` fail, to exercise rollback paths
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(key)
            .cloned()
    }
}

#[async_trait]
impl SecureStorage for InMemorySecureStorage {
    async fn put(&self, key: &str, value: &str) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::KeyStorage("Secure storage unavailable".to_string()));
        }
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(self.raw(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.entries
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(key);
        Ok(())
    }
}

/// Persisted form of an account master key: the AMK encrypted under a
/// passphrase-derived key, with everything needed to derive it again
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WrappedAccountKey {
    pub version: u32,
    pub account_id: String,
    #[serde(with = "crate::encoding::b64")]
    pub salt: Vec<u8>,
    pub kdf: KdfParams,
    #[serde(with = "crate::encoding::b64")]
    pub nonce: Vec<u8>,
    #[serde(with = "crate::encoding::b64")]
    pub ciphertext: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

impl WrappedAccountKey {
    /// Associated data binding the wrapped key to its account and layout
    pub fn aad(account_id: &str, version: u32) -> Vec<u8> {
        format!("amk:{}:v{}", account_id, version).into_bytes()
    }

    pub fn current_aad(&self) -> Vec<u8> {
        Self::aad(&self.account_id, self.version)
    }
}

/// Stores, loads and deletes key material per account
#[derive(Clone)]
pub struct KeyManager {
    storage: Arc<dyn SecureStorage>,
}

impl KeyManager {
    pub fn new(storage: Arc<dyn SecureStorage>) -> Self {
        Self { storage }
    }

    fn wrapped_slot(account_id: &str) -> String {
        format!("amk:{}", account_id)
    }

    fn legacy_slot(account_id: &str) -> String {
        format!("legacy-device-key:{}", account_id)
    }

    pub async fn load_wrapped(&self, account_id: &str) -> Result<Option<WrappedAccountKey>> {
        let Some(raw) = self.storage.get(&Self::wrapped_slot(account_id)).await? else {
            return Ok(None);
        };

        let record: WrappedAccountKey = serde_json::from_str(&raw)
            .map_err(|_| AppError::KeyStorage("Stored account key is unreadable".to_string()))?;

        if record.version != WRAPPED_KEY_VERSION {
            return Err(AppError::KeyStorage(format!(
                "Unsupported wrapped key version {}",
                record.version
            )));
        }
        Ok(Some(record))
    }

    /// Write the wrapped key. A single storage write, so a failure leaves
    /// the previous record in place.
    pub async fn store_wrapped(&self, record: &WrappedAccountKey) -> Result<()> {
        let raw = serde_json::to_string(record)?;
        self.storage
            .put(&Self::wrapped_slot(&record.account_id), &raw)
            .await?;

        tracing::info!("Wrapped account key stored for account {}", record.account_id);
        Ok(())
    }

    pub async fn delete_wrapped(&self, account_id: &str) -> Result<()> {
        self.storage.delete(&Self::wrapped_slot(account_id)).await?;
        tracing::info!("Wrapped account key deleted for account {}", account_id);
        Ok(())
    }

    pub async fn put_legacy_device_key(&self, account_id: &str, key: &SecretKey) -> Result<()> {
        self.storage
            .put(&Self::legacy_slot(account_id), &encoding::encode(key.as_bytes()))
            .await
    }

    pub async fn legacy_device_key(&self, account_id: &str) -> Result<Option<SecretKey>> {
        let Some(raw) = self.storage.get(&Self::legacy_slot(account_id)).await? else {
            return Ok(None);
        };

        let bytes = Zeroizing::new(
            encoding::decode(&raw)
                .map_err(|_| AppError::KeyStorage("Stored legacy key is unreadable".to_string()))?,
        );
        if bytes.len() != KEY_SIZE {
            return Err(AppError::KeyStorage("Stored legacy key has wrong length".to_string()));
        }
        Ok(Some(SecretKey::from_slice(&bytes)?))
    }

    pub async fn delete_legacy_device_key(&self, account_id: &str) -> Result<()> {
        self.storage.delete(&Self::legacy_slot(account_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::create_memory_pool;

    fn sample_record(account_id: &str) -> WrappedAccountKey {
        WrappedAccountKey {
            version: WRAPPED_KEY_VERSION,
            account_id: account_id.to_string(),
            salt: vec![1; 16],
            kdf: KdfParams::for_test(),
            nonce: vec![2; 12],
            ciphertext: vec![3; 48],
            created_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_wrapped_key_round_trip() {
        let manager = KeyManager::new(Arc::new(InMemorySecureStorage::new()));
        let record = sample_record("acct-1");

        manager.store_wrapped(&record).await.unwrap();
        let loaded = manager.load_wrapped("acct-1").await.unwrap().unwrap();
        assert_eq!(loaded, record);

        assert!(manager.load_wrapped("acct-2").await.unwrap().is_none());

        manager.delete_wrapped("acct-1").await.unwrap();
        assert!(manager.load_wrapped("acct-1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_sqlite_storage_backs_key_manager() {
        let pool = create_memory_pool().await.unwrap();
        let manager = KeyManager::new(Arc::new(SqliteKeyStorage::new(pool)));

        let record = sample_record("acct-1");
        manager.store_wrapped(&record).await.unwrap();
        assert_eq!(manager.load_wrapped("acct-1").await.unwrap().unwrap(), record);

        // Overwrite replaces rather than duplicates
        let mut updated = record.clone();
        updated.salt = vec![9; 16];
        manager.store_wrapped(&updated).await.unwrap();
        assert_eq!(manager.load_wrapped("acct-1").await.unwrap().unwrap().salt, vec![9; 16]);
    }

    #[tokio::test]
    async fn test_stored_record_contains_no_raw_bytes_arrays() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let manager = KeyManager::new(storage.clone());
        manager.store_wrapped(&sample_record("acct-1")).await.unwrap();

        let raw = storage.raw("amk:acct-1").unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert!(value["ciphertext"].is_string());
        assert!(value["salt"].is_string());
    }

    #[tokio::test]
    async fn test_legacy_device_key_round_trip() {
        let manager = KeyManager::new(Arc::new(InMemorySecureStorage::new()));
        assert!(manager.legacy_device_key("acct-1").await.unwrap().is_none());

        let key = SecretKey::generate().unwrap();
        manager.put_legacy_device_key("acct-1", &key).await.unwrap();
        assert_eq!(manager.legacy_device_key("acct-1").await.unwrap().unwrap(), key);
    }

    #[tokio::test]
    async fn test_failed_write_keeps_previous_record() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let manager = KeyManager::new(storage.clone());

        let original = sample_record("acct-1");
        manager.store_wrapped(&original).await.unwrap();

        storage.fail_writes(true);
        let mut replacement = original.clone();
        replacement.salt = vec![7; 16];
        assert!(manager.store_wrapped(&replacement).await.is_err());

        assert_eq!(manager.load_wrapped("acct-1").await.unwrap().unwrap(), original);
    }
}
