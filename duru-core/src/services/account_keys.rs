//! Account key service
//!
//! Owns the account master key (AMK) lifecycle: provisioning, passphrase
//! unlock, passphrase change (rewrap only) and sign-out. The unwrapped AMK
//! lives only in this struct's memory; repositories reach it through the
//! crate-private field helpers and never see the key itself.

use crate::config::{SCHEME_ACCOUNT_KEY, SCHEME_LEGACY_DEVICE, WRAPPED_KEY_VERSION};
use crate::crypto::{self, KdfParams, SecretKey};
use crate::error::{AppError, Result};
use crate::services::key_manager::{KeyManager, WrappedAccountKey};
use chrono::Utc;
use serde::Serialize;
use std::sync::RwLock;
use zeroize::Zeroizing;

/// Public handle to an account key: enough to tell keys apart, nothing
/// that helps recover one
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AccountKeyInfo {
    pub account_id: String,
    /// Keyed digest of the AMK; identical across rewraps
    pub fingerprint: String,
}

pub struct AccountKeyService {
    account_id: String,
    key_manager: KeyManager,
    kdf: KdfParams,
    session: RwLock<Option<SecretKey>>,
    legacy: RwLock<Option<SecretKey>>,
}

impl AccountKeyService {
    pub fn new(account_id: impl Into<String>, key_manager: KeyManager, kdf: KdfParams) -> Self {
        Self {
            account_id: account_id.into(),
            key_manager,
            kdf,
            session: RwLock::new(None),
            legacy: RwLock::new(None),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    /// Generate and persist a new AMK wrapped under `passphrase`.
    ///
    /// Refuses to overwrite an existing wrapped key. Nothing is persisted
    /// unless every step succeeds; on success the session is unlocked.
    pub async fn provision_account(&self, passphrase: &str) -> Result<AccountKeyInfo> {
        tracing::info!("Provisioning account key for {}", self.account_id);

        if self.key_manager.load_wrapped(&self.account_id).await?.is_some() {
            return Err(AppError::KeyProvisioning(
                "Account key already provisioned".to_string(),
            ));
        }

        let amk = SecretKey::generate()?;
        let salt = crypto::generate_salt()?;
        let record = self.wrap(&amk, passphrase, salt).await?;

        self.key_manager.store_wrapped(&record).await?;
        self.load_legacy_key().await?;

        let info = self.info_for(&amk);
        self.set_session(amk);

        tracing::info!("Account key provisioned for {}", self.account_id);
        Ok(info)
    }

    /// Unwrap the stored AMK with `passphrase` and hold it for the session.
    ///
    /// The KDF dominates the cost and runs in full whether or not the
    /// passphrase is right.
    pub async fn unlock(&self, passphrase: &str) -> Result<AccountKeyInfo> {
        let record = self.load_record().await?;
        let amk = self.unwrap(&record, passphrase).await?;

        self.load_legacy_key().await?;

        let info = self.info_for(&amk);
        self.set_session(amk);

        tracing::info!("Account {} unlocked", self.account_id);
        Ok(info)
    }

    /// Rewrap the AMK under `new` with a fresh salt. Note content is not
    /// touched. The stored record is replaced in a single write, so any
    /// failure leaves the old record in place.
    pub async fn change_passphrase(&self, old: &str, new: &str) -> Result<()> {
        tracing::info!("Changing passphrase for {}", self.account_id);

        let record = self.load_record().await?;
        let amk = self.unwrap(&record, old).await?;

        let salt = crypto::generate_salt()?;
        let rewrapped = self.wrap(&amk, new, salt).await?;
        self.key_manager.store_wrapped(&rewrapped).await?;

        self.set_session(amk);

        tracing::info!("Passphrase changed for {}", self.account_id);
        Ok(())
    }

    /// Delete the wrapped AMK for `account_id`, and the session key if it
    /// belongs to this service's account. Run before remote sign-out.
    pub async fn clear_local_key(&self, account_id: &str) -> Result<()> {
        if account_id == self.account_id {
            self.lock();
            *self.legacy.write().unwrap_or_else(|e| e.into_inner()) = None;
        }
        self.key_manager.delete_wrapped(account_id).await?;

        tracing::info!("Local account key cleared for {}", account_id);
        Ok(())
    }

    /// Whether this device holds a wrapped AMK for the account
    pub async fn has_wrapped_key(&self) -> Result<bool> {
        Ok(self.key_manager.load_wrapped(&self.account_id).await?.is_some())
    }

    pub fn is_unlocked(&self) -> bool {
        self.session
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// Drop the in-memory AMK; the wrapped form stays
    pub fn lock(&self) {
        // SecretKey zeroizes itself on drop
        self.session
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
    }

    /// Fingerprint of the unlocked AMK
    pub fn key_info(&self) -> Result<AccountKeyInfo> {
        self.with_session(|amk| Ok(self.info_for(amk)))
    }

    // ===== Field encryption =====

    /// Associated data for one encrypted field
    pub(crate) fn field_aad(entity: &str, id: &str, field: &str) -> Vec<u8> {
        format!("{}:{}:{}", entity, id, field).into_bytes()
    }

    /// Seal a field under the AMK
    pub(crate) fn encrypt_field(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        self.with_session(|amk| crypto::seal(amk, SCHEME_ACCOUNT_KEY, plaintext, aad))
    }

    /// Open a field, picking the key from the envelope's scheme tag
    pub(crate) fn decrypt_field(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        match crypto::scheme_of(blob) {
            Some(SCHEME_ACCOUNT_KEY) => self.with_session(|amk| crypto::open(amk, blob, aad)),
            Some(SCHEME_LEGACY_DEVICE) => {
                let legacy = self.legacy.read().unwrap_or_else(|e| e.into_inner());
                match legacy.as_ref() {
                    Some(key) => crypto::open(key, blob, aad),
                    None => Err(AppError::Crypto("Legacy device key unavailable".to_string())),
                }
            }
            Some(other) => Err(AppError::Crypto(format!("Unknown encryption scheme {}", other))),
            None => Err(AppError::Crypto("Empty ciphertext".to_string())),
        }
    }

    pub(crate) fn decrypt_string(&self, blob: &[u8], aad: &[u8]) -> Result<String> {
        let bytes = self.decrypt_field(blob, aad)?;
        String::from_utf8(bytes).map_err(|_| AppError::Crypto("Decrypted field is not UTF-8".to_string()))
    }

    /// Keyed digest of a case-normalised tag label
    pub(crate) fn label_digest(&self, label: &str) -> Result<String> {
        let normalized = normalize_label(label);
        self.with_session(|amk| Ok(crypto::keyed_digest(amk, "tag-label", normalized.as_bytes())))
    }

    /// Keyed digest of arbitrary content, e.g. a checklist line
    pub(crate) fn content_digest(&self, domain: &str, data: &[u8]) -> Result<String> {
        self.with_session(|amk| Ok(crypto::keyed_digest(amk, domain, data)))
    }

    pub(crate) fn has_legacy_key(&self) -> bool {
        self.legacy
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    // ===== Internals =====

    fn with_session<T>(&self, f: impl FnOnce(&SecretKey) -> Result<T>) -> Result<T> {
        let session = self.session.read().unwrap_or_else(|e| e.into_inner());
        match session.as_ref() {
            Some(amk) => f(amk),
            None => Err(AppError::Locked),
        }
    }

    fn set_session(&self, amk: SecretKey) {
        *self.session.write().unwrap_or_else(|e| e.into_inner()) = Some(amk);
    }

    fn info_for(&self, amk: &SecretKey) -> AccountKeyInfo {
        AccountKeyInfo {
            account_id: self.account_id.clone(),
            fingerprint: crypto::keyed_digest(amk, "amk-fingerprint", self.account_id.as_bytes()),
        }
    }

    async fn load_record(&self) -> Result<WrappedAccountKey> {
        let record = self
            .key_manager
            .load_wrapped(&self.account_id)
            .await?
            .ok_or_else(|| AppError::KeyStorage("No account key on this device".to_string()))?;

        if record.account_id != self.account_id {
            return Err(AppError::AccountMismatch {
                expected: self.account_id.clone(),
                actual: record.account_id,
            });
        }
        Ok(record)
    }

    async fn load_legacy_key(&self) -> Result<()> {
        let legacy = self.key_manager.legacy_device_key(&self.account_id).await?;
        *self.legacy.write().unwrap_or_else(|e| e.into_inner()) = legacy;
        Ok(())
    }

    async fn wrap(&self, amk: &SecretKey, passphrase: &str, salt: Vec<u8>) -> Result<WrappedAccountKey> {
        let wrapping = derive_off_thread(passphrase, &salt, self.kdf).await?;
        let aad = WrappedAccountKey::aad(&self.account_id, WRAPPED_KEY_VERSION);
        let (nonce, ciphertext) = crypto::encrypt_with_key(&wrapping, amk.as_bytes(), &aad)
            .map_err(|_| AppError::KeyProvisioning("Failed to wrap account key".to_string()))?;

        Ok(WrappedAccountKey {
            version: WRAPPED_KEY_VERSION,
            account_id: self.account_id.clone(),
            salt,
            kdf: self.kdf,
            nonce,
            ciphertext,
            created_at: Utc::now(),
        })
    }

    async fn unwrap(&self, record: &WrappedAccountKey, passphrase: &str) -> Result<SecretKey> {
        let wrapping = derive_off_thread(passphrase, &record.salt, record.kdf).await?;

        // Both outcomes do the same work: one KDF, one AEAD open
        let opened = crypto::decrypt_with_key(
            &wrapping,
            &record.nonce,
            &record.ciphertext,
            &record.current_aad(),
        );

        match opened {
            Ok(bytes) => {
                let bytes = Zeroizing::new(bytes);
                SecretKey::from_slice(&bytes)
            }
            Err(_) => {
                tracing::warn!("Unlock rejected for account {}", self.account_id);
                Err(AppError::InvalidPassphrase)
            }
        }
    }
}

fn normalize_label(label: &str) -> String {
    label.trim().to_lowercase()
}

/// Run the KDF on the blocking pool
async fn derive_off_thread(passphrase: &str, salt: &[u8], kdf: KdfParams) -> Result<SecretKey> {
    let passphrase = Zeroizing::new(passphrase.to_string());
    let salt = salt.to_vec();

    tokio::task::spawn_blocking(move || crypto::derive_key(&passphrase, &salt, &kdf))
        .await
        .map_err(|e| AppError::Generic(format!("Key derivation task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::key_manager::InMemorySecureStorage;
    use std::sync::Arc;

    fn create_service(storage: Arc<InMemorySecureStorage>) -> AccountKeyService {
        AccountKeyService::new("acct-1", KeyManager::new(storage), KdfParams::for_test())
    }

    #[tokio::test]
    async fn test_provision_then_unlock_yields_same_key() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());

        let provisioned = service.provision_account("correct horse").await.unwrap();
        assert!(service.is_unlocked());

        // A fresh process only has the wrapped key
        let restarted = create_service(storage);
        assert!(!restarted.is_unlocked());
        let unlocked = restarted.unlock("correct horse").await.unwrap();

        assert_eq!(provisioned, unlocked);
    }

    #[tokio::test]
    async fn test_wrong_passphrase_is_rejected() {
        let service = create_service(Arc::new(InMemorySecureStorage::new()));
        service.provision_account("right").await.unwrap();
        service.lock();

        let err = service.unlock("wrong").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPassphrase));
        assert!(!service.is_unlocked());
    }

    #[tokio::test]
    async fn test_provision_refuses_to_overwrite() {
        let service = create_service(Arc::new(InMemorySecureStorage::new()));
        service.provision_account("first").await.unwrap();

        let err = service.provision_account("second").await.unwrap_err();
        assert!(matches!(err, AppError::KeyProvisioning(_)));
        service.unlock("first").await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_provision_leaves_no_key() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());

        storage.fail_writes(true);
        assert!(service.provision_account("pw").await.is_err());
        assert!(!service.is_unlocked());
        assert!(storage.raw("amk:acct-1").is_none());
    }

    #[tokio::test]
    async fn test_change_passphrase_rewraps_same_key() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());
        let before = service.provision_account("old123").await.unwrap();
        let old_salt = KeyManager::new(storage.clone())
            .load_wrapped("acct-1")
            .await
            .unwrap()
            .unwrap()
            .salt;

        service.change_passphrase("old123", "new456").await.unwrap();

        let record = KeyManager::new(storage.clone())
            .load_wrapped("acct-1")
            .await
            .unwrap()
            .unwrap();
        assert_ne!(record.salt, old_salt);

        let restarted = create_service(storage);
        assert!(restarted.unlock("old123").await.is_err());
        let after = restarted.unlock("new456").await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn test_change_passphrase_with_wrong_old_keeps_record() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());
        service.provision_account("old123").await.unwrap();
        let stored = storage.raw("amk:acct-1").unwrap();

        let err = service.change_passphrase("nope", "new456").await.unwrap_err();
        assert!(matches!(err, AppError::InvalidPassphrase));
        assert_eq!(storage.raw("amk:acct-1").unwrap(), stored);

        service.lock();
        service.unlock("old123").await.unwrap();
    }

    #[tokio::test]
    async fn test_change_passphrase_storage_failure_keeps_old_passphrase() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());
        service.provision_account("old123").await.unwrap();

        storage.fail_writes(true);
        assert!(service.change_passphrase("old123", "new456").await.is_err());
        storage.fail_writes(false);

        service.lock();
        service.unlock("old123").await.unwrap();
    }

    #[tokio::test]
    async fn test_clear_local_key() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let service = create_service(storage.clone());
        service.provision_account("pw").await.unwrap();

        service.clear_local_key("acct-1").await.unwrap();
        assert!(!service.is_unlocked());
        assert!(matches!(service.unlock("pw").await, Err(AppError::KeyStorage(_))));
    }

    #[tokio::test]
    async fn test_field_helpers_require_unlock() {
        let service = create_service(Arc::new(InMemorySecureStorage::new()));
        assert!(matches!(service.encrypt_field(b"x", b"aad"), Err(AppError::Locked)));

        service.provision_account("pw").await.unwrap();
        let blob = service.encrypt_field(b"hello", b"note:1:title").unwrap();
        assert_eq!(crypto::scheme_of(&blob), Some(SCHEME_ACCOUNT_KEY));
        assert_eq!(service.decrypt_field(&blob, b"note:1:title").unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_legacy_blobs_open_with_device_key() {
        let storage = Arc::new(InMemorySecureStorage::new());
        let manager = KeyManager::new(storage.clone());
        let legacy = SecretKey::generate().unwrap();
        manager.put_legacy_device_key("acct-1", &legacy).await.unwrap();

        let service = create_service(storage);
        service.provision_account("pw").await.unwrap();
        assert!(service.has_legacy_key());

        let blob = crypto::seal(&legacy, SCHEME_LEGACY_DEVICE, b"old", b"note:1:body").unwrap();
        assert_eq!(service.decrypt_field(&blob, b"note:1:body").unwrap(), b"old");
    }

    #[tokio::test]
    async fn test_label_digest_is_case_insensitive() {
        let service = create_service(Arc::new(InMemorySecureStorage::new()));
        service.provision_account("pw").await.unwrap();

        assert_eq!(
            service.label_digest("Work").unwrap(),
            service.label_digest("  work ").unwrap()
        );
        assert_ne!(
            service.label_digest("work").unwrap(),
            service.label_digest("home").unwrap()
        );
    }
}
