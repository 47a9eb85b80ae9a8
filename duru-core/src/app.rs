//! Application state and initialization
//!
//! Every service is constructed once here with its collaborators passed
//! in explicitly, and handed out through `AppState`.

use crate::config::DATABASE_FILE;
use crate::database::{create_pool, LocalStore};
use crate::error::{AppError, Result};
use crate::events::ChangeBus;
use crate::services::{
    AccountKeyService, AppSettings, KeyManager, NotesRepository, SecureStorage, TaskSyncCoordinator,
};
use crate::sync::{RealtimeBridge, RemoteBackend, SyncEngine};
use std::path::PathBuf;
use std::sync::Arc;

/// Central application state holding all services
#[derive(Clone)]
pub struct AppState {
    pub data_dir: PathBuf,
    pub settings: AppSettings,
    pub store: LocalStore,
    pub bus: ChangeBus,
    pub keys: Arc<AccountKeyService>,
    pub notes: NotesRepository,
    pub tasks: TaskSyncCoordinator,
    pub sync: Arc<SyncEngine>,
    pub realtime: Arc<RealtimeBridge>,
}

impl AppState {
    /// Open the database under `data_dir` and compose the services for the
    /// configured account
    pub async fn open(
        data_dir: PathBuf,
        settings: AppSettings,
        storage: Arc<dyn SecureStorage>,
        backend: Arc<dyn RemoteBackend>,
    ) -> Result<Self> {
        tracing::info!("Initializing application in {:?}", data_dir);

        let account_id = settings
            .account
            .account_id
            .clone()
            .ok_or_else(|| AppError::Config("No account configured".to_string()))?;
        let device_id = settings.account.device_id.clone();

        std::fs::create_dir_all(&data_dir)?;
        let pool = create_pool(&data_dir.join(DATABASE_FILE)).await?;
        let store = LocalStore::new(pool);
        let bus = ChangeBus::new();

        let keys = Arc::new(AccountKeyService::new(
            account_id.clone(),
            KeyManager::new(storage),
            settings.kdf,
        ));
        let notes = NotesRepository::new(store.clone(), keys.clone(), bus.clone(), device_id.clone());
        let tasks = TaskSyncCoordinator::new(store.clone(), keys.clone(), notes.clone(), bus.clone());

        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            backend.clone(),
            bus.clone(),
            account_id,
            device_id,
            settings.sync.clone(),
        ));
        let realtime = Arc::new(RealtimeBridge::new(sync.clone(), backend));

        tracing::info!("Application initialized successfully");

        Ok(Self {
            data_dir,
            settings,
            store,
            bus,
            keys,
            notes,
            tasks,
            sync,
            realtime,
        })
    }

    /// Unlock with an existing passphrase, or provision the account on
    /// first use. Returns true when a new key was provisioned.
    pub async fn unlock_or_provision(&self, passphrase: &str) -> Result<bool> {
        if self.keys.has_wrapped_key().await? {
            self.keys.unlock(passphrase).await?;
            Ok(false)
        } else {
            self.keys.provision_account(passphrase).await?;
            Ok(true)
        }
    }

    /// Forget the local key and all sync bookkeeping. The key goes first so
    /// no later session can unwrap it.
    pub async fn sign_out(&self) -> Result<()> {
        self.keys.clear_local_key(self.keys.account_id()).await?;
        self.sync.reset().await?;
        tracing::info!("Signed out of account {}", self.keys.account_id());
        Ok(())
    }
}
