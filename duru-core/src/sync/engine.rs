//! Sync engine
//!
//! Drains the outbox to the backend and applies remote changes to the local
//! store. At most one push, pull or full cycle runs at a time; repository
//! writes never wait on it, they only share the per-entity locks.

use super::backend::{PushBatch, PushOutcome, RemoteBackend, SessionToken};
use super::conflict::{resolve, Resolution, VersionKey};
use super::retry::with_retry;
use super::wire::{EntityPayload, RemoteChange};
use crate::cancel::Cancellation;
use crate::database::{ChangeOp, EntityKind, FolderRecord, LocalStore, NoteRecord, OutboxEntry, TagRecord};
use crate::error::{AppError, Result};
use crate::events::{ChangeBus, ChangeEvent, ChangeKind, ChangeOrigin};
use crate::services::notes::{next_timestamp, FOLDER_TREE_LOCK};
use crate::services::settings::SyncSettings;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::SqliteConnection;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Idle,
    Pushing,
    Pulling,
    Reconciling,
    /// Last cycle failed; a permanent failure also needs re-authentication
    Error,
    /// Reset for sign-out; never syncs again
    Disabled,
}

/// Counters for one push, pull or full cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub pushed: usize,
    pub pulled: usize,
    pub applied: usize,
    pub local_wins: usize,
    pub remote_wins: usize,
    pub purged: usize,
    /// Folders re-rooted to break a parent cycle
    pub cycles_broken: usize,
    pub stale_retries: u32,
    pub transient_retries: u32,
    pub error: Option<String>,
}

enum PushResult {
    Sent,
    Stale,
}

type InFlight = std::sync::Mutex<Option<watch::Receiver<Option<bool>>>>;

/// Clears the in-flight slot even if the leading caller is dropped
struct InFlightGuard<'a>(&'a InFlight);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }
}

/// Puts the engine back to `Idle` when an operation is dropped before it
/// records its outcome, e.g. by a caller's timeout
struct ActiveState<'a> {
    engine: &'a SyncEngine,
    settled: bool,
}

impl<'a> ActiveState<'a> {
    fn enter(engine: &'a SyncEngine, state: SyncState) -> Self {
        engine.set_state(state);
        Self { engine, settled: false }
    }

    fn finish(mut self, report: SyncReport, result: &Result<()>) -> SyncReport {
        self.settled = true;
        self.engine.finish(report, result)
    }
}

impl Drop for ActiveState<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.engine.set_state(SyncState::Idle);
        }
    }
}

pub struct SyncEngine {
    store: LocalStore,
    backend: Arc<dyn RemoteBackend>,
    bus: ChangeBus,
    account_id: String,
    device_id: String,
    settings: SyncSettings,
    cycle: tokio::sync::Mutex<()>,
    in_flight: InFlight,
    session: std::sync::Mutex<Option<SessionToken>>,
    state_tx: watch::Sender<SyncState>,
    disabled: AtomicBool,
    needs_reauth: AtomicBool,
    last_report: std::sync::Mutex<Option<SyncReport>>,
}

impl SyncEngine {
    pub fn new(
        store: LocalStore,
        backend: Arc<dyn RemoteBackend>,
        bus: ChangeBus,
        account_id: impl Into<String>,
        device_id: impl Into<String>,
        settings: SyncSettings,
    ) -> Self {
        let (state_tx, _) = watch::channel(SyncState::Idle);
        Self {
            store,
            backend,
            bus,
            account_id: account_id.into(),
            device_id: device_id.into(),
            settings,
            cycle: tokio::sync::Mutex::new(()),
            in_flight: std::sync::Mutex::new(None),
            session: std::sync::Mutex::new(None),
            state_tx,
            disabled: AtomicBool::new(false),
            needs_reauth: AtomicBool::new(false),
            last_report: std::sync::Mutex::new(None),
        }
    }

    pub fn account_id(&self) -> &str {
        &self.account_id
    }

    pub fn settings(&self) -> &SyncSettings {
        &self.settings
    }

    pub fn state(&self) -> SyncState {
        *self.state_tx.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.state_tx.subscribe()
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled.load(Ordering::SeqCst)
    }

    pub fn needs_reauth(&self) -> bool {
        self.needs_reauth.load(Ordering::SeqCst)
    }

    pub fn last_report(&self) -> Option<SyncReport> {
        self.last_report.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Local changes not yet acknowledged by the backend
    pub async fn pending_changes(&self) -> Result<i64> {
        let mut conn = self.store.acquire().await?;
        self.store.outbox_len(&mut conn).await
    }

    fn set_state(&self, state: SyncState) {
        if self.is_disabled() && state != SyncState::Disabled {
            return;
        }
        self.state_tx.send_replace(state);
    }

    fn ensure_enabled(&self) -> Result<()> {
        if self.is_disabled() {
            return Err(AppError::SyncDisabled);
        }
        Ok(())
    }

    // ===== Session =====

    fn cached_session(&self) -> Option<SessionToken> {
        self.session
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
            .filter(|s| !s.is_expired())
            .cloned()
    }

    fn store_session(&self, session: Option<SessionToken>) {
        *self.session.lock().unwrap_or_else(|e| e.into_inner()) = session;
    }

    async fn session(&self, cancel: &Cancellation, report: &mut SyncReport) -> Result<SessionToken> {
        if self.needs_reauth() {
            return Err(AppError::AuthExpired);
        }
        if let Some(session) = self.cached_session() {
            return Ok(session);
        }

        let account_id = self.account_id.as_str();
        let session = with_retry(&self.settings, "authenticate", cancel, &mut report.transient_retries, || {
            self.backend.authenticate(account_id)
        })
        .await?;

        if session.account_id != self.account_id {
            return Err(AppError::AccountMismatch {
                expected: self.account_id.clone(),
                actual: session.account_id,
            });
        }

        tracing::info!("Authenticated sync session for account {}", self.account_id);
        self.store_session(Some(session.clone()));
        Ok(session)
    }

    /// Current session, authenticating if none is cached. Fails with
    /// `AuthExpired` while re-authentication is pending.
    pub async fn current_session(&self) -> Result<SessionToken> {
        self.ensure_enabled()?;
        let mut report = SyncReport::default();
        self.session(&Cancellation::new(), &mut report).await
    }

    /// Obtain a fresh session after `AuthExpired` and leave the error state
    pub async fn reauthenticate(&self) -> Result<()> {
        self.ensure_enabled()?;
        self.store_session(None);
        self.needs_reauth.store(false, Ordering::SeqCst);

        let mut report = SyncReport::default();
        match self.session(&Cancellation::new(), &mut report).await {
            Ok(_) => {
                if self.state() == SyncState::Error {
                    self.set_state(SyncState::Idle);
                }
                Ok(())
            }
            Err(e) => {
                self.note_failure(&e);
                Err(e)
            }
        }
    }

    /// Record the effect of a failure on engine state
    fn note_failure(&self, error: &AppError) {
        match error {
            AppError::Cancelled => self.set_state(SyncState::Idle),
            AppError::AuthExpired | AppError::AccountMismatch { .. } => {
                self.store_session(None);
                self.needs_reauth.store(true, Ordering::SeqCst);
                self.set_state(SyncState::Error);
            }
            _ => self.set_state(SyncState::Error),
        }
    }

    fn finish(&self, mut report: SyncReport, result: &Result<()>) -> SyncReport {
        match result {
            Ok(()) => self.set_state(SyncState::Idle),
            Err(e) => {
                report.error = Some(e.to_string());
                self.note_failure(e);
            }
        }
        *self.last_report.lock().unwrap_or_else(|e| e.into_inner()) = Some(report.clone());
        report
    }

    // ===== Public operations =====

    /// Push pending local changes
    pub async fn push(&self) -> Result<SyncReport> {
        self.ensure_enabled()?;
        let _cycle = self.cycle.lock().await;
        self.ensure_enabled()?;

        let cancel = Cancellation::new();
        let mut report = SyncReport::default();
        let active = ActiveState::enter(self, SyncState::Pushing);
        let result = self.push_pending(&cancel, &mut report).await;
        let report = active.finish(report, &result);
        result.map(|_| report)
    }

    /// Pull and apply remote changes after the stored cursor
    pub async fn pull(&self) -> Result<SyncReport> {
        self.ensure_enabled()?;
        let _cycle = self.cycle.lock().await;
        self.ensure_enabled()?;

        let cancel = Cancellation::new();
        let mut report = SyncReport::default();
        let active = ActiveState::enter(self, SyncState::Pulling);
        let result = self.pull_all(&cancel, &mut report).await;
        let report = active.finish(report, &result);
        result.map(|_| report)
    }

    /// One push, pull and reconcile cycle. Returns false on any failure.
    pub async fn manual_sync(&self) -> bool {
        self.manual_sync_with_cancel(&Cancellation::new()).await
    }

    /// Like [`Self::manual_sync`]. A call made while a cycle is in flight
    /// waits for that cycle and returns its result instead of starting
    /// another. Cancellation stops at the next batch boundary.
    pub async fn manual_sync_with_cancel(&self, cancel: &Cancellation) -> bool {
        let (rx, leader) = {
            let mut slot = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
            match slot.as_ref() {
                Some(rx) => (rx.clone(), None),
                None => {
                    let (tx, rx) = watch::channel(None);
                    *slot = Some(rx.clone());
                    (rx, Some(tx))
                }
            }
        };

        let Some(tx) = leader else {
            tracing::debug!("Sync already in flight, waiting for its result");
            let mut rx = rx;
            return match rx.wait_for(|r| r.is_some()).await {
                Ok(result) => (*result).unwrap_or(false),
                // The leading call was dropped before finishing
                Err(_) => false,
            };
        };

        let guard = InFlightGuard(&self.in_flight);
        let ok = self.run_cycle(cancel).await;
        drop(guard);
        tx.send_replace(Some(ok));
        ok
    }

    /// Clear the outbox and all sync bookkeeping and stop syncing. Used on
    /// sign-out so nothing carries over into another account's session.
    pub async fn reset(&self) -> Result<()> {
        let _cycle = self.cycle.lock().await;

        let mut tx = self.store.begin().await?;
        self.store.clear_outbox(&mut tx).await?;
        self.store.clear_sync_state(&mut tx).await?;
        tx.commit().await?;

        self.store_session(None);
        self.needs_reauth.store(false, Ordering::SeqCst);
        self.disabled.store(true, Ordering::SeqCst);
        self.set_state(SyncState::Disabled);

        tracing::info!("Sync reset for account {}", self.account_id);
        Ok(())
    }

    // ===== Cycle =====

    async fn run_cycle(&self, cancel: &Cancellation) -> bool {
        if self.is_disabled() {
            tracing::warn!("Sync skipped: disabled");
            return false;
        }
        if self.needs_reauth() {
            tracing::warn!("Sync skipped: re-authentication required");
            return false;
        }

        let _cycle = self.cycle.lock().await;
        if self.is_disabled() {
            return false;
        }

        let started = std::time::Instant::now();
        let mut report = SyncReport::default();
        let active = ActiveState::enter(self, SyncState::Pushing);
        let result = self.cycle_phases(cancel, &mut report).await;
        let report = active.finish(report, &result);

        match &result {
            Ok(()) => tracing::info!(
                "Sync complete in {:?}: pushed {}, pulled {}, applied {}, purged {}",
                started.elapsed(),
                report.pushed,
                report.pulled,
                report.applied,
                report.purged
            ),
            Err(AppError::Cancelled) => tracing::info!("Sync cancelled"),
            Err(_) => {}
        }

        result.is_ok()
    }

    async fn cycle_phases(&self, cancel: &Cancellation, report: &mut SyncReport) -> Result<()> {
        self.set_state(SyncState::Pushing);
        self.push_pending(cancel, report)
            .await
            .map_err(|e| Self::phase_failed("push", e))?;

        self.set_state(SyncState::Pulling);
        self.pull_all(cancel, report)
            .await
            .map_err(|e| Self::phase_failed("pull", e))?;

        if cancel.is_cancelled() {
            return Err(AppError::Cancelled);
        }

        self.set_state(SyncState::Reconciling);
        self.purge_settled(report)
            .await
            .map_err(|e| Self::phase_failed("reconcile", e))?;
        self.sweep_folder_cycles(report)
            .await
            .map_err(|e| Self::phase_failed("reconcile", e))?;

        Ok(())
    }

    fn phase_failed(phase: &str, error: AppError) -> AppError {
        if !matches!(error, AppError::Cancelled) {
            tracing::error!("Sync {} phase failed: {}", phase, error);
        }
        error
    }

    // ===== Push =====

    async fn push_pending(&self, cancel: &Cancellation, report: &mut SyncReport) -> Result<()> {
        let mut attempts = 0;

        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let pending = {
                let mut conn = self.store.acquire().await?;
                self.store
                    .pending_outbox(&mut conn, self.settings.push_batch_size)
                    .await?
            };
            if pending.is_empty() {
                return Ok(());
            }

            match self.push_batch(&pending, cancel, report).await? {
                PushResult::Sent => attempts = 0,
                PushResult::Stale => {
                    attempts += 1;
                    report.stale_retries += 1;
                    if attempts >= self.settings.max_push_attempts {
                        return Err(AppError::SyncConflict { attempts });
                    }
                    tracing::info!(
                        "Push rejected with stale cursor, pulling before retry ({}/{})",
                        attempts,
                        self.settings.max_push_attempts
                    );
                    self.pull_all(cancel, report).await?;
                }
            }
        }
    }

    /// Push the leading run of same-type entries. Each entity goes out once
    /// as its current snapshot; every sequence number in the run is acked.
    async fn push_batch(
        &self,
        pending: &[OutboxEntry],
        cancel: &Cancellation,
        report: &mut SyncReport,
    ) -> Result<PushResult> {
        let kind = pending[0].entity_type;
        let run: Vec<&OutboxEntry> = pending.iter().take_while(|e| e.entity_type == kind).collect();
        let seqs: Vec<i64> = run.iter().map(|e| e.seq).collect();

        let mut ids: Vec<&str> = Vec::new();
        for entry in &run {
            if !ids.contains(&entry.entity_id.as_str()) {
                ids.push(&entry.entity_id);
            }
        }

        let (changes, cursor) = {
            let mut conn = self.store.acquire().await?;
            let mut changes = Vec::with_capacity(ids.len());
            for id in &ids {
                if let Some(change) = self.snapshot(&mut conn, kind, id).await? {
                    changes.push(change);
                }
            }
            let cursor = self.store.get_cursor(&mut conn, &self.account_id).await?;
            (changes, cursor)
        };

        let session = self.session(cancel, report).await?;
        let batch = PushBatch {
            account_id: self.account_id.clone(),
            device_id: self.device_id.clone(),
            cursor,
            changes,
        };
        let count = batch.changes.len();

        let outcome = with_retry(&self.settings, "push", cancel, &mut report.transient_retries, || {
            self.backend.push(&session, batch.clone())
        })
        .await;

        let outcome = match outcome {
            Ok(outcome) => outcome,
            Err(e) => {
                let mut conn = self.store.acquire().await?;
                self.store.record_push_failure(&mut conn, &seqs, &e.to_string()).await?;
                return Err(e);
            }
        };

        match outcome {
            PushOutcome::Accepted { cursor } => {
                let mut tx = self.store.begin().await?;
                self.store.ack_outbox(&mut tx, &seqs).await?;
                // Accepted means our cursor was the head, so the new head
                // covers nothing we have not seen
                if let Some(cursor) = cursor.as_deref() {
                    self.store.set_cursor(&mut tx, &self.account_id, Some(cursor)).await?;
                }
                self.store.mark_pushed(&mut tx, &self.account_id).await?;
                tx.commit().await?;

                report.pushed += count;
                tracing::debug!("Pushed {} {} change(s), acked {} entries", count, kind, seqs.len());
                Ok(PushResult::Sent)
            }
            PushOutcome::StaleCursor => {
                let mut conn = self.store.acquire().await?;
                self.store.record_push_failure(&mut conn, &seqs, "stale cursor").await?;
                Ok(PushResult::Stale)
            }
        }
    }

    async fn snapshot(&self, conn: &mut SqliteConnection, kind: EntityKind, id: &str) -> Result<Option<RemoteChange>> {
        let change = match kind {
            EntityKind::Note => match self.store.get_note_record(&mut *conn, id).await? {
                Some(rec) => {
                    let folder_id = self.store.folder_id_for_note(&mut *conn, id).await?;
                    let tag_ids = self.store.tag_ids_for_note(&mut *conn, id).await?;
                    Some(RemoteChange::from_note(&rec, folder_id, tag_ids))
                }
                None => None,
            },
            EntityKind::Folder => self
                .store
                .get_folder_record(&mut *conn, id)
                .await?
                .map(|rec| RemoteChange::from_folder(&rec)),
            EntityKind::Tag => self
                .store
                .get_tag_record(&mut *conn, id)
                .await?
                .map(|rec| RemoteChange::from_tag(&rec)),
        };

        if change.is_none() {
            tracing::debug!("Skipping push of purged {} {}", kind, id);
        }
        Ok(change)
    }

    // ===== Pull =====

    async fn pull_all(&self, cancel: &Cancellation, report: &mut SyncReport) -> Result<()> {
        loop {
            if cancel.is_cancelled() {
                return Err(AppError::Cancelled);
            }

            let since = {
                let mut conn = self.store.acquire().await?;
                self.store.get_cursor(&mut conn, &self.account_id).await?
            };
            let session = self.session(cancel, report).await?;

            let batch = with_retry(&self.settings, "pull", cancel, &mut report.transient_retries, || {
                self.backend.pull(&session, since.as_deref())
            })
            .await?;

            if batch.account_id != self.account_id {
                return Err(AppError::AccountMismatch {
                    expected: self.account_id.clone(),
                    actual: batch.account_id,
                });
            }

            report.pulled += batch.changes.len();
            self.apply_batch(&batch.changes, batch.cursor.as_deref(), report).await?;

            if !batch.has_more {
                return Ok(());
            }
            if batch.cursor == since {
                tracing::warn!("Backend reported more changes without advancing the cursor");
                return Ok(());
            }
        }
    }

    /// Apply one pull batch and advance the cursor in a single transaction.
    /// Every entity in the batch is locked first, in lock order. Folder
    /// moves can close a parent cycle that neither device saw locally, so
    /// the tree lock is kept until any such cycle is broken.
    async fn apply_batch(&self, changes: &[RemoteChange], cursor: Option<&str>, report: &mut SyncReport) -> Result<()> {
        let mut keys: Vec<(EntityKind, String)> = changes
            .iter()
            .map(|c| (c.entity_type, c.entity_id.clone()))
            .collect();
        let has_folders = keys.iter().any(|(kind, _)| *kind == EntityKind::Folder);
        keys.sort();
        keys.dedup();

        let tree_guard = match has_folders {
            true => Some(self.store.lock_entity(EntityKind::Folder, FOLDER_TREE_LOCK).await),
            false => None,
        };
        let mut guards = Vec::with_capacity(keys.len());
        for (kind, id) in &keys {
            guards.push(self.store.lock_entity(*kind, id).await);
        }

        let mut tx = self.store.begin().await?;
        let mut events = Vec::new();
        let mut moved_folders = Vec::new();

        for change in changes {
            if let Some(event) = self.apply_change(&mut tx, change, report).await? {
                if event.entity == EntityKind::Folder && event.kind != ChangeKind::Deleted {
                    moved_folders.push(event.id.clone());
                }
                events.push(event);
            }
        }

        if let Some(cursor) = cursor {
            self.store.set_cursor(&mut tx, &self.account_id, Some(cursor)).await?;
        }
        tx.commit().await?;
        drop(guards);

        for event in events {
            self.bus.publish(event);
        }

        if tree_guard.is_some() && !moved_folders.is_empty() {
            self.break_folder_cycles(&moved_folders, report).await?;
        }
        Ok(())
    }

    async fn apply_change(
        &self,
        conn: &mut SqliteConnection,
        change: &RemoteChange,
        report: &mut SyncReport,
    ) -> Result<Option<ChangeEvent>> {
        let kind = change.entity_type;
        let id = change.entity_id.as_str();

        let local = self.local_version(&mut *conn, kind, id).await?;
        let pending = self.store.has_pending(&mut *conn, kind, id).await?;

        if let Some((updated_at, origin)) = &local {
            let local_key = VersionKey::new(*updated_at, id, origin);
            let remote_key = VersionKey::new(change.updated_at, id, &change.origin_device);
            match resolve(&local_key, &remote_key) {
                Resolution::Identical => return Ok(None),
                Resolution::LocalWins => {
                    if pending {
                        report.local_wins += 1;
                        tracing::debug!("Kept local {} {} over older remote version", kind, id);
                    }
                    return Ok(None);
                }
                Resolution::RemoteWins => {}
            }
        }

        if pending {
            self.store.drop_pending(&mut *conn, kind, id).await?;
            report.remote_wins += 1;
            tracing::debug!("Remote version of {} {} won over pending local edit", kind, id);
        }

        if change.deleted {
            if local.is_none() {
                return Ok(None);
            }
            match kind {
                EntityKind::Note => self.store.purge_note(&mut *conn, id).await?,
                EntityKind::Folder => self.store.purge_folder(&mut *conn, id).await?,
                EntityKind::Tag => self.store.purge_tag(&mut *conn, id).await?,
            }
            report.applied += 1;
            return Ok(Some(ChangeEvent::new(kind, id, ChangeKind::Deleted, ChangeOrigin::Remote)));
        }

        match (kind, &change.payload) {
            (EntityKind::Note, Some(EntityPayload::Note(p))) => {
                let rec = NoteRecord {
                    id: id.to_string(),
                    title_enc: p.title_enc.clone(),
                    body_enc: p.body_enc.clone(),
                    metadata_enc: p.metadata_enc.clone(),
                    scheme: p.scheme,
                    is_pinned: p.is_pinned,
                    created_at: p.created_at,
                    updated_at: change.updated_at,
                    deleted: false,
                    origin_device: change.origin_device.clone(),
                };
                self.store.upsert_note(&mut *conn, &rec).await?;
                self.store.set_note_folder(&mut *conn, id, p.folder_id.as_deref()).await?;
                self.store.set_note_tags(&mut *conn, id, &p.tag_ids).await?;
            }
            (EntityKind::Folder, Some(EntityPayload::Folder(p))) => {
                let rec = FolderRecord {
                    id: id.to_string(),
                    name_enc: p.name_enc.clone(),
                    color: p.color.clone(),
                    icon: p.icon.clone(),
                    parent_id: p.parent_id.clone(),
                    scheme: p.scheme,
                    created_at: p.created_at,
                    updated_at: change.updated_at,
                    deleted: false,
                    origin_device: change.origin_device.clone(),
                };
                self.store.upsert_folder(&mut *conn, &rec).await?;
            }
            (EntityKind::Tag, Some(EntityPayload::Tag(p))) => {
                let rec = TagRecord {
                    id: id.to_string(),
                    label_enc: p.label_enc.clone(),
                    label_hash: p.label_hash.clone(),
                    scheme: p.scheme,
                    created_at: p.created_at,
                    updated_at: change.updated_at,
                    deleted: false,
                    origin_device: change.origin_device.clone(),
                };
                self.store.upsert_tag(&mut *conn, &rec).await?;
            }
            _ => {
                tracing::warn!("Ignoring remote {} {} with missing or mismatched payload", kind, id);
                return Ok(None);
            }
        }

        report.applied += 1;
        let event_kind = match local {
            Some(_) => ChangeKind::Updated,
            None => ChangeKind::Created,
        };
        Ok(Some(ChangeEvent::new(kind, id, event_kind, ChangeOrigin::Remote)))
    }

    async fn local_version(
        &self,
        conn: &mut SqliteConnection,
        kind: EntityKind,
        id: &str,
    ) -> Result<Option<(DateTime<Utc>, String)>> {
        let version = match kind {
            EntityKind::Note => self
                .store
                .get_note_record(&mut *conn, id)
                .await?
                .map(|r| (r.updated_at, r.origin_device)),
            EntityKind::Folder => self
                .store
                .get_folder_record(&mut *conn, id)
                .await?
                .map(|r| (r.updated_at, r.origin_device)),
            EntityKind::Tag => self
                .store
                .get_tag_record(&mut *conn, id)
                .await?
                .map(|r| (r.updated_at, r.origin_device)),
        };
        Ok(version)
    }

    // ===== Folder cycles =====

    /// Members of the parent cycle `id` sits on, if any
    async fn folder_cycle(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<Vec<String>>> {
        let chain = self.store.folder_ancestors(&mut *conn, id).await?;
        Ok(chain.iter().any(|a| a == id).then_some(chain))
    }

    /// Re-root the newest member of every cycle through `candidates`. Every
    /// replica holds the same member versions once the closing move lands,
    /// so each picks the same folder. The caller holds the tree lock.
    async fn break_folder_cycles(&self, candidates: &[String], report: &mut SyncReport) -> Result<()> {
        for id in candidates {
            loop {
                let members = {
                    let mut conn = self.store.acquire().await?;
                    self.folder_cycle(&mut conn, id).await?
                };
                let Some(members) = members else { break };

                let _guards = self.store.lock_entities(EntityKind::Folder, &members).await;
                let mut tx = self.store.begin().await?;

                let mut records = Vec::with_capacity(members.len());
                for member in &members {
                    if let Some(rec) = self.store.get_folder_record(&mut tx, member).await? {
                        records.push(rec);
                    }
                }
                let Some(mut loser) = records.into_iter().max_by(|a, b| {
                    VersionKey::new(a.updated_at, &a.id, &a.origin_device)
                        .cmp(&VersionKey::new(b.updated_at, &b.id, &b.origin_device))
                }) else {
                    break;
                };

                tracing::warn!("Folder {} closed a parent cycle, moving it to the top level", loser.id);
                loser.parent_id = None;
                loser.updated_at = next_timestamp(loser.updated_at);
                loser.origin_device = self.device_id.clone();
                self.store.upsert_folder(&mut tx, &loser).await?;
                self.store
                    .append_outbox(&mut tx, EntityKind::Folder, &loser.id, ChangeOp::Update)
                    .await?;
                tx.commit().await?;

                report.cycles_broken += 1;
                self.bus.publish(ChangeEvent::new(
                    EntityKind::Folder,
                    &loser.id,
                    ChangeKind::Updated,
                    ChangeOrigin::Local,
                ));
            }
        }
        Ok(())
    }

    /// Catch cycles left behind by a batch committed just before a crash
    async fn sweep_folder_cycles(&self, report: &mut SyncReport) -> Result<()> {
        let _tree = self.store.lock_entity(EntityKind::Folder, FOLDER_TREE_LOCK).await;
        let ids: Vec<String> = {
            let mut conn = self.store.acquire().await?;
            self.store
                .list_folder_records(&mut conn)
                .await?
                .into_iter()
                .map(|r| r.id)
                .collect()
        };
        self.break_folder_cycles(&ids, report).await
    }

    // ===== Reconcile =====

    /// Hard-delete tombstones whose delete the backend has acknowledged
    async fn purge_settled(&self, report: &mut SyncReport) -> Result<()> {
        let settled = {
            let mut conn = self.store.acquire().await?;
            self.store.settled_tombstones(&mut conn).await?
        };

        for (kind, id) in settled {
            let _guard = self.store.lock_entity(kind, &id).await;
            let mut tx = self.store.begin().await?;

            // Re-check under the lock; a new edit may have landed since the scan
            let still_deleted = match kind {
                EntityKind::Note => self.store.get_note_record(&mut tx, &id).await?.map(|r| r.deleted),
                EntityKind::Folder => self.store.get_folder_record(&mut tx, &id).await?.map(|r| r.deleted),
                EntityKind::Tag => self.store.get_tag_record(&mut tx, &id).await?.map(|r| r.deleted),
            };
            if still_deleted != Some(true) || self.store.has_pending(&mut tx, kind, &id).await? {
                continue;
            }

            match kind {
                EntityKind::Note => self.store.purge_note(&mut tx, &id).await?,
                EntityKind::Folder => self.store.purge_folder(&mut tx, &id).await?,
                EntityKind::Tag => self.store.purge_tag(&mut tx, &id).await?,
            }
            tx.commit().await?;
            report.purged += 1;
        }

        if report.purged > 0 {
            tracing::debug!("Purged {} settled tombstone(s)", report.purged);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::database::create_memory_pool;
    use crate::services::account_keys::AccountKeyService;
    use crate::services::key_manager::{InMemorySecureStorage, KeyManager};
    use crate::services::notes::NotesRepository;
    use crate::sync::InMemoryBackend;

    struct Device {
        store: LocalStore,
        notes: NotesRepository,
        engine: SyncEngine,
    }

    async fn device(name: &str, backend: Arc<InMemoryBackend>, storage: Arc<InMemorySecureStorage>) -> Device {
        let store = LocalStore::new(create_memory_pool().await.unwrap());
        let keys = Arc::new(AccountKeyService::new(
            "acct",
            KeyManager::new(storage),
            KdfParams::for_test(),
        ));
        if keys.unlock("pass").await.is_err() {
            keys.provision_account("pass").await.unwrap();
        }
        let bus = ChangeBus::new();
        let notes = NotesRepository::new(store.clone(), keys, bus.clone(), name);
        let engine = SyncEngine::new(store.clone(), backend, bus, "acct", name, SyncSettings::for_test());
        Device { store, notes, engine }
    }

    async fn pair() -> (Device, Device, Arc<InMemoryBackend>) {
        let backend = Arc::new(InMemoryBackend::new("acct"));
        let storage = Arc::new(InMemorySecureStorage::new());
        let a = device("dev-a", backend.clone(), storage.clone()).await;
        let b = device("dev-b", backend.clone(), storage).await;
        (a, b, backend)
    }

    #[tokio::test]
    async fn test_note_reaches_second_device() {
        let (a, b, _backend) = pair().await;

        let note = a.notes.create_or_update(None, "Hello", "World", false).await.unwrap();
        assert!(a.engine.manual_sync().await);
        assert_eq!(a.engine.pending_changes().await.unwrap(), 0);

        assert!(b.engine.manual_sync().await);
        let synced = b.notes.get_note(&note.id).await.unwrap();
        assert_eq!(synced.title, "Hello");
        assert_eq!(synced.body, "World");
        assert_eq!(b.engine.state(), SyncState::Idle);
    }

    #[tokio::test]
    async fn test_outbox_entries_for_one_entity_collapse() {
        let (a, _b, backend) = pair().await;

        let note = a.notes.create_or_update(None, "v1", "", false).await.unwrap();
        a.notes.create_or_update(Some(&note.id), "v2", "", false).await.unwrap();
        a.notes.create_or_update(Some(&note.id), "v3", "", false).await.unwrap();

        let report = a.engine.push().await.unwrap();
        assert_eq!(report.pushed, 1);
        assert_eq!(backend.changes().len(), 1);
        assert_eq!(a.engine.pending_changes().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_batches_follow_type_runs() {
        let (a, _b, backend) = pair().await;

        let note = a.notes.create_or_update(None, "n", "", false).await.unwrap();
        let folder = a.notes.create_folder("Work", None, None, None).await.unwrap();
        a.notes.assign_note_to_folder(&note.id, Some(&folder.id)).await.unwrap();

        a.engine.push().await.unwrap();

        // note, folder, note: three runs, three pushes
        assert_eq!(backend.push_calls(), 3);
        let kinds: Vec<EntityKind> = backend.changes().iter().map(|c| c.entity_type).collect();
        assert_eq!(kinds, vec![EntityKind::Note, EntityKind::Folder, EntityKind::Note]);
    }

    #[tokio::test]
    async fn test_pull_replay_is_idempotent() {
        let (a, b, _backend) = pair().await;

        a.notes.create_or_update(None, "Once", "", false).await.unwrap();
        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);

        // Replay from scratch
        {
            let mut conn = b.store.acquire().await.unwrap();
            b.store.set_cursor(&mut conn, "acct", None).await.unwrap();
        }
        let report = b.engine.pull().await.unwrap();
        assert_eq!(report.pulled, 1);
        assert_eq!(report.applied, 0);
        assert_eq!(b.notes.list_notes().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_stale_cursor_pulls_then_retries() {
        let (a, b, backend) = pair().await;

        a.notes.create_or_update(None, "from a", "", false).await.unwrap();
        assert!(a.engine.manual_sync().await);

        // b has never pulled, so its first push is stale
        b.notes.create_or_update(None, "from b", "", false).await.unwrap();
        assert!(b.engine.manual_sync().await);

        let report = b.engine.last_report().unwrap();
        assert_eq!(report.stale_retries, 1);
        assert_eq!(backend.changes().len(), 2);
        assert_eq!(b.notes.list_notes().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_persistent_staleness_is_a_conflict() {
        let (a, _b, backend) = pair().await;
        a.notes.create_or_update(None, "x", "", false).await.unwrap();
        backend.reject_next_push_stale(10);

        let err = a.engine.push().await.unwrap_err();
        assert!(matches!(err, AppError::SyncConflict { attempts: 3 }));
        assert_eq!(a.engine.state(), SyncState::Error);
        // Nothing was lost
        assert_eq!(a.engine.pending_changes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_remote_delete_purges_row() {
        let (a, b, _backend) = pair().await;

        let note = a.notes.create_or_update(None, "doomed", "", false).await.unwrap();
        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);

        b.notes.delete(&note.id).await.unwrap();
        assert!(b.engine.manual_sync().await);
        // b's own tombstone is purged once acknowledged
        {
            let mut conn = b.store.acquire().await.unwrap();
            assert!(b.store.get_note_record(&mut conn, &note.id).await.unwrap().is_none());
        }

        assert!(a.engine.manual_sync().await);
        let mut conn = a.store.acquire().await.unwrap();
        assert!(a.store.get_note_record(&mut conn, &note.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_pull_publishes_remote_events() {
        let (a, b, _backend) = pair().await;
        let mut rx = b.engine.bus.subscribe();

        let note = a.notes.create_or_update(None, "evt", "", false).await.unwrap();
        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, note.id);
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.origin, ChangeOrigin::Remote);
    }

    #[tokio::test]
    async fn test_paged_pull_applies_everything() {
        let (a, b, backend) = pair().await;
        for i in 0..5 {
            a.notes.create_or_update(None, &format!("n{}", i), "", false).await.unwrap();
        }
        assert!(a.engine.manual_sync().await);

        backend.set_page_size(2);
        assert!(b.engine.manual_sync().await);
        assert_eq!(b.notes.list_notes().await.unwrap().len(), 5);
        assert_eq!(
            b.engine.last_report().unwrap().pulled,
            5
        );
    }

    #[tokio::test]
    async fn test_cancelled_sync_returns_false_and_idles() {
        let (a, _b, _backend) = pair().await;
        a.notes.create_or_update(None, "x", "", false).await.unwrap();

        let cancel = Cancellation::new();
        cancel.cancel();
        assert!(!a.engine.manual_sync_with_cancel(&cancel).await);
        assert_eq!(a.engine.state(), SyncState::Idle);
        assert_eq!(a.engine.pending_changes().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_dropped_pull_returns_to_idle() {
        let (a, _b, backend) = pair().await;
        backend.set_latency(std::time::Duration::from_secs(10));

        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(100), a.engine.pull()).await;
        assert!(timed_out.is_err());
        assert_eq!(a.engine.state(), SyncState::Idle);

        backend.set_latency(std::time::Duration::ZERO);
        assert!(a.engine.manual_sync().await);
    }

    fn parents(folders: &[crate::database::Folder]) -> std::collections::HashMap<String, Option<String>> {
        folders.iter().map(|f| (f.id.clone(), f.parent_id.clone())).collect()
    }

    fn has_cycle(parents: &std::collections::HashMap<String, Option<String>>) -> bool {
        parents.keys().any(|start| {
            let mut current = parents.get(start).cloned().flatten();
            for _ in 0..parents.len() {
                match current {
                    Some(ref id) if id == start => return true,
                    Some(ref id) => current = parents.get(id).cloned().flatten(),
                    None => return false,
                }
            }
            false
        })
    }

    #[tokio::test]
    async fn test_crossed_folder_moves_do_not_form_a_cycle() {
        let (a, b, _backend) = pair().await;

        let x = a.notes.create_folder("X", None, None, None).await.unwrap();
        let y = a.notes.create_folder("Y", None, None, None).await.unwrap();
        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);

        a.notes.move_folder(&x.id, Some(&y.id)).await.unwrap();
        b.notes.move_folder(&y.id, Some(&x.id)).await.unwrap();

        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);
        assert!(a.engine.manual_sync().await);
        assert!(b.engine.manual_sync().await);

        let on_a = parents(&a.notes.list_folders().await.unwrap());
        let on_b = parents(&b.notes.list_folders().await.unwrap());
        assert!(!has_cycle(&on_a));
        assert_eq!(on_a, on_b);
        let roots = [&x.id, &y.id].iter().filter(|id| on_a[**id].is_none()).count();
        assert_eq!(roots, 1);
    }

    #[tokio::test]
    async fn test_reset_disables_engine() {
        let (a, _b, _backend) = pair().await;
        a.notes.create_or_update(None, "x", "", false).await.unwrap();

        a.engine.reset().await.unwrap();
        assert_eq!(a.engine.state(), SyncState::Disabled);
        assert_eq!(a.engine.pending_changes().await.unwrap(), 0);
        assert!(!a.engine.manual_sync().await);
        assert!(matches!(a.engine.pull().await, Err(AppError::SyncDisabled)));
    }
}
