//! Legacy content migration
//!
//! Re-encrypts rows still sealed under the pre-AMK per-device key. Each
//! entity is migrated in its own transaction together with its outbox
//! entry, and rows are selected by their scheme tag, so an interrupted run
//! resumes where it stopped and a repeated run finds nothing to do.

use crate::cancel::Cancellation;
use crate::config::{SCHEME_ACCOUNT_KEY, SCHEME_LEGACY_DEVICE};
use crate::database::{ChangeOp, EntityKind, LocalStore, TagRecord};
use crate::error::{AppError, Result};
use crate::events::{ChangeEvent, ChangeKind, ChangeOrigin};
use crate::services::account_keys::AccountKeyService;
use crate::services::notes::{next_timestamp, tag_id_for_digest, NotesRepository};
use serde::Serialize;

/// Outcome of one migration run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MigrationReport {
    pub migrated: usize,
    /// Entities left on the legacy scheme; retried on the next run
    pub failed: usize,
    pub cancelled: bool,
}

impl AccountKeyService {
    /// Migrate every legacy-encrypted folder, tag and note to the AMK and
    /// enqueue each for push. Returns the number of entities migrated.
    ///
    /// Migrated rows become new versions written by `repo`'s device, so
    /// peers holding the legacy copy take the re-encrypted one on pull.
    pub async fn migrate_legacy_content_and_enqueue(&self, store: &LocalStore, repo: &NotesRepository) -> Result<usize> {
        let report = self
            .migrate_legacy_content_with_cancel(store, repo, &Cancellation::new())
            .await?;
        Ok(report.migrated)
    }

    /// Same as [`Self::migrate_legacy_content_and_enqueue`], stopping between
    /// entities once `cancel` fires
    pub async fn migrate_legacy_content_with_cancel(
        &self,
        store: &LocalStore,
        repo: &NotesRepository,
        cancel: &Cancellation,
    ) -> Result<MigrationReport> {
        if !self.is_unlocked() {
            return Err(AppError::Locked);
        }

        let (folder_ids, tag_ids, note_ids) = {
            let mut conn = store.acquire().await?;
            (
                store.folder_ids_with_scheme(&mut conn, SCHEME_LEGACY_DEVICE).await?,
                store.tag_ids_with_scheme(&mut conn, SCHEME_LEGACY_DEVICE).await?,
                store.note_ids_with_scheme(&mut conn, SCHEME_LEGACY_DEVICE).await?,
            )
        };

        let total = folder_ids.len() + tag_ids.len() + note_ids.len();
        if total == 0 {
            tracing::debug!("No legacy content to migrate");
            return Ok(MigrationReport::default());
        }
        tracing::info!("Migrating {} legacy entities to the account key", total);

        if !self.has_legacy_key() {
            tracing::warn!("Legacy content present but no legacy device key is available");
        }

        let device = repo.device_id();
        let mut report = MigrationReport::default();
        let work = folder_ids
            .into_iter()
            .map(|id| (EntityKind::Folder, id))
            .chain(tag_ids.into_iter().map(|id| (EntityKind::Tag, id)))
            .chain(note_ids.into_iter().map(|id| (EntityKind::Note, id)));

        for (kind, id) in work {
            if cancel.is_cancelled() {
                tracing::info!("Migration cancelled after {} entities", report.migrated);
                report.cancelled = true;
                break;
            }

            let outcome = match kind {
                EntityKind::Folder => self.migrate_folder(store, &id, device).await,
                EntityKind::Tag => self.migrate_tag(store, &id, device).await,
                EntityKind::Note => self.migrate_note(store, &id, device).await,
            };

            match outcome {
                Ok(events) if !events.is_empty() => {
                    report.migrated += 1;
                    for event in events {
                        repo.bus().publish(event);
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    let err = AppError::Migration {
                        entity_id: id.clone(),
                        reason: e.to_string(),
                    };
                    tracing::warn!("{} ({})", err, kind);
                    report.failed += 1;
                }
            }
        }

        tracing::info!(
            "Migration finished: {} migrated, {} failed",
            report.migrated,
            report.failed
        );
        Ok(report)
    }

    async fn migrate_note(&self, store: &LocalStore, id: &str, device: &str) -> Result<Vec<ChangeEvent>> {
        let _guard = store.lock_entity(EntityKind::Note, id).await;
        let mut tx = store.begin().await?;

        let Some(mut record) = store.get_note_record(&mut tx, id).await? else {
            return Ok(Vec::new());
        };
        if record.scheme != SCHEME_LEGACY_DEVICE as i64 {
            return Ok(Vec::new());
        }

        record.title_enc = self.reseal(&record.title_enc, "note", id, "title")?;
        record.body_enc = self.reseal(&record.body_enc, "note", id, "body")?;
        record.metadata_enc = match record.metadata_enc.take() {
            Some(blob) => Some(self.reseal(&blob, "note", id, "metadata")?),
            None => None,
        };
        record.scheme = SCHEME_ACCOUNT_KEY as i64;
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = device.to_string();

        store.upsert_note(&mut tx, &record).await?;
        store.append_outbox(&mut tx, EntityKind::Note, id, ChangeOp::Update).await?;
        tx.commit().await?;

        tracing::debug!("Migrated note {}", id);
        Ok(vec![ChangeEvent::new(EntityKind::Note, id, ChangeKind::Updated, ChangeOrigin::Migration)])
    }

    async fn migrate_folder(&self, store: &LocalStore, id: &str, device: &str) -> Result<Vec<ChangeEvent>> {
        let _guard = store.lock_entity(EntityKind::Folder, id).await;
        let mut tx = store.begin().await?;

        let Some(mut record) = store.get_folder_record(&mut tx, id).await? else {
            return Ok(Vec::new());
        };
        if record.scheme != SCHEME_LEGACY_DEVICE as i64 {
            return Ok(Vec::new());
        }

        record.name_enc = self.reseal(&record.name_enc, "folder", id, "name")?;
        record.scheme = SCHEME_ACCOUNT_KEY as i64;
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = device.to_string();

        store.upsert_folder(&mut tx, &record).await?;
        store.append_outbox(&mut tx, EntityKind::Folder, id, ChangeOp::Update).await?;
        tx.commit().await?;

        tracing::debug!("Migrated folder {}", id);
        Ok(vec![ChangeEvent::new(EntityKind::Folder, id, ChangeKind::Updated, ChangeOrigin::Migration)])
    }

    /// Tag ids derive from the label digest, which is keyed, so a legacy tag
    /// moves to a new id: create (or reuse) the AMK tag, repoint every note,
    /// and tombstone the legacy row.
    async fn migrate_tag(&self, store: &LocalStore, id: &str, device: &str) -> Result<Vec<ChangeEvent>> {
        let label = {
            let mut conn = store.acquire().await?;
            match store.get_tag_record(&mut conn, id).await? {
                Some(record) if record.scheme == SCHEME_LEGACY_DEVICE as i64 && !record.deleted => {
                    let aad = AccountKeyService::field_aad("tag", id, "label");
                    self.decrypt_string(&record.label_enc, &aad)?
                }
                _ => return Ok(Vec::new()),
            }
        };

        let digest = self.label_digest(&label)?;
        let new_id = tag_id_for_digest(&digest);

        let _tag_guards = store
            .lock_entities(EntityKind::Tag, &[id.to_string(), new_id.clone()])
            .await;
        let note_ids = {
            let mut conn = store.acquire().await?;
            store.note_ids_for_tag(&mut conn, id).await?
        };
        let _note_guards = store.lock_entities(EntityKind::Note, &note_ids).await;

        let mut tx = store.begin().await?;

        // Re-check under the lock
        let Some(old) = store.get_tag_record(&mut tx, id).await? else {
            return Ok(Vec::new());
        };
        if old.scheme != SCHEME_LEGACY_DEVICE as i64 || old.deleted {
            return Ok(Vec::new());
        }

        let mut events = Vec::new();

        let existing = store.get_tag_record(&mut tx, &new_id).await?;
        let target_op = match &existing {
            Some(t) if !t.deleted => None,
            Some(_) => Some(ChangeOp::Update),
            None => Some(ChangeOp::Create),
        };

        // Free the unique label-hash slot only after the old row is gone
        store
            .tombstone_tag(&mut tx, id, next_timestamp(old.updated_at), device)
            .await?;
        store.append_outbox(&mut tx, EntityKind::Tag, id, ChangeOp::Delete).await?;
        events.push(ChangeEvent::new(EntityKind::Tag, id, ChangeKind::Deleted, ChangeOrigin::Migration));

        if let Some(op) = target_op {
            let aad = AccountKeyService::field_aad("tag", &new_id, "label");
            let record = TagRecord {
                id: new_id.clone(),
                label_enc: self.encrypt_field(label.as_bytes(), &aad)?,
                label_hash: digest,
                scheme: SCHEME_ACCOUNT_KEY as i64,
                created_at: existing.as_ref().map(|t| t.created_at).unwrap_or(old.created_at),
                updated_at: existing
                    .as_ref()
                    .map(|t| next_timestamp(t.updated_at))
                    .unwrap_or_else(chrono::Utc::now),
                deleted: false,
                origin_device: device.to_string(),
            };
            store.upsert_tag(&mut tx, &record).await?;
            store.append_outbox(&mut tx, EntityKind::Tag, &new_id, op).await?;
            events.push(ChangeEvent::new(EntityKind::Tag, &new_id, ChangeKind::Created, ChangeOrigin::Migration));
        }

        store.repoint_tag(&mut tx, id, &new_id).await?;
        for note_id in &note_ids {
            // The note's tag set changed, so it needs a newer version too
            if let Some(note) = store.get_note_record(&mut tx, note_id).await? {
                store
                    .touch_note(&mut tx, note_id, next_timestamp(note.updated_at), device)
                    .await?;
            }
            store.append_outbox(&mut tx, EntityKind::Note, note_id, ChangeOp::Update).await?;
            events.push(ChangeEvent::new(EntityKind::Note, note_id, ChangeKind::Updated, ChangeOrigin::Migration));
        }

        tx.commit().await?;

        tracing::debug!("Migrated tag {} -> {} ({} notes)", id, new_id, note_ids.len());
        Ok(events)
    }

    /// Decrypt a legacy blob and seal it again under the AMK
    fn reseal(&self, blob: &[u8], entity: &str, id: &str, field: &str) -> Result<Vec<u8>> {
        let aad = AccountKeyService::field_aad(entity, id, field);
        let plaintext = zeroize::Zeroizing::new(self.decrypt_field(blob, &aad)?);
        self.encrypt_field(&plaintext, &aad)
    }
}
