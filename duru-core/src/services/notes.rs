//! Notes repository
//!
//! CRUD over the local encrypted store for notes, tags and folders.
//! Every write encrypts under the session AMK, persists, and appends its
//! outbox entry in one transaction, then publishes change events once the
//! transaction has committed.

use crate::config::SCHEME_ACCOUNT_KEY;
use crate::database::{
    ChangeOp, EntityKind, Folder, FolderRecord, LocalStore, Note, NoteMetadata, NoteRecord, Tag,
    TagCount, TagRecord,
};
use crate::error::{AppError, Result};
use crate::events::{ChangeBus, ChangeEvent, ChangeKind, ChangeOrigin};
use crate::services::account_keys::AccountKeyService;
use chrono::{DateTime, Duration, Utc};
use sqlx::SqliteConnection;
use std::sync::Arc;

/// Lock id serialising structural folder changes (create, move, delete)
pub(crate) const FOLDER_TREE_LOCK: &str = "*tree*";

/// Tag id for a label digest. Equal labels produce equal ids on every
/// device of the account.
pub(crate) fn tag_id_for_digest(digest: &str) -> String {
    format!("tag-{}", &digest[..digest.len().min(32)])
}

/// Strictly later than `prev`, so a local edit always orders after the
/// version it replaced
pub(crate) fn next_timestamp(prev: DateTime<Utc>) -> DateTime<Utc> {
    let now = Utc::now();
    if now > prev {
        now
    } else {
        prev + Duration::microseconds(1)
    }
}

fn note_aad(id: &str, field: &str) -> Vec<u8> {
    AccountKeyService::field_aad("note", id, field)
}

fn folder_aad(id: &str) -> Vec<u8> {
    AccountKeyService::field_aad("folder", id, "name")
}

fn tag_aad(id: &str) -> Vec<u8> {
    AccountKeyService::field_aad("tag", id, "label")
}

/// Repository for notes, tags and folders
#[derive(Clone)]
pub struct NotesRepository {
    store: LocalStore,
    keys: Arc<AccountKeyService>,
    bus: ChangeBus,
    device_id: String,
}

impl NotesRepository {
    pub fn new(store: LocalStore, keys: Arc<AccountKeyService>, bus: ChangeBus, device_id: impl Into<String>) -> Self {
        Self {
            store,
            keys,
            bus,
            device_id: device_id.into(),
        }
    }

    /// Device recorded as the origin of this repository's writes
    pub fn device_id(&self) -> &str {
        &self.device_id
    }

    pub(crate) fn bus(&self) -> &ChangeBus {
        &self.bus
    }

    fn publish(&self, events: Vec<ChangeEvent>) {
        for event in events {
            self.bus.publish(event);
        }
    }

    fn local_event(entity: EntityKind, id: &str, kind: ChangeKind) -> ChangeEvent {
        ChangeEvent::new(entity, id, kind, ChangeOrigin::Local)
    }

    // ===== Notes =====

    /// Create a note, or update the note with `id`. A given id that does not
    /// exist yet creates the note under that id.
    pub async fn create_or_update(
        &self,
        id: Option<&str>,
        title: &str,
        body: &str,
        is_pinned: bool,
    ) -> Result<Note> {
        let id = id
            .map(str::to_string)
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let _guard = self.store.lock_entity(EntityKind::Note, &id).await;
        let mut tx = self.store.begin().await?;

        let existing = self.store.get_note_record(&mut tx, &id).await?;
        if existing.as_ref().is_some_and(|r| r.deleted) {
            return Err(AppError::NoteNotFound(id));
        }

        let metadata = match &existing {
            Some(rec) => self.decrypt_metadata(rec)?,
            None => NoteMetadata::default(),
        };

        let now = Utc::now();
        let (created_at, updated_at, op) = match &existing {
            Some(rec) => (rec.created_at, next_timestamp(rec.updated_at), ChangeOp::Update),
            None => (now, now, ChangeOp::Create),
        };

        let record = NoteRecord {
            id: id.clone(),
            title_enc: self.keys.encrypt_field(title.as_bytes(), &note_aad(&id, "title"))?,
            body_enc: self.keys.encrypt_field(body.as_bytes(), &note_aad(&id, "body"))?,
            metadata_enc: self.seal_metadata(&id, &metadata)?,
            scheme: SCHEME_ACCOUNT_KEY as i64,
            is_pinned,
            created_at,
            updated_at,
            deleted: false,
            origin_device: self.device_id.clone(),
        };

        self.store.upsert_note(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Note, &id, op).await?;
        tx.commit().await?;

        let kind = match op {
            ChangeOp::Create => ChangeKind::Created,
            _ => ChangeKind::Updated,
        };
        self.publish(vec![Self::local_event(EntityKind::Note, &id, kind)]);

        tracing::debug!("Saved note {} ({:?})", id, op);

        Ok(Note {
            id,
            title: title.to_string(),
            body: body.to_string(),
            is_pinned,
            metadata,
            created_at,
            updated_at,
        })
    }

    /// Rewrite a note's body under its write lock. `edit` receives the
    /// current body and returns the replacement, or `None` to leave the note
    /// alone. Returns the saved note when the body changed.
    pub async fn edit_body<F>(&self, id: &str, edit: F) -> Result<Option<Note>>
    where
        F: FnOnce(&str) -> Result<Option<String>> + Send,
    {
        let _guard = self.store.lock_entity(EntityKind::Note, id).await;
        let mut tx = self.store.begin().await?;

        let mut record = self.require_live_note(&mut tx, id).await?;
        let current = self.decrypt_note(&record)?;
        let body = match edit(&current.body)? {
            Some(body) if body != current.body => body,
            _ => return Ok(None),
        };

        record.title_enc = self.keys.encrypt_field(current.title.as_bytes(), &note_aad(id, "title"))?;
        record.body_enc = self.keys.encrypt_field(body.as_bytes(), &note_aad(id, "body"))?;
        record.metadata_enc = self.seal_metadata(id, &current.metadata)?;
        record.scheme = SCHEME_ACCOUNT_KEY as i64;
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = self.device_id.clone();

        self.store.upsert_note(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Note, id, ChangeOp::Update).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Note, id, ChangeKind::Updated)]);

        Ok(Some(Note {
            body,
            updated_at: record.updated_at,
            ..current
        }))
    }

    /// Get a live note by id
    pub async fn get_note(&self, id: &str) -> Result<Note> {
        let mut conn = self.store.acquire().await?;
        match self.store.get_note_record(&mut conn, id).await? {
            Some(rec) if !rec.deleted => self.decrypt_note(&rec),
            _ => Err(AppError::NoteNotFound(id.to_string())),
        }
    }

    /// List live notes, pinned first then most recently updated
    pub async fn list_notes(&self) -> Result<Vec<Note>> {
        let records = {
            let mut conn = self.store.acquire().await?;
            self.store.list_note_records(&mut conn).await?
        };

        let mut notes: Vec<Note> = records
            .iter()
            .filter_map(|rec| match self.decrypt_note(rec) {
                Ok(note) => Some(note),
                Err(e) => {
                    tracing::warn!("Skipping unreadable note {}: {}", rec.id, e);
                    None
                }
            })
            .collect();

        notes.sort_by(|a, b| {
            b.is_pinned
                .cmp(&a.is_pinned)
                .then_with(|| b.updated_at.cmp(&a.updated_at))
        });
        Ok(notes)
    }

    /// Case-insensitive search over decrypted titles and bodies
    pub async fn search_notes(&self, query: &str) -> Result<Vec<Note>> {
        let needle = query.trim().to_lowercase();
        let notes = self.list_notes().await?;
        if needle.is_empty() {
            return Ok(notes);
        }

        Ok(notes
            .into_iter()
            .filter(|n| n.title.to_lowercase().contains(&needle) || n.body.to_lowercase().contains(&needle))
            .collect())
    }

    /// Replace a note's encrypted metadata (attachment references, source tags)
    pub async fn update_metadata(&self, id: &str, metadata: NoteMetadata) -> Result<Note> {
        let _guard = self.store.lock_entity(EntityKind::Note, id).await;
        let mut tx = self.store.begin().await?;

        let mut record = match self.store.get_note_record(&mut tx, id).await? {
            Some(rec) if !rec.deleted => rec,
            _ => return Err(AppError::NoteNotFound(id.to_string())),
        };

        // Re-seal every field so the row's scheme tag stays truthful
        let title = self.keys.decrypt_string(&record.title_enc, &note_aad(id, "title"))?;
        let body = self.keys.decrypt_string(&record.body_enc, &note_aad(id, "body"))?;
        record.title_enc = self.keys.encrypt_field(title.as_bytes(), &note_aad(id, "title"))?;
        record.body_enc = self.keys.encrypt_field(body.as_bytes(), &note_aad(id, "body"))?;
        record.metadata_enc = self.seal_metadata(id, &metadata)?;
        record.scheme = SCHEME_ACCOUNT_KEY as i64;
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = self.device_id.clone();

        self.store.upsert_note(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Note, id, ChangeOp::Update).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Note, id, ChangeKind::Updated)]);

        Ok(Note {
            id: id.to_string(),
            title,
            body,
            is_pinned: record.is_pinned,
            metadata,
            created_at: record.created_at,
            updated_at: record.updated_at,
        })
    }

    /// Delete a note (tombstone; purged once the remote confirms)
    pub async fn delete(&self, id: &str) -> Result<()> {
        tracing::info!("Deleting note: {}", id);

        let _guard = self.store.lock_entity(EntityKind::Note, id).await;
        let mut tx = self.store.begin().await?;

        let updated_at = match self.store.get_note_record(&mut tx, id).await? {
            Some(rec) if !rec.deleted => next_timestamp(rec.updated_at),
            _ => return Err(AppError::NoteNotFound(id.to_string())),
        };

        self.store.tombstone_note(&mut tx, id, updated_at, &self.device_id).await?;
        self.store.append_outbox(&mut tx, EntityKind::Note, id, ChangeOp::Delete).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Note, id, ChangeKind::Deleted)]);
        Ok(())
    }

    // ===== Tags =====

    /// Attach a tag to a note, creating the tag on first use
    pub async fn add_tag(&self, note_id: &str, label: &str) -> Result<Tag> {
        let label = validate_label(label)?;
        let digest = self.keys.label_digest(label)?;
        let tag_id = tag_id_for_digest(&digest);

        let _tag_guard = self.store.lock_entity(EntityKind::Tag, &tag_id).await;
        let _note_guard = self.store.lock_entity(EntityKind::Note, note_id).await;
        let mut tx = self.store.begin().await?;

        self.require_live_note(&mut tx, note_id).await?;

        let mut events = Vec::new();
        let tag = match self.store.get_tag_record(&mut tx, &tag_id).await? {
            Some(rec) if !rec.deleted => Tag {
                label: self.keys.decrypt_string(&rec.label_enc, &tag_aad(&tag_id))?,
                id: tag_id.clone(),
            },
            existing => {
                let op = if existing.is_some() { ChangeOp::Update } else { ChangeOp::Create };
                let now = Utc::now();
                let record = TagRecord {
                    id: tag_id.clone(),
                    label_enc: self.keys.encrypt_field(label.as_bytes(), &tag_aad(&tag_id))?,
                    label_hash: digest,
                    scheme: SCHEME_ACCOUNT_KEY as i64,
                    created_at: existing.as_ref().map(|r| r.created_at).unwrap_or(now),
                    updated_at: existing.as_ref().map(|r| next_timestamp(r.updated_at)).unwrap_or(now),
                    deleted: false,
                    origin_device: self.device_id.clone(),
                };
                self.store.upsert_tag(&mut tx, &record).await?;
                self.store.append_outbox(&mut tx, EntityKind::Tag, &tag_id, op).await?;
                events.push(Self::local_event(EntityKind::Tag, &tag_id, ChangeKind::Created));

                Tag {
                    id: tag_id.clone(),
                    label: label.to_string(),
                }
            }
        };

        if self.store.add_note_tag(&mut tx, note_id, &tag_id).await? {
            self.bump_note(&mut tx, note_id).await?;
            events.push(Self::local_event(EntityKind::Note, note_id, ChangeKind::Updated));
        }

        tx.commit().await?;
        self.publish(events);

        tracing::debug!("Tagged note {} with {}", note_id, tag_id);
        Ok(tag)
    }

    /// Detach a tag from a note. Returns false when the note did not carry it.
    pub async fn remove_tag(&self, note_id: &str, label: &str) -> Result<bool> {
        let label = validate_label(label)?;
        let tag_id = tag_id_for_digest(&self.keys.label_digest(label)?);

        let _tag_guard = self.store.lock_entity(EntityKind::Tag, &tag_id).await;
        let _note_guard = self.store.lock_entity(EntityKind::Note, note_id).await;
        let mut tx = self.store.begin().await?;

        self.require_live_note(&mut tx, note_id).await?;

        if !self.store.remove_note_tag(&mut tx, note_id, &tag_id).await? {
            return Ok(false);
        }
        self.bump_note(&mut tx, note_id).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Note, note_id, ChangeKind::Updated)]);
        Ok(true)
    }

    pub async fn get_tags_for_note(&self, note_id: &str) -> Result<Vec<Tag>> {
        let mut conn = self.store.acquire().await?;
        let records = self.store.tag_records_for_note(&mut conn, note_id).await?;

        let mut tags = records
            .iter()
            .map(|rec| self.decrypt_tag(rec))
            .collect::<Result<Vec<_>>>()?;
        tags.sort_by_key(|t| t.label.to_lowercase());
        Ok(tags)
    }

    /// Every live tag with the number of live notes carrying it
    pub async fn list_tags_with_counts(&self) -> Result<Vec<TagCount>> {
        let mut conn = self.store.acquire().await?;
        let records = self.store.tag_records_with_counts(&mut conn).await?;

        let mut counts = Vec::with_capacity(records.len());
        for (rec, note_count) in records {
            counts.push(TagCount {
                tag: self.decrypt_tag(&rec)?,
                note_count,
            });
        }
        counts.sort_by(|a, b| {
            b.note_count
                .cmp(&a.note_count)
                .then_with(|| a.tag.label.to_lowercase().cmp(&b.tag.label.to_lowercase()))
        });
        Ok(counts)
    }

    /// Rename a tag on every note carrying it. Returns the number of notes
    /// affected. Each affected note gets one outbox entry, however many tag
    /// rows change underneath.
    pub async fn rename_tag_everywhere(&self, from: &str, to: &str) -> Result<usize> {
        let from = validate_label(from)?;
        let to = validate_label(to)?;
        let from_id = tag_id_for_digest(&self.keys.label_digest(from)?);
        let to_digest = self.keys.label_digest(to)?;
        let to_id = tag_id_for_digest(&to_digest);

        let _tag_guards = self
            .store
            .lock_entities(EntityKind::Tag, &[from_id.clone(), to_id.clone()])
            .await;
        let note_ids = {
            let mut conn = self.store.acquire().await?;
            self.store.note_ids_for_tag(&mut conn, &from_id).await?
        };
        let _note_guards = self.store.lock_entities(EntityKind::Note, &note_ids).await;

        let mut tx = self.store.begin().await?;

        let old = match self.store.get_tag_record(&mut tx, &from_id).await? {
            Some(rec) if !rec.deleted => rec,
            _ => return Ok(0),
        };

        let mut events = Vec::new();

        if from_id == to_id {
            // Only the display label changes
            let mut record = old;
            record.label_enc = self.keys.encrypt_field(to.as_bytes(), &tag_aad(&to_id))?;
            record.scheme = SCHEME_ACCOUNT_KEY as i64;
            record.updated_at = next_timestamp(record.updated_at);
            record.origin_device = self.device_id.clone();
            self.store.upsert_tag(&mut tx, &record).await?;
            self.store.append_outbox(&mut tx, EntityKind::Tag, &to_id, ChangeOp::Update).await?;
            tx.commit().await?;

            self.publish(vec![Self::local_event(EntityKind::Tag, &to_id, ChangeKind::Updated)]);
            return Ok(note_ids.len());
        }

        self.store
            .tombstone_tag(&mut tx, &from_id, next_timestamp(old.updated_at), &self.device_id)
            .await?;
        self.store.append_outbox(&mut tx, EntityKind::Tag, &from_id, ChangeOp::Delete).await?;
        events.push(Self::local_event(EntityKind::Tag, &from_id, ChangeKind::Deleted));

        let target = self.store.get_tag_record(&mut tx, &to_id).await?;
        if !target.as_ref().is_some_and(|t| !t.deleted) {
            let op = if target.is_some() { ChangeOp::Update } else { ChangeOp::Create };
            let now = Utc::now();
            let record = TagRecord {
                id: to_id.clone(),
                label_enc: self.keys.encrypt_field(to.as_bytes(), &tag_aad(&to_id))?,
                label_hash: to_digest,
                scheme: SCHEME_ACCOUNT_KEY as i64,
                created_at: target.as_ref().map(|t| t.created_at).unwrap_or(now),
                updated_at: target.as_ref().map(|t| next_timestamp(t.updated_at)).unwrap_or(now),
                deleted: false,
                origin_device: self.device_id.clone(),
            };
            self.store.upsert_tag(&mut tx, &record).await?;
            self.store.append_outbox(&mut tx, EntityKind::Tag, &to_id, op).await?;
            events.push(Self::local_event(EntityKind::Tag, &to_id, ChangeKind::Created));
        }

        self.store.repoint_tag(&mut tx, &from_id, &to_id).await?;
        for note_id in &note_ids {
            self.bump_note(&mut tx, note_id).await?;
            events.push(Self::local_event(EntityKind::Note, note_id, ChangeKind::Updated));
        }

        tx.commit().await?;
        self.publish(events);

        tracing::info!("Renamed tag on {} notes", note_ids.len());
        Ok(note_ids.len())
    }

    // ===== Folders =====

    /// Create a folder, optionally nested under `parent_id`
    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
        color: Option<&str>,
        icon: Option<&str>,
    ) -> Result<Folder> {
        let id = uuid::Uuid::new_v4().to_string();

        let _tree = self.store.lock_entity(EntityKind::Folder, FOLDER_TREE_LOCK).await;
        let mut tx = self.store.begin().await?;

        if let Some(parent_id) = parent_id {
            self.require_live_folder(&mut tx, parent_id).await?;
        }

        let now = Utc::now();
        let record = FolderRecord {
            id: id.clone(),
            name_enc: self.keys.encrypt_field(name.as_bytes(), &folder_aad(&id))?,
            color: color.map(str::to_string),
            icon: icon.map(str::to_string),
            parent_id: parent_id.map(str::to_string),
            scheme: SCHEME_ACCOUNT_KEY as i64,
            created_at: now,
            updated_at: now,
            deleted: false,
            origin_device: self.device_id.clone(),
        };

        self.store.upsert_folder(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Folder, &id, ChangeOp::Create).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Folder, &id, ChangeKind::Created)]);

        tracing::info!("Created folder {}", id);
        self.folder_from_record(&record)
    }

    pub async fn rename_folder(&self, id: &str, name: &str) -> Result<Folder> {
        let _guard = self.store.lock_entity(EntityKind::Folder, id).await;
        let mut tx = self.store.begin().await?;

        let mut record = self.require_live_folder(&mut tx, id).await?;
        record.name_enc = self.keys.encrypt_field(name.as_bytes(), &folder_aad(id))?;
        record.scheme = SCHEME_ACCOUNT_KEY as i64;
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = self.device_id.clone();

        self.store.upsert_folder(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Folder, id, ChangeOp::Update).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Folder, id, ChangeKind::Updated)]);
        self.folder_from_record(&record)
    }

    /// Re-parent a folder. Moving a folder under itself or one of its
    /// descendants fails with `FolderCycle`.
    pub async fn move_folder(&self, id: &str, new_parent: Option<&str>) -> Result<Folder> {
        let _tree = self.store.lock_entity(EntityKind::Folder, FOLDER_TREE_LOCK).await;
        let _guard = self.store.lock_entity(EntityKind::Folder, id).await;
        let mut tx = self.store.begin().await?;

        let mut record = self.require_live_folder(&mut tx, id).await?;

        if let Some(parent_id) = new_parent {
            self.require_live_folder(&mut tx, parent_id).await?;
            let ancestors = self.store.folder_ancestors(&mut tx, parent_id).await?;
            if parent_id == id || ancestors.iter().any(|a| a == id) {
                return Err(AppError::FolderCycle {
                    folder_id: id.to_string(),
                    parent_id: parent_id.to_string(),
                });
            }
        }

        if record.parent_id.as_deref() == new_parent {
            return self.folder_from_record(&record);
        }

        record.parent_id = new_parent.map(str::to_string);
        record.updated_at = next_timestamp(record.updated_at);
        record.origin_device = self.device_id.clone();

        self.store.upsert_folder(&mut tx, &record).await?;
        self.store.append_outbox(&mut tx, EntityKind::Folder, id, ChangeOp::Update).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Folder, id, ChangeKind::Updated)]);
        self.folder_from_record(&record)
    }

    /// Delete a folder. Child folders move up to the deleted folder's
    /// parent and its notes become unfiled.
    pub async fn delete_folder(&self, id: &str) -> Result<()> {
        tracing::info!("Deleting folder: {}", id);

        let _tree = self.store.lock_entity(EntityKind::Folder, FOLDER_TREE_LOCK).await;
        let (children, note_ids) = {
            let mut conn = self.store.acquire().await?;
            (
                self.store.child_folder_ids(&mut conn, id).await?,
                self.store.note_ids_in_folder(&mut conn, id).await?,
            )
        };

        let mut folder_ids = children.clone();
        folder_ids.push(id.to_string());
        let _folder_guards = self.store.lock_entities(EntityKind::Folder, &folder_ids).await;
        let _note_guards = self.store.lock_entities(EntityKind::Note, &note_ids).await;

        let mut tx = self.store.begin().await?;
        let record = self.require_live_folder(&mut tx, id).await?;
        let mut events = Vec::new();

        for child_id in &children {
            if let Some(mut child) = self.store.get_folder_record(&mut tx, child_id).await? {
                child.parent_id = record.parent_id.clone();
                child.updated_at = next_timestamp(child.updated_at);
                child.origin_device = self.device_id.clone();
                self.store.upsert_folder(&mut tx, &child).await?;
                self.store.append_outbox(&mut tx, EntityKind::Folder, child_id, ChangeOp::Update).await?;
                events.push(Self::local_event(EntityKind::Folder, child_id, ChangeKind::Updated));
            }
        }

        for note_id in &note_ids {
            self.store.set_note_folder(&mut tx, note_id, None).await?;
            self.bump_note(&mut tx, note_id).await?;
            events.push(Self::local_event(EntityKind::Note, note_id, ChangeKind::Updated));
        }

        self.store
            .tombstone_folder(&mut tx, id, next_timestamp(record.updated_at), &self.device_id)
            .await?;
        self.store.append_outbox(&mut tx, EntityKind::Folder, id, ChangeOp::Delete).await?;
        events.push(Self::local_event(EntityKind::Folder, id, ChangeKind::Deleted));

        tx.commit().await?;
        self.publish(events);
        Ok(())
    }

    pub async fn list_folders(&self) -> Result<Vec<Folder>> {
        let mut conn = self.store.acquire().await?;
        let records = self.store.list_folder_records(&mut conn).await?;
        records.iter().map(|rec| self.folder_from_record(rec)).collect()
    }

    /// File a note under a folder, or unfile it with `None`
    pub async fn assign_note_to_folder(&self, note_id: &str, folder_id: Option<&str>) -> Result<()> {
        let _note_guard = self.store.lock_entity(EntityKind::Note, note_id).await;
        let mut tx = self.store.begin().await?;

        self.require_live_note(&mut tx, note_id).await?;
        if let Some(folder_id) = folder_id {
            self.require_live_folder(&mut tx, folder_id).await?;
        }

        let current = self.store.folder_id_for_note(&mut tx, note_id).await?;
        if current.as_deref() == folder_id {
            return Ok(());
        }

        self.store.set_note_folder(&mut tx, note_id, folder_id).await?;
        self.bump_note(&mut tx, note_id).await?;
        tx.commit().await?;

        self.publish(vec![Self::local_event(EntityKind::Note, note_id, ChangeKind::Updated)]);
        Ok(())
    }

    /// Folder a note is filed under; `None` for unfiled notes
    pub async fn folder_for_note(&self, note_id: &str) -> Result<Option<Folder>> {
        let mut conn = self.store.acquire().await?;
        let Some(folder_id) = self.store.folder_id_for_note(&mut conn, note_id).await? else {
            return Ok(None);
        };

        match self.store.get_folder_record(&mut conn, &folder_id).await? {
            Some(rec) if !rec.deleted => Ok(Some(self.folder_from_record(&rec)?)),
            _ => Ok(None),
        }
    }

    // ===== Internals =====

    async fn require_live_note(&self, conn: &mut SqliteConnection, id: &str) -> Result<NoteRecord> {
        match self.store.get_note_record(&mut *conn, id).await? {
            Some(rec) if !rec.deleted => Ok(rec),
            _ => Err(AppError::NoteNotFound(id.to_string())),
        }
    }

    async fn require_live_folder(&self, conn: &mut SqliteConnection, id: &str) -> Result<FolderRecord> {
        match self.store.get_folder_record(&mut *conn, id).await? {
            Some(rec) if !rec.deleted => Ok(rec),
            _ => Err(AppError::FolderNotFound(id.to_string())),
        }
    }

    /// Record a change to a note's tags or folder: newer timestamp, one
    /// outbox entry
    async fn bump_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<()> {
        let rec = self.require_live_note(&mut *conn, note_id).await?;
        self.store
            .touch_note(&mut *conn, note_id, next_timestamp(rec.updated_at), &self.device_id)
            .await?;
        self.store
            .append_outbox(&mut *conn, EntityKind::Note, note_id, ChangeOp::Update)
            .await?;
        Ok(())
    }

    fn decrypt_note(&self, rec: &NoteRecord) -> Result<Note> {
        Ok(Note {
            id: rec.id.clone(),
            title: self.keys.decrypt_string(&rec.title_enc, &note_aad(&rec.id, "title"))?,
            body: self.keys.decrypt_string(&rec.body_enc, &note_aad(&rec.id, "body"))?,
            is_pinned: rec.is_pinned,
            metadata: self.decrypt_metadata(rec)?,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
        })
    }

    fn decrypt_metadata(&self, rec: &NoteRecord) -> Result<NoteMetadata> {
        match &rec.metadata_enc {
            Some(blob) => {
                let json = self.keys.decrypt_field(blob, &note_aad(&rec.id, "metadata"))?;
                Ok(serde_json::from_slice(&json)?)
            }
            None => Ok(NoteMetadata::default()),
        }
    }

    fn seal_metadata(&self, id: &str, metadata: &NoteMetadata) -> Result<Option<Vec<u8>>> {
        if metadata == &NoteMetadata::default() {
            return Ok(None);
        }
        let json = serde_json::to_vec(metadata)?;
        Ok(Some(self.keys.encrypt_field(&json, &note_aad(id, "metadata"))?))
    }

    fn decrypt_tag(&self, rec: &TagRecord) -> Result<Tag> {
        Ok(Tag {
            id: rec.id.clone(),
            label: self.keys.decrypt_string(&rec.label_enc, &tag_aad(&rec.id))?,
        })
    }

    fn folder_from_record(&self, rec: &FolderRecord) -> Result<Folder> {
        Ok(Folder {
            id: rec.id.clone(),
            name: self.keys.decrypt_string(&rec.name_enc, &folder_aad(&rec.id))?,
            color: rec.color.clone(),
            icon: rec.icon.clone(),
            parent_id: rec.parent_id.clone(),
            created_at: rec.created_at,
            updated_at: rec.updated_at,
        })
    }
}

fn validate_label(label: &str) -> Result<&str> {
    let label = label.trim();
    if label.is_empty() {
        return Err(AppError::Generic("Tag label cannot be empty".to_string()));
    }
    Ok(label)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KdfParams;
    use crate::database::{create_memory_pool, AttachmentRef};
    use crate::services::key_manager::{InMemorySecureStorage, KeyManager};

    async fn create_test_repo() -> NotesRepository {
        let keys = AccountKeyService::new(
            "acct",
            KeyManager::new(Arc::new(InMemorySecureStorage::new())),
            KdfParams::for_test(),
        );
        keys.provision_account("pw").await.unwrap();

        let store = LocalStore::new(create_memory_pool().await.unwrap());
        NotesRepository::new(store, Arc::new(keys), ChangeBus::new(), "dev-a")
    }

    async fn outbox_len(repo: &NotesRepository) -> i64 {
        let mut conn = repo.store.acquire().await.unwrap();
        repo.store.outbox_len(&mut conn).await.unwrap()
    }

    #[tokio::test]
    async fn test_create_and_get_note() {
        let repo = create_test_repo().await;

        let note = repo.create_or_update(None, "Test Note", "Hello", false).await.unwrap();
        assert_eq!(note.title, "Test Note");

        let fetched = repo.get_note(&note.id).await.unwrap();
        assert_eq!(fetched.body, "Hello");
        assert_eq!(outbox_len(&repo).await, 1);
    }

    #[tokio::test]
    async fn test_content_is_ciphertext_at_rest() {
        let repo = create_test_repo().await;
        let note = repo.create_or_update(None, "Secret title", "Secret body", false).await.unwrap();

        let mut conn = repo.store.acquire().await.unwrap();
        let rec = repo.store.get_note_record(&mut conn, &note.id).await.unwrap().unwrap();
        assert!(!rec.title_enc.windows(6).any(|w| w == b"Secret"));
        assert!(!rec.body_enc.windows(6).any(|w| w == b"Secret"));
        assert_eq!(rec.scheme, SCHEME_ACCOUNT_KEY as i64);
    }

    #[tokio::test]
    async fn test_update_keeps_created_at_and_orders_later() {
        let repo = create_test_repo().await;
        let first = repo.create_or_update(Some("n1"), "A", "1", false).await.unwrap();
        let second = repo.create_or_update(Some("n1"), "B", "2", true).await.unwrap();

        assert_eq!(second.id, "n1");
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert!(repo.get_note("n1").await.unwrap().is_pinned);
    }

    #[tokio::test]
    async fn test_edit_body_sees_latest_body() {
        let repo = create_test_repo().await;
        repo.create_or_update(Some("n1"), "List", "- [ ] a", true).await.unwrap();
        repo.create_or_update(Some("n1"), "List", "- [ ] a\n- [ ] b", true).await.unwrap();
        let before = outbox_len(&repo).await;

        let edited = repo
            .edit_body("n1", |body| Ok(Some(body.replace("- [ ] a", "- [x] a"))))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(edited.body, "- [x] a\n- [ ] b");
        assert_eq!(edited.title, "List");
        assert!(edited.is_pinned);
        assert_eq!(outbox_len(&repo).await, before + 1);

        // No change, no write
        assert!(repo.edit_body("n1", |_| Ok(None)).await.unwrap().is_none());
        let same = repo.edit_body("n1", |body| Ok(Some(body.to_string()))).await.unwrap();
        assert!(same.is_none());
        assert_eq!(outbox_len(&repo).await, before + 1);

        let err = repo.edit_body("missing", |_| Ok(None)).await.unwrap_err();
        assert!(matches!(err, AppError::NoteNotFound(_)));
    }

    #[tokio::test]
    async fn test_locked_session_writes_nothing() {
        let repo = create_test_repo().await;
        repo.keys.lock();

        let err = repo.create_or_update(None, "t", "b", false).await.unwrap_err();
        assert!(matches!(err, AppError::Locked));
        assert!(repo.list_notes().await.unwrap().is_empty());
        assert_eq!(outbox_len(&repo).await, 0);
    }

    #[tokio::test]
    async fn test_delete_tombstones_and_enqueues() {
        let repo = create_test_repo().await;
        let note = repo.create_or_update(None, "t", "b", false).await.unwrap();

        repo.delete(&note.id).await.unwrap();
        assert!(matches!(repo.get_note(&note.id).await, Err(AppError::NoteNotFound(_))));
        assert!(matches!(repo.delete(&note.id).await, Err(AppError::NoteNotFound(_))));
        assert!(matches!(
            repo.create_or_update(Some(&note.id), "t", "b", false).await,
            Err(AppError::NoteNotFound(_))
        ));
        assert_eq!(outbox_len(&repo).await, 2);
    }

    #[tokio::test]
    async fn test_list_and_search() {
        let repo = create_test_repo().await;
        repo.create_or_update(None, "Rust Programming", "Learning Rust", false).await.unwrap();
        let pinned = repo.create_or_update(None, "Shopping", "Milk", true).await.unwrap();

        let notes = repo.list_notes().await.unwrap();
        assert_eq!(notes.len(), 2);
        assert_eq!(notes[0].id, pinned.id);

        let hits = repo.search_notes("rust").await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].title, "Rust Programming");
        assert_eq!(repo.search_notes("milk").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_metadata_round_trip() {
        let repo = create_test_repo().await;
        let note = repo.create_or_update(None, "t", "b", false).await.unwrap();

        let metadata = NoteMetadata {
            attachments: vec![AttachmentRef {
                id: "a1".into(),
                filename: "scan.pdf".into(),
                mime_type: "application/pdf".into(),
                size: 1024,
                blob_hash: "abc".into(),
            }],
            source_tags: vec!["email".into()],
        };
        repo.update_metadata(&note.id, metadata.clone()).await.unwrap();

        // Survives a later content edit
        repo.create_or_update(Some(&note.id), "t2", "b2", false).await.unwrap();
        assert_eq!(repo.get_note(&note.id).await.unwrap().metadata, metadata);
    }

    #[tokio::test]
    async fn test_tags_are_case_normalized() {
        let repo = create_test_repo().await;
        let a = repo.create_or_update(None, "a", "", false).await.unwrap();
        let b = repo.create_or_update(None, "b", "", false).await.unwrap();

        let t1 = repo.add_tag(&a.id, "Work").await.unwrap();
        let t2 = repo.add_tag(&b.id, "work").await.unwrap();
        assert_eq!(t1.id, t2.id);
        assert_eq!(t2.label, "Work");

        let counts = repo.list_tags_with_counts().await.unwrap();
        assert_eq!(counts.len(), 1);
        assert_eq!(counts[0].note_count, 2);

        assert!(repo.remove_tag(&a.id, "WORK").await.unwrap());
        assert!(!repo.remove_tag(&a.id, "work").await.unwrap());
        assert!(repo.get_tags_for_note(&a.id).await.unwrap().is_empty());
        assert_eq!(repo.get_tags_for_note(&b.id).await.unwrap()[0].label, "Work");
    }

    #[tokio::test]
    async fn test_rename_tag_enqueues_one_entry_per_note() {
        let repo = create_test_repo().await;
        let mut ids = Vec::new();
        for i in 0..3 {
            let note = repo.create_or_update(None, &format!("n{}", i), "", false).await.unwrap();
            repo.add_tag(&note.id, "draft").await.unwrap();
            ids.push(note.id);
        }
        repo.add_tag(&ids[0], "final").await.unwrap();

        let before = outbox_len(&repo).await;
        let affected = repo.rename_tag_everywhere("draft", "final").await.unwrap();
        assert_eq!(affected, 3);

        // One per note, plus the tombstone of "draft"
        assert_eq!(outbox_len(&repo).await - before, 4);

        for id in &ids {
            let tags = repo.get_tags_for_note(id).await.unwrap();
            assert_eq!(tags.len(), 1);
            assert_eq!(tags[0].label, "final");
        }
        assert_eq!(repo.rename_tag_everywhere("draft", "x").await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_rename_tag_case_only() {
        let repo = create_test_repo().await;
        let note = repo.create_or_update(None, "n", "", false).await.unwrap();
        repo.add_tag(&note.id, "todo").await.unwrap();

        assert_eq!(repo.rename_tag_everywhere("todo", "TODO").await.unwrap(), 1);
        assert_eq!(repo.get_tags_for_note(&note.id).await.unwrap()[0].label, "TODO");
    }

    #[tokio::test]
    async fn test_folder_cycle_is_rejected() {
        let repo = create_test_repo().await;
        let root = repo.create_folder("Root", None, None, None).await.unwrap();
        let child = repo.create_folder("Child", Some(&root.id), Some("#ff0000"), None).await.unwrap();
        let grandchild = repo.create_folder("Grandchild", Some(&child.id), None, None).await.unwrap();

        for target in [&root.id, &grandchild.id] {
            let err = repo.move_folder(&root.id, Some(target)).await.unwrap_err();
            assert!(matches!(err, AppError::FolderCycle { .. }));
        }

        let moved = repo.move_folder(&grandchild.id, None).await.unwrap();
        assert!(moved.parent_id.is_none());
    }

    #[tokio::test]
    async fn test_delete_folder_reparents_and_unfiles() {
        let repo = create_test_repo().await;
        let root = repo.create_folder("Root", None, None, None).await.unwrap();
        let mid = repo.create_folder("Mid", Some(&root.id), None, None).await.unwrap();
        let leaf = repo.create_folder("Leaf", Some(&mid.id), None, None).await.unwrap();
        let note = repo.create_or_update(None, "n", "", false).await.unwrap();
        repo.assign_note_to_folder(&note.id, Some(&mid.id)).await.unwrap();
        assert_eq!(repo.folder_for_note(&note.id).await.unwrap().unwrap().name, "Mid");

        repo.delete_folder(&mid.id).await.unwrap();

        let folders = repo.list_folders().await.unwrap();
        assert_eq!(folders.len(), 2);
        let leaf_after = folders.iter().find(|f| f.id == leaf.id).unwrap();
        assert_eq!(leaf_after.parent_id.as_deref(), Some(root.id.as_str()));
        assert!(repo.folder_for_note(&note.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_assign_to_missing_folder_fails_cleanly() {
        let repo = create_test_repo().await;
        let note = repo.create_or_update(None, "n", "", false).await.unwrap();
        let before = outbox_len(&repo).await;

        let err = repo.assign_note_to_folder(&note.id, Some("nope")).await.unwrap_err();
        assert!(matches!(err, AppError::FolderNotFound(_)));
        assert_eq!(outbox_len(&repo).await, before);
    }

    #[tokio::test]
    async fn test_events_published_after_commit() {
        let repo = create_test_repo().await;
        let mut rx = repo.bus.subscribe();

        let note = repo.create_or_update(None, "n", "", false).await.unwrap();
        let event = rx.recv().await.unwrap();
        assert_eq!(event.id, note.id);
        assert_eq!(event.kind, ChangeKind::Created);
        assert_eq!(event.origin, ChangeOrigin::Local);
    }
}
