//! Database models
//!
//! `*Record` structs mirror table rows and carry ciphertext envelopes.
//! The plain structs (`Note`, `Folder`, `Tag`, `Task`) are the decrypted
//! in-memory views handed to collaborators.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Entity types that are synced through the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum EntityKind {
    Folder,
    Tag,
    Note,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Folder => "folder",
            EntityKind::Tag => "tag",
            EntityKind::Note => "note",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "folder" => Ok(EntityKind::Folder),
            "tag" => Ok(EntityKind::Tag),
            "note" => Ok(EntityKind::Note),
            other => Err(format!("Unknown entity type: {}", other)),
        }
    }
}

/// Kind of local mutation recorded in the outbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(rename_all = "lowercase")]
pub enum ChangeOp {
    Create,
    Update,
    Delete,
}

/// Note row as stored: title, body and metadata are ciphertext envelopes
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct NoteRecord {
    pub id: String,
    pub title_enc: Vec<u8>,
    pub body_enc: Vec<u8>,
    pub metadata_enc: Option<Vec<u8>>,
    pub scheme: i64,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub origin_device: String,
}

/// Reference to an attachment blob held outside the core
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRef {
    pub id: String,
    pub filename: String,
    pub mime_type: String,
    pub size: i64,
    /// SHA-256 of the attachment content
    pub blob_hash: String,
}

/// Encrypted per-note metadata
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NoteMetadata {
    #[serde(default)]
    pub attachments: Vec<AttachmentRef>,
    /// Where the note came from ("email", "web_clip", "voice", ...)
    #[serde(default)]
    pub source_tags: Vec<String>,
}

/// Decrypted note
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    pub id: String,
    pub title: String,
    pub body: String,
    pub is_pinned: bool,
    pub metadata: NoteMetadata,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct FolderRecord {
    pub id: String,
    pub name_enc: Vec<u8>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub parent_id: Option<String>,
    pub scheme: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub origin_device: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Folder {
    pub id: String,
    pub name: String,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub parent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Tag row. `label_hash` is a keyed digest of the case-normalised label
/// and the id is derived from it, so equal labels collapse to one tag on
/// every device.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TagRecord {
    pub id: String,
    pub label_enc: Vec<u8>,
    pub label_hash: String,
    pub scheme: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted: bool,
    pub origin_device: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tag {
    pub id: String,
    pub label: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TagCount {
    pub tag: Tag,
    pub note_count: i64,
}

/// One pending local mutation awaiting push
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct OutboxEntry {
    pub seq: i64,
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub op: ChangeOp,
    pub created_at: DateTime<Utc>,
    pub retry_count: i64,
}

#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct TaskRecord {
    pub id: String,
    pub note_id: String,
    pub fingerprint: String,
    pub content_enc: Vec<u8>,
    pub line_index: i64,
    pub completed: bool,
    pub orphaned: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub reminder_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Decrypted task derived from a checklist line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub note_id: String,
    pub fingerprint: String,
    pub content: String,
    pub line_index: i64,
    pub completed: bool,
    /// Source line no longer present in the note body
    pub orphaned: bool,
    pub due_at: Option<DateTime<Utc>>,
    pub reminder_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}
