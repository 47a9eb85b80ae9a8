//! Wire form of synced entities
//!
//! Only ciphertext envelopes, ids, timestamps and structural fields leave
//! the device. Binary fields are base64 in JSON.

use crate::database::{EntityKind, FolderRecord, NoteRecord, TagRecord};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotePayload {
    #[serde(with = "crate::encoding::b64")]
    pub title_enc: Vec<u8>,
    #[serde(with = "crate::encoding::b64")]
    pub body_enc: Vec<u8>,
    #[serde(with = "crate::encoding::b64_opt", default)]
    pub metadata_enc: Option<Vec<u8>>,
    pub scheme: i64,
    pub is_pinned: bool,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub folder_id: Option<String>,
    #[serde(default)]
    pub tag_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FolderPayload {
    #[serde(with = "crate::encoding::b64")]
    pub name_enc: Vec<u8>,
    pub color: Option<String>,
    pub icon: Option<String>,
    pub parent_id: Option<String>,
    pub scheme: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TagPayload {
    #[serde(with = "crate::encoding::b64")]
    pub label_enc: Vec<u8>,
    pub label_hash: String,
    pub scheme: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum EntityPayload {
    Note(NotePayload),
    Folder(FolderPayload),
    Tag(TagPayload),
}

/// One entity version as exchanged with the backend
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteChange {
    pub entity_type: EntityKind,
    pub entity_id: String,
    pub updated_at: DateTime<Utc>,
    pub origin_device: String,
    pub deleted: bool,
    /// Absent for deletes
    #[serde(default)]
    pub payload: Option<EntityPayload>,
}

impl RemoteChange {
    pub fn from_note(rec: &NoteRecord, folder_id: Option<String>, tag_ids: Vec<String>) -> Self {
        Self {
            entity_type: EntityKind::Note,
            entity_id: rec.id.clone(),
            updated_at: rec.updated_at,
            origin_device: rec.origin_device.clone(),
            deleted: rec.deleted,
            payload: (!rec.deleted).then(|| {
                EntityPayload::Note(NotePayload {
                    title_enc: rec.title_enc.clone(),
                    body_enc: rec.body_enc.clone(),
                    metadata_enc: rec.metadata_enc.clone(),
                    scheme: rec.scheme,
                    is_pinned: rec.is_pinned,
                    created_at: rec.created_at,
                    folder_id,
                    tag_ids,
                })
            }),
        }
    }

    pub fn from_folder(rec: &FolderRecord) -> Self {
        Self {
            entity_type: EntityKind::Folder,
            entity_id: rec.id.clone(),
            updated_at: rec.updated_at,
            origin_device: rec.origin_device.clone(),
            deleted: rec.deleted,
            payload: (!rec.deleted).then(|| {
                EntityPayload::Folder(FolderPayload {
                    name_enc: rec.name_enc.clone(),
                    color: rec.color.clone(),
                    icon: rec.icon.clone(),
                    parent_id: rec.parent_id.clone(),
                    scheme: rec.scheme,
                    created_at: rec.created_at,
                })
            }),
        }
    }

    pub fn from_tag(rec: &TagRecord) -> Self {
        Self {
            entity_type: EntityKind::Tag,
            entity_id: rec.id.clone(),
            updated_at: rec.updated_at,
            origin_device: rec.origin_device.clone(),
            deleted: rec.deleted,
            payload: (!rec.deleted).then(|| {
                EntityPayload::Tag(TagPayload {
                    label_enc: rec.label_enc.clone(),
                    label_hash: rec.label_hash.clone(),
                    scheme: rec.scheme,
                    created_at: rec.created_at,
                })
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delete_carries_no_payload() {
        let now = Utc::now();
        let rec = TagRecord {
            id: "t1".into(),
            label_enc: vec![2, 1],
            label_hash: "h".into(),
            scheme: 2,
            created_at: now,
            updated_at: now,
            deleted: true,
            origin_device: "dev".into(),
        };
        let change = RemoteChange::from_tag(&rec);
        assert!(change.deleted);
        assert!(change.payload.is_none());
    }

    #[test]
    fn test_payload_is_tagged_and_encoded() {
        let now = Utc::now();
        let rec = FolderRecord {
            id: "f1".into(),
            name_enc: vec![2, 0, 255],
            color: Some("#fff".into()),
            icon: None,
            parent_id: None,
            scheme: 2,
            created_at: now,
            updated_at: now,
            deleted: false,
            origin_device: "dev".into(),
        };
        let json = serde_json::to_value(RemoteChange::from_folder(&rec)).unwrap();
        assert_eq!(json["entity_type"], "folder");
        assert_eq!(json["payload"]["kind"], "folder");
        assert_eq!(json["payload"]["name_enc"], "AgD/");
    }
}
