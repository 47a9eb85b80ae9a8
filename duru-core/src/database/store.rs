//! Local encrypted store
//!
//! Row-level access to notes, folders, tags and their join tables. Every
//! write method takes a connection so callers compose several writes (and
//! the outbox append) into one transaction. Content columns are opaque
//! ciphertext here; encryption happens one layer up.

use super::models::*;
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::{Sqlite, SqliteConnection, SqlitePool, Transaction};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;

type LockMap = HashMap<(EntityKind, String), Arc<tokio::sync::Mutex<()>>>;

/// Handle to the on-device database
#[derive(Clone)]
pub struct LocalStore {
    pool: SqlitePool,
    locks: Arc<Mutex<LockMap>>,
}

impl LocalStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            locks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Sqlite>> {
        Ok(self.pool.begin().await?)
    }

    pub async fn acquire(&self) -> Result<sqlx::pool::PoolConnection<Sqlite>> {
        Ok(self.pool.acquire().await?)
    }

    /// Take the write lock for one entity. Writers of different entities
    /// never wait on each other, and nothing here waits on a sync cycle.
    pub async fn lock_entity(&self, kind: EntityKind, id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
            // Drop locks nobody is holding or waiting on
            locks.retain(|_, l| Arc::strong_count(l) > 1);
            locks
                .entry((kind, id.to_string()))
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    /// Lock several entities in a stable order so concurrent multi-entity
    /// writers cannot deadlock
    pub async fn lock_entities(&self, kind: EntityKind, ids: &[String]) -> Vec<OwnedMutexGuard<()>> {
        let mut sorted: Vec<&String> = ids.iter().collect();
        sorted.sort();
        sorted.dedup();

        let mut guards = Vec::with_capacity(sorted.len());
        for id in sorted {
            guards.push(self.lock_entity(kind, id).await);
        }
        guards
    }

    // ===== Notes =====

    /// Fetch a note row, tombstoned or not
    pub async fn get_note_record(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<NoteRecord>> {
        let record = sqlx::query_as::<_, NoteRecord>("SELECT * FROM notes WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    /// Live notes, pinned first then most recently updated
    pub async fn list_note_records(&self, conn: &mut SqliteConnection) -> Result<Vec<NoteRecord>> {
        let records = sqlx::query_as::<_, NoteRecord>(
            r#"
            SELECT * FROM notes
            WHERE deleted = 0
            ORDER BY is_pinned DESC, updated_at DESC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    pub async fn upsert_note(&self, conn: &mut SqliteConnection, rec: &NoteRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO notes (id, title_enc, body_enc, metadata_enc, scheme, is_pinned,
                               created_at, updated_at, deleted, origin_device)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                title_enc = excluded.title_enc,
                body_enc = excluded.body_enc,
                metadata_enc = excluded.metadata_enc,
                scheme = excluded.scheme,
                is_pinned = excluded.is_pinned,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted,
                origin_device = excluded.origin_device
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.title_enc)
        .bind(&rec.body_enc)
        .bind(&rec.metadata_enc)
        .bind(rec.scheme)
        .bind(rec.is_pinned)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .bind(rec.deleted)
        .bind(&rec.origin_device)
        .execute(&mut *conn)
        .await?;

        tracing::debug!("Stored note: {}", rec.id);
        Ok(())
    }

    /// Bump a note's timestamp after a change to its tags or folder
    pub async fn touch_note(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
        device: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE notes SET updated_at = ?, origin_device = ? WHERE id = ? AND deleted = 0",
        )
        .bind(now)
        .bind(device)
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Mark a note deleted; the row stays until the delete is confirmed remotely
    pub async fn tombstone_note(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
        device: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE notes SET deleted = 1, updated_at = ?, origin_device = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(device)
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();

        if rows > 0 {
            tracing::debug!("Tombstoned note: {}", id);
        }
        Ok(rows > 0)
    }

    /// Remove a note row for good (mappings and tasks cascade)
    pub async fn purge_note(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM notes WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        tracing::debug!("Purged note: {}", id);
        Ok(())
    }

    pub async fn note_ids_with_scheme(&self, conn: &mut SqliteConnection, scheme: u8) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM notes WHERE scheme = ? ORDER BY id")
            .bind(scheme as i64)
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids)
    }

    // ===== Folders =====

    pub async fn get_folder_record(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<FolderRecord>> {
        let record = sqlx::query_as::<_, FolderRecord>("SELECT * FROM folders WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    pub async fn list_folder_records(&self, conn: &mut SqliteConnection) -> Result<Vec<FolderRecord>> {
        let records = sqlx::query_as::<_, FolderRecord>(
            "SELECT * FROM folders WHERE deleted = 0 ORDER BY created_at ASC",
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    pub async fn upsert_folder(&self, conn: &mut SqliteConnection, rec: &FolderRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO folders (id, name_enc, color, icon, parent_id, scheme,
                                 created_at, updated_at, deleted, origin_device)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                name_enc = excluded.name_enc,
                color = excluded.color,
                icon = excluded.icon,
                parent_id = excluded.parent_id,
                scheme = excluded.scheme,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted,
                origin_device = excluded.origin_device
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.name_enc)
        .bind(&rec.color)
        .bind(&rec.icon)
        .bind(&rec.parent_id)
        .bind(rec.scheme)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .bind(rec.deleted)
        .bind(&rec.origin_device)
        .execute(&mut *conn)
        .await?;

        tracing::debug!("Stored folder: {}", rec.id);
        Ok(())
    }

    /// Parent chain of a folder, nearest first. Stops at a repeated id so a
    /// corrupted tree cannot loop forever.
    pub async fn folder_ancestors(&self, conn: &mut SqliteConnection, id: &str) -> Result<Vec<String>> {
        let mut chain = Vec::new();
        let mut current = id.to_string();

        loop {
            let parent: Option<Option<String>> =
                sqlx::query_scalar("SELECT parent_id FROM folders WHERE id = ? AND deleted = 0")
                    .bind(&current)
                    .fetch_optional(&mut *conn)
                    .await?;

            match parent.flatten() {
                Some(p) if !chain.contains(&p) && p != id => {
                    chain.push(p.clone());
                    current = p;
                }
                Some(p) => {
                    chain.push(p);
                    break;
                }
                None => break,
            }
        }

        Ok(chain)
    }

    pub async fn child_folder_ids(&self, conn: &mut SqliteConnection, parent_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT id FROM folders WHERE parent_id = ? AND deleted = 0 ORDER BY id",
        )
        .bind(parent_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    pub async fn tombstone_folder(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
        device: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE folders SET deleted = 1, updated_at = ?, origin_device = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(device)
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn purge_folder(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM note_folders WHERE folder_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM folders WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;

        tracing::debug!("Purged folder: {}", id);
        Ok(())
    }

    pub async fn folder_ids_with_scheme(&self, conn: &mut SqliteConnection, scheme: u8) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM folders WHERE scheme = ? ORDER BY id")
            .bind(scheme as i64)
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids)
    }

    // ===== Note -> folder mapping =====

    pub async fn folder_id_for_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<Option<String>> {
        let folder_id = sqlx::query_scalar("SELECT folder_id FROM note_folders WHERE note_id = ?")
            .bind(note_id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(folder_id)
    }

    /// File a note under a folder, or unfile it with `None`
    pub async fn set_note_folder(
        &self,
        conn: &mut SqliteConnection,
        note_id: &str,
        folder_id: Option<&str>,
    ) -> Result<()> {
        match folder_id {
            Some(folder_id) => {
                sqlx::query(
                    r#"
                    INSERT INTO note_folders (note_id, folder_id) VALUES (?, ?)
                    ON CONFLICT(note_id) DO UPDATE SET folder_id = excluded.folder_id
                    "#,
                )
                .bind(note_id)
                .bind(folder_id)
                .execute(&mut *conn)
                .await?;
            }
            None => {
                sqlx::query("DELETE FROM note_folders WHERE note_id = ?")
                    .bind(note_id)
                    .execute(&mut *conn)
                    .await?;
            }
        }
        Ok(())
    }

    pub async fn note_ids_in_folder(&self, conn: &mut SqliteConnection, folder_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            "SELECT note_id FROM note_folders WHERE folder_id = ? ORDER BY note_id",
        )
        .bind(folder_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    // ===== Tags =====

    pub async fn get_tag_record(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<TagRecord>> {
        let record = sqlx::query_as::<_, TagRecord>("SELECT * FROM tags WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    pub async fn upsert_tag(&self, conn: &mut SqliteConnection, rec: &TagRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tags (id, label_enc, label_hash, scheme, created_at, updated_at,
                              deleted, origin_device)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                label_enc = excluded.label_enc,
                label_hash = excluded.label_hash,
                scheme = excluded.scheme,
                created_at = excluded.created_at,
                updated_at = excluded.updated_at,
                deleted = excluded.deleted,
                origin_device = excluded.origin_device
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.label_enc)
        .bind(&rec.label_hash)
        .bind(rec.scheme)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .bind(rec.deleted)
        .bind(&rec.origin_device)
        .execute(&mut *conn)
        .await?;

        tracing::debug!("Stored tag: {}", rec.id);
        Ok(())
    }

    pub async fn tombstone_tag(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        now: DateTime<Utc>,
        device: &str,
    ) -> Result<bool> {
        let rows = sqlx::query(
            r#"
            UPDATE tags SET deleted = 1, updated_at = ?, origin_device = ?
            WHERE id = ? AND deleted = 0
            "#,
        )
        .bind(now)
        .bind(device)
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    pub async fn purge_tag(&self, conn: &mut SqliteConnection, id: &str) -> Result<()> {
        sqlx::query("DELETE FROM note_tags WHERE tag_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        sqlx::query("DELETE FROM tags WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    pub async fn tag_ids_with_scheme(&self, conn: &mut SqliteConnection, scheme: u8) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT id FROM tags WHERE scheme = ? AND deleted = 0 ORDER BY id")
            .bind(scheme as i64)
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids)
    }

    /// Live tags attached to a note
    pub async fn tag_records_for_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<Vec<TagRecord>> {
        let records = sqlx::query_as::<_, TagRecord>(
            r#"
            SELECT t.* FROM tags t
            JOIN note_tags nt ON nt.tag_id = t.id
            WHERE nt.note_id = ? AND t.deleted = 0
            ORDER BY t.id
            "#,
        )
        .bind(note_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    /// Raw tag ids on a note, including ids whose tag row has not arrived yet
    pub async fn tag_ids_for_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar("SELECT tag_id FROM note_tags WHERE note_id = ? ORDER BY tag_id")
            .bind(note_id)
            .fetch_all(&mut *conn)
            .await?;
        Ok(ids)
    }

    /// Replace a note's tag set
    pub async fn set_note_tags(&self, conn: &mut SqliteConnection, note_id: &str, tag_ids: &[String]) -> Result<()> {
        sqlx::query("DELETE FROM note_tags WHERE note_id = ?")
            .bind(note_id)
            .execute(&mut *conn)
            .await?;

        for tag_id in tag_ids {
            sqlx::query("INSERT OR IGNORE INTO note_tags (note_id, tag_id) VALUES (?, ?)")
                .bind(note_id)
                .bind(tag_id)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Returns false when the note already had the tag
    pub async fn add_note_tag(&self, conn: &mut SqliteConnection, note_id: &str, tag_id: &str) -> Result<bool> {
        let rows = sqlx::query("INSERT OR IGNORE INTO note_tags (note_id, tag_id) VALUES (?, ?)")
            .bind(note_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Returns false when the note did not have the tag
    pub async fn remove_note_tag(&self, conn: &mut SqliteConnection, note_id: &str, tag_id: &str) -> Result<bool> {
        let rows = sqlx::query("DELETE FROM note_tags WHERE note_id = ? AND tag_id = ?")
            .bind(note_id)
            .bind(tag_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    /// Live notes carrying a tag
    pub async fn note_ids_for_tag(&self, conn: &mut SqliteConnection, tag_id: &str) -> Result<Vec<String>> {
        let ids = sqlx::query_scalar(
            r#"
            SELECT nt.note_id FROM note_tags nt
            JOIN notes n ON n.id = nt.note_id
            WHERE nt.tag_id = ? AND n.deleted = 0
            ORDER BY nt.note_id
            "#,
        )
        .bind(tag_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(ids)
    }

    /// Move every note from one tag to another; notes that already carry
    /// the target keep a single row
    pub async fn repoint_tag(&self, conn: &mut SqliteConnection, from_id: &str, to_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT OR IGNORE INTO note_tags (note_id, tag_id)
            SELECT note_id, ? FROM note_tags WHERE tag_id = ?
            "#,
        )
        .bind(to_id)
        .bind(from_id)
        .execute(&mut *conn)
        .await?;

        sqlx::query("DELETE FROM note_tags WHERE tag_id = ?")
            .bind(from_id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }

    /// Live tags with the number of live notes using each
    pub async fn tag_records_with_counts(&self, conn: &mut SqliteConnection) -> Result<Vec<(TagRecord, i64)>> {
        let records = sqlx::query_as::<_, TagRecord>("SELECT * FROM tags WHERE deleted = 0 ORDER BY id")
            .fetch_all(&mut *conn)
            .await?;

        let mut out = Vec::with_capacity(records.len());
        for record in records {
            let count: i64 = sqlx::query_scalar(
                r#"
                SELECT COUNT(*) FROM note_tags nt
                JOIN notes n ON n.id = nt.note_id
                WHERE nt.tag_id = ? AND n.deleted = 0
                "#,
            )
            .bind(&record.id)
            .fetch_one(&mut *conn)
            .await?;
            out.push((record, count));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{SCHEME_ACCOUNT_KEY, SCHEME_LEGACY_DEVICE};
    use crate::database::create_memory_pool;

    async fn create_test_store() -> LocalStore {
        LocalStore::new(create_memory_pool().await.unwrap())
    }

    fn note_record(id: &str, scheme: u8) -> NoteRecord {
        let now = Utc::now();
        NoteRecord {
            id: id.to_string(),
            title_enc: vec![scheme, 1, 2, 3],
            body_enc: vec![scheme, 4, 5, 6],
            metadata_enc: None,
            scheme: scheme as i64,
            is_pinned: false,
            created_at: now,
            updated_at: now,
            deleted: false,
            origin_device: "dev-a".to_string(),
        }
    }

    fn folder_record(id: &str, parent: Option<&str>) -> FolderRecord {
        let now = Utc::now();
        FolderRecord {
            id: id.to_string(),
            name_enc: vec![SCHEME_ACCOUNT_KEY, 9],
            color: None,
            icon: None,
            parent_id: parent.map(str::to_string),
            scheme: SCHEME_ACCOUNT_KEY as i64,
            created_at: now,
            updated_at: now,
            deleted: false,
            origin_device: "dev-a".to_string(),
        }
    }

    #[tokio::test]
    async fn test_upsert_and_get_note() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        let rec = note_record("n1", SCHEME_ACCOUNT_KEY);
        store.upsert_note(&mut conn, &rec).await.unwrap();

        let fetched = store.get_note_record(&mut conn, "n1").await.unwrap().unwrap();
        assert_eq!(fetched.title_enc, rec.title_enc);

        // Upsert twice leaves a single row
        store.upsert_note(&mut conn, &rec).await.unwrap();
        assert_eq!(store.list_note_records(&mut conn).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_tombstone_hides_note_until_purge() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        store.upsert_note(&mut conn, &note_record("n1", SCHEME_ACCOUNT_KEY)).await.unwrap();
        assert!(store.tombstone_note(&mut conn, "n1", Utc::now(), "dev-a").await.unwrap());
        assert!(!store.tombstone_note(&mut conn, "n1", Utc::now(), "dev-a").await.unwrap());

        assert!(store.list_note_records(&mut conn).await.unwrap().is_empty());
        assert!(store.get_note_record(&mut conn, "n1").await.unwrap().unwrap().deleted);

        store.purge_note(&mut conn, "n1").await.unwrap();
        assert!(store.get_note_record(&mut conn, "n1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_scheme_scan() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        store.upsert_note(&mut conn, &note_record("old", SCHEME_LEGACY_DEVICE)).await.unwrap();
        store.upsert_note(&mut conn, &note_record("new", SCHEME_ACCOUNT_KEY)).await.unwrap();

        let legacy = store.note_ids_with_scheme(&mut conn, SCHEME_LEGACY_DEVICE).await.unwrap();
        assert_eq!(legacy, vec!["old".to_string()]);
    }

    #[tokio::test]
    async fn test_folder_ancestors() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        store.upsert_folder(&mut conn, &folder_record("root", None)).await.unwrap();
        store.upsert_folder(&mut conn, &folder_record("mid", Some("root"))).await.unwrap();
        store.upsert_folder(&mut conn, &folder_record("leaf", Some("mid"))).await.unwrap();

        let chain = store.folder_ancestors(&mut conn, "leaf").await.unwrap();
        assert_eq!(chain, vec!["mid".to_string(), "root".to_string()]);
        assert!(store.folder_ancestors(&mut conn, "root").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_note_folder_mapping_and_cascade() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        store.upsert_note(&mut conn, &note_record("n1", SCHEME_ACCOUNT_KEY)).await.unwrap();
        store.upsert_folder(&mut conn, &folder_record("f1", None)).await.unwrap();

        store.set_note_folder(&mut conn, "n1", Some("f1")).await.unwrap();
        assert_eq!(store.folder_id_for_note(&mut conn, "n1").await.unwrap().as_deref(), Some("f1"));

        store.set_note_folder(&mut conn, "n1", None).await.unwrap();
        assert!(store.folder_id_for_note(&mut conn, "n1").await.unwrap().is_none());

        store.set_note_folder(&mut conn, "n1", Some("f1")).await.unwrap();
        store.purge_note(&mut conn, "n1").await.unwrap();
        assert!(store.note_ids_in_folder(&mut conn, "f1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_repoint_tag_merges_rows() {
        let store = create_test_store().await;
        let mut conn = store.acquire().await.unwrap();

        store.upsert_note(&mut conn, &note_record("n1", SCHEME_ACCOUNT_KEY)).await.unwrap();
        store.upsert_note(&mut conn, &note_record("n2", SCHEME_ACCOUNT_KEY)).await.unwrap();

        store.add_note_tag(&mut conn, "n1", "t-old").await.unwrap();
        store.add_note_tag(&mut conn, "n2", "t-old").await.unwrap();
        store.add_note_tag(&mut conn, "n2", "t-new").await.unwrap();

        store.repoint_tag(&mut conn, "t-old", "t-new").await.unwrap();

        assert_eq!(store.tag_ids_for_note(&mut conn, "n1").await.unwrap(), vec!["t-new".to_string()]);
        assert_eq!(store.tag_ids_for_note(&mut conn, "n2").await.unwrap(), vec!["t-new".to_string()]);
    }

    #[tokio::test]
    async fn test_entity_locks_are_per_entity() {
        let store = create_test_store().await;

        let a = store.lock_entity(EntityKind::Note, "a").await;
        // A different entity is not blocked by `a`
        let b = tokio::time::timeout(
            std::time::Duration::from_millis(100),
            store.lock_entity(EntityKind::Note, "b"),
        )
        .await;
        assert!(b.is_ok());

        // The same entity is
        let again = tokio::time::timeout(
            std::time::Duration::from_millis(50),
            store.lock_entity(EntityKind::Note, "a"),
        )
        .await;
        assert!(again.is_err());
        drop(a);
    }
}
