//! Outbox and sync cursor
//!
//! Repository writes only append here. Removal, retry bookkeeping and the
//! cursor belong to the sync engine.

use super::models::{ChangeOp, EntityKind, OutboxEntry};
use super::store::LocalStore;
use crate::error::Result;
use chrono::Utc;
use sqlx::SqliteConnection;

impl LocalStore {
    /// Append one pending mutation; returns its local sequence number
    pub async fn append_outbox(
        &self,
        conn: &mut SqliteConnection,
        kind: EntityKind,
        entity_id: &str,
        op: ChangeOp,
    ) -> Result<i64> {
        let seq: i64 = sqlx::query_scalar(
            r#"
            INSERT INTO outbox (entity_type, entity_id, op, created_at)
            VALUES (?, ?, ?, ?)
            RETURNING seq
            "#,
        )
        .bind(kind)
        .bind(entity_id)
        .bind(op)
        .bind(Utc::now())
        .fetch_one(&mut *conn)
        .await?;

        tracing::debug!("Queued {:?} {} {} as #{}", op, kind, entity_id, seq);
        Ok(seq)
    }

    /// Oldest pending entries in local sequence order
    pub async fn pending_outbox(&self, conn: &mut SqliteConnection, limit: u32) -> Result<Vec<OutboxEntry>> {
        let entries = sqlx::query_as::<_, OutboxEntry>(
            r#"
            SELECT seq, entity_type, entity_id, op, created_at, retry_count
            FROM outbox ORDER BY seq ASC LIMIT ?
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&mut *conn)
        .await?;
        Ok(entries)
    }

    pub async fn outbox_len(&self, conn: &mut SqliteConnection) -> Result<i64> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM outbox")
            .fetch_one(&mut *conn)
            .await?;
        Ok(count)
    }

    pub async fn has_pending(&self, conn: &mut SqliteConnection, kind: EntityKind, entity_id: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM outbox WHERE entity_type = ? AND entity_id = ?",
        )
        .bind(kind)
        .bind(entity_id)
        .fetch_one(&mut *conn)
        .await?;
        Ok(count > 0)
    }

    /// Remove acknowledged entries
    pub async fn ack_outbox(&self, conn: &mut SqliteConnection, seqs: &[i64]) -> Result<()> {
        for seq in seqs {
            sqlx::query("DELETE FROM outbox WHERE seq = ?")
                .bind(seq)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Discard pending entries for an entity whose local edit lost a conflict
    pub async fn drop_pending(&self, conn: &mut SqliteConnection, kind: EntityKind, entity_id: &str) -> Result<u64> {
        let rows = sqlx::query("DELETE FROM outbox WHERE entity_type = ? AND entity_id = ?")
            .bind(kind)
            .bind(entity_id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(rows)
    }

    pub async fn record_push_failure(&self, conn: &mut SqliteConnection, seqs: &[i64], error: &str) -> Result<()> {
        for seq in seqs {
            sqlx::query("UPDATE outbox SET retry_count = retry_count + 1, last_error = ? WHERE seq = ?")
                .bind(error)
                .bind(seq)
                .execute(&mut *conn)
                .await?;
        }
        Ok(())
    }

    /// Tombstoned rows whose delete is no longer pending, i.e. confirmed
    /// by the backend
    pub async fn settled_tombstones(&self, conn: &mut SqliteConnection) -> Result<Vec<(EntityKind, String)>> {
        let rows = sqlx::query_as::<_, (EntityKind, String)>(
            r#"
            SELECT 'folder', id FROM folders f WHERE f.deleted = 1 AND NOT EXISTS
                (SELECT 1 FROM outbox o WHERE o.entity_type = 'folder' AND o.entity_id = f.id)
            UNION ALL
            SELECT 'tag', id FROM tags t WHERE t.deleted = 1 AND NOT EXISTS
                (SELECT 1 FROM outbox o WHERE o.entity_type = 'tag' AND o.entity_id = t.id)
            UNION ALL
            SELECT 'note', id FROM notes n WHERE n.deleted = 1 AND NOT EXISTS
                (SELECT 1 FROM outbox o WHERE o.entity_type = 'note' AND o.entity_id = n.id)
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(rows)
    }

    pub async fn clear_outbox(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM outbox").execute(&mut *conn).await?;
        Ok(())
    }

    // ===== Cursor =====

    pub async fn get_cursor(&self, conn: &mut SqliteConnection, account_id: &str) -> Result<Option<String>> {
        let cursor: Option<Option<String>> =
            sqlx::query_scalar("SELECT cursor FROM sync_state WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&mut *conn)
                .await?;
        Ok(cursor.flatten())
    }

    pub async fn set_cursor(&self, conn: &mut SqliteConnection, account_id: &str, cursor: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (account_id, cursor, last_pull_at) VALUES (?, ?, ?)
            ON CONFLICT(account_id) DO UPDATE SET
                cursor = excluded.cursor,
                last_pull_at = excluded.last_pull_at
            "#,
        )
        .bind(account_id)
        .bind(cursor)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn mark_pushed(&self, conn: &mut SqliteConnection, account_id: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (account_id, last_push_at) VALUES (?, ?)
            ON CONFLICT(account_id) DO UPDATE SET last_push_at = excluded.last_push_at
            "#,
        )
        .bind(account_id)
        .bind(Utc::now())
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    /// Drop every account's cursor and push/pull bookkeeping
    pub async fn clear_sync_state(&self, conn: &mut SqliteConnection) -> Result<()> {
        sqlx::query("DELETE FROM sync_state").execute(&mut *conn).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::create_memory_pool;

    #[tokio::test]
    async fn test_outbox_is_sequence_ordered() {
        let store = LocalStore::new(create_memory_pool().await.unwrap());
        let mut conn = store.acquire().await.unwrap();

        let a = store.append_outbox(&mut conn, EntityKind::Note, "n1", ChangeOp::Create).await.unwrap();
        let b = store.append_outbox(&mut conn, EntityKind::Folder, "f1", ChangeOp::Create).await.unwrap();
        let c = store.append_outbox(&mut conn, EntityKind::Note, "n1", ChangeOp::Update).await.unwrap();
        assert!(a < b && b < c);

        let pending = store.pending_outbox(&mut conn, 10).await.unwrap();
        let seqs: Vec<i64> = pending.iter().map(|e| e.seq).collect();
        assert_eq!(seqs, vec![a, b, c]);
        assert_eq!(pending[1].entity_type, EntityKind::Folder);
        assert_eq!(pending[2].op, ChangeOp::Update);

        store.ack_outbox(&mut conn, &[a, c]).await.unwrap();
        assert_eq!(store.outbox_len(&mut conn).await.unwrap(), 1);
        assert!(!store.has_pending(&mut conn, EntityKind::Note, "n1").await.unwrap());
        assert!(store.has_pending(&mut conn, EntityKind::Folder, "f1").await.unwrap());
    }

    #[tokio::test]
    async fn test_sequence_survives_ack_of_latest() {
        let store = LocalStore::new(create_memory_pool().await.unwrap());
        let mut conn = store.acquire().await.unwrap();

        let a = store.append_outbox(&mut conn, EntityKind::Note, "n1", ChangeOp::Create).await.unwrap();
        store.ack_outbox(&mut conn, &[a]).await.unwrap();
        let b = store.append_outbox(&mut conn, EntityKind::Note, "n1", ChangeOp::Update).await.unwrap();

        // AUTOINCREMENT never reuses an acknowledged sequence number
        assert!(b > a);
    }

    #[tokio::test]
    async fn test_cursor_round_trip_and_clear() {
        let store = LocalStore::new(create_memory_pool().await.unwrap());
        let mut conn = store.acquire().await.unwrap();

        assert!(store.get_cursor(&mut conn, "acct").await.unwrap().is_none());

        store.set_cursor(&mut conn, "acct", Some("42")).await.unwrap();
        assert_eq!(store.get_cursor(&mut conn, "acct").await.unwrap().as_deref(), Some("42"));

        store.clear_sync_state(&mut conn).await.unwrap();
        assert!(store.get_cursor(&mut conn, "acct").await.unwrap().is_none());
    }
}
