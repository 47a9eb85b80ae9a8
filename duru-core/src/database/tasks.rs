//! Task rows derived from checklist lines

use super::models::TaskRecord;
use super::store::LocalStore;
use crate::error::Result;
use chrono::{DateTime, Utc};
use sqlx::SqliteConnection;

impl LocalStore {
    pub async fn get_task_record(&self, conn: &mut SqliteConnection, id: &str) -> Result<Option<TaskRecord>> {
        let record = sqlx::query_as::<_, TaskRecord>("SELECT * FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(&mut *conn)
            .await?;
        Ok(record)
    }

    pub async fn task_records_for_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            "SELECT * FROM tasks WHERE note_id = ? ORDER BY line_index ASC, created_at ASC",
        )
        .bind(note_id)
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    /// Incomplete, non-orphaned tasks across all notes
    pub async fn open_task_records(&self, conn: &mut SqliteConnection) -> Result<Vec<TaskRecord>> {
        let records = sqlx::query_as::<_, TaskRecord>(
            r#"
            SELECT * FROM tasks
            WHERE completed = 0 AND orphaned = 0
            ORDER BY due_at IS NULL, due_at ASC, created_at ASC
            "#,
        )
        .fetch_all(&mut *conn)
        .await?;
        Ok(records)
    }

    pub async fn upsert_task(&self, conn: &mut SqliteConnection, rec: &TaskRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO tasks (id, note_id, fingerprint, content_enc, line_index, completed,
                               orphaned, due_at, reminder_at, created_at, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                content_enc = excluded.content_enc,
                line_index = excluded.line_index,
                completed = excluded.completed,
                orphaned = excluded.orphaned,
                due_at = excluded.due_at,
                reminder_at = excluded.reminder_at,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rec.id)
        .bind(&rec.note_id)
        .bind(&rec.fingerprint)
        .bind(&rec.content_enc)
        .bind(rec.line_index)
        .bind(rec.completed)
        .bind(rec.orphaned)
        .bind(rec.due_at)
        .bind(rec.reminder_at)
        .bind(rec.created_at)
        .bind(rec.updated_at)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    pub async fn set_task_completed(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        completed: bool,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let rows = sqlx::query("UPDATE tasks SET completed = ?, updated_at = ? WHERE id = ?")
            .bind(completed)
            .bind(now)
            .bind(id)
            .execute(&mut *conn)
            .await?
            .rows_affected();
        Ok(rows > 0)
    }

    pub async fn set_task_schedule(
        &self,
        conn: &mut SqliteConnection,
        id: &str,
        due_at: Option<DateTime<Utc>>,
        reminder_at: Option<DateTime<Utc>>,
    ) -> Result<bool> {
        let rows = sqlx::query(
            "UPDATE tasks SET due_at = ?, reminder_at = ?, updated_at = ? WHERE id = ?",
        )
        .bind(due_at)
        .bind(reminder_at)
        .bind(Utc::now())
        .bind(id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows > 0)
    }

    /// Orphan every task of a note, e.g. when the note is deleted
    pub async fn orphan_tasks_for_note(&self, conn: &mut SqliteConnection, note_id: &str) -> Result<u64> {
        let rows = sqlx::query(
            "UPDATE tasks SET orphaned = 1, updated_at = ? WHERE note_id = ? AND orphaned = 0",
        )
        .bind(Utc::now())
        .bind(note_id)
        .execute(&mut *conn)
        .await?
        .rows_affected();
        Ok(rows)
    }
}
