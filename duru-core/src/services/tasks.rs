//! Task sync coordinator
//!
//! Keeps the task table consistent with checklist lines in watched notes.
//! Note edits (local or pulled) create, complete and orphan tasks; toggling
//! a task rewrites the checkbox in the note body through the notes
//! repository, so the change is encrypted and synced like any other edit.

use crate::cancel::Cancellation;
use crate::database::{EntityKind, LocalStore, Task, TaskRecord};
use crate::error::{AppError, Result};
use crate::events::{ChangeBus, ChangeKind};
use crate::services::account_keys::AccountKeyService;
use crate::services::checklist::{self, ChecklistItem};
use crate::services::notes::NotesRepository;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::broadcast::error::RecvError;

/// What one reconciliation changed
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileOutcome {
    pub created: usize,
    pub updated: usize,
    pub orphaned: usize,
    pub restored: usize,
}

fn task_aad(id: &str) -> Vec<u8> {
    AccountKeyService::field_aad("task", id, "content")
}

#[derive(Clone)]
pub struct TaskSyncCoordinator {
    store: LocalStore,
    keys: Arc<AccountKeyService>,
    notes: NotesRepository,
    bus: ChangeBus,
    watched: Arc<Mutex<HashSet<String>>>,
}

impl TaskSyncCoordinator {
    pub fn new(store: LocalStore, keys: Arc<AccountKeyService>, notes: NotesRepository, bus: ChangeBus) -> Self {
        Self {
            store,
            keys,
            notes,
            bus,
            watched: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Watch a note and bring its tasks up to date. Watching an already
    /// watched note does nothing. A failed first reconciliation is returned
    /// but the note stays watched.
    pub async fn start_watching_note(&self, note_id: &str) -> Result<()> {
        let added = self
            .watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(note_id.to_string());
        if !added {
            return Ok(());
        }

        tracing::debug!("Watching note {} for tasks", note_id);
        self.reconcile_note(note_id).await.map(|_| ())
    }

    /// Returns false when the note was not watched
    pub fn stop_watching_note(&self, note_id: &str) -> bool {
        let removed = self
            .watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(note_id);
        if removed {
            tracing::debug!("Stopped watching note {}", note_id);
        }
        removed
    }

    pub fn is_watching(&self, note_id: &str) -> bool {
        self.watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(note_id)
    }

    fn watched_notes(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .watched
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    fn fingerprint(&self, item: &ChecklistItem) -> Result<String> {
        self.keys.content_digest("task-line", item.identity().as_bytes())
    }

    /// Diff the note's checklist lines against its tasks by fingerprint
    pub async fn reconcile_note(&self, note_id: &str) -> Result<ReconcileOutcome> {
        let _guard = self.store.lock_entity(EntityKind::Note, note_id).await;

        let note = match self.notes.get_note(note_id).await {
            Ok(note) => note,
            Err(AppError::NoteNotFound(_)) => {
                let mut conn = self.store.acquire().await?;
                let orphaned = self.store.orphan_tasks_for_note(&mut conn, note_id).await? as usize;
                return Ok(ReconcileOutcome {
                    orphaned,
                    ..ReconcileOutcome::default()
                });
            }
            Err(e) => return Err(e),
        };

        let items = checklist::parse(&note.body);
        let mut lines = HashMap::with_capacity(items.len());
        for item in &items {
            lines.insert(self.fingerprint(item)?, item);
        }

        let mut tx = self.store.begin().await?;
        let existing = self.store.task_records_for_note(&mut tx, note_id).await?;
        let mut outcome = ReconcileOutcome::default();
        let now = Utc::now();
        let mut seen = HashSet::new();

        for mut record in existing {
            match lines.get(&record.fingerprint) {
                Some(item) => {
                    seen.insert(record.fingerprint.clone());
                    let line_index = item.line_index as i64;
                    if record.orphaned {
                        outcome.restored += 1;
                    } else if record.completed == item.checked && record.line_index == line_index {
                        continue;
                    } else {
                        outcome.updated += 1;
                    }
                    record.orphaned = false;
                    record.completed = item.checked;
                    record.line_index = line_index;
                    record.updated_at = now;
                    self.store.upsert_task(&mut tx, &record).await?;
                }
                None if !record.orphaned => {
                    record.orphaned = true;
                    record.updated_at = now;
                    self.store.upsert_task(&mut tx, &record).await?;
                    outcome.orphaned += 1;
                }
                None => {}
            }
        }

        for (fingerprint, item) in &lines {
            if seen.contains(fingerprint) {
                continue;
            }
            let id = uuid::Uuid::new_v4().to_string();
            let record = TaskRecord {
                content_enc: self.keys.encrypt_field(item.text.as_bytes(), &task_aad(&id))?,
                id,
                note_id: note_id.to_string(),
                fingerprint: fingerprint.clone(),
                line_index: item.line_index as i64,
                completed: item.checked,
                orphaned: false,
                due_at: None,
                reminder_at: None,
                created_at: now,
                updated_at: now,
            };
            self.store.upsert_task(&mut tx, &record).await?;
            outcome.created += 1;
        }

        tx.commit().await?;

        if outcome != ReconcileOutcome::default() {
            tracing::debug!("Reconciled tasks for note {}: {:?}", note_id, outcome);
        }
        Ok(outcome)
    }

    /// Complete or reopen a task, rewriting its checkbox in the note body
    pub async fn set_task_completed(&self, task_id: &str, completed: bool) -> Result<Task> {
        let record = self.require_task(task_id).await?;

        if record.orphaned {
            tracing::warn!("Task {} has no source line; updating the task only", task_id);
        } else {
            self.rewrite_checkbox(&record, completed).await?;
        }

        {
            let mut conn = self.store.acquire().await?;
            self.store
                .set_task_completed(&mut conn, task_id, completed, Utc::now())
                .await?;
        }

        let record = self.require_task(task_id).await?;
        self.decrypt_task(&record)
    }

    /// Locate the task's line in the note's current body and flip its box.
    /// Runs inside the note's write lock, so a concurrent edit is either
    /// fully before or fully after the rewrite.
    async fn rewrite_checkbox(&self, record: &TaskRecord, completed: bool) -> Result<()> {
        let edited = self
            .notes
            .edit_body(&record.note_id, |body| {
                let mut line = None;
                for item in checklist::parse(body) {
                    if self.fingerprint(&item)? == record.fingerprint {
                        line = Some(item.line_index);
                        break;
                    }
                }
                let Some(line_index) = line else {
                    return Err(AppError::Generic(format!(
                        "Checklist line for task {} not found in note {}",
                        record.id, record.note_id
                    )));
                };

                checklist::set_checkbox(body, line_index, completed)
                    .map(Some)
                    .ok_or_else(|| AppError::Generic(format!("Line {} is not a checklist item", line_index)))
            })
            .await?;

        if edited.is_some() {
            tracing::debug!("Rewrote checkbox for task {} in note {}", record.id, record.note_id);
        }
        Ok(())
    }

    /// Set or clear due and reminder times
    pub async fn set_task_schedule(
        &self,
        task_id: &str,
        due_at: Option<DateTime<Utc>>,
        reminder_at: Option<DateTime<Utc>>,
    ) -> Result<Task> {
        {
            let mut conn = self.store.acquire().await?;
            if !self.store.set_task_schedule(&mut conn, task_id, due_at, reminder_at).await? {
                return Err(AppError::TaskNotFound(task_id.to_string()));
            }
        }
        let record = self.require_task(task_id).await?;
        self.decrypt_task(&record)
    }

    pub async fn tasks_for_note(&self, note_id: &str) -> Result<Vec<Task>> {
        let mut conn = self.store.acquire().await?;
        let records = self.store.task_records_for_note(&mut conn, note_id).await?;
        records.iter().map(|r| self.decrypt_task(r)).collect()
    }

    /// Incomplete, non-orphaned tasks across all notes, soonest due first
    pub async fn list_open_tasks(&self) -> Result<Vec<Task>> {
        let mut conn = self.store.acquire().await?;
        let records = self.store.open_task_records(&mut conn).await?;
        records.iter().map(|r| self.decrypt_task(r)).collect()
    }

    /// React to note changes on the bus until cancelled. A failure for one
    /// note is logged and the loop keeps going.
    pub async fn run(&self, cancel: Cancellation) {
        let mut rx = self.bus.subscribe();
        tracing::info!("Task coordinator started");

        loop {
            let received = tokio::select! {
                _ = cancel.cancelled() => break,
                received = rx.recv() => received,
            };

            match received {
                Ok(event) if event.entity == EntityKind::Note => {
                    if !self.is_watching(&event.id) {
                        continue;
                    }
                    if let Err(e) = self.reconcile_note(&event.id).await {
                        tracing::warn!("Task reconcile failed for note {}: {}", event.id, e);
                    }
                    if event.kind == ChangeKind::Deleted {
                        self.stop_watching_note(&event.id);
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!("Task coordinator missed {} events, rescanning watched notes", skipped);
                    for note_id in self.watched_notes() {
                        if let Err(e) = self.reconcile_note(&note_id).await {
                            tracing::warn!("Task reconcile failed for note {}: {}", note_id, e);
                        }
                    }
                }
                Err(RecvError::Closed) => break,
            }
        }

        tracing::info!("Task coordinator stopped");
    }

    async fn require_task(&self, task_id: &str) -> Result<TaskRecord> {
        let mut conn = self.store.acquire().await?;
        self.store
            .get_task_record(&mut conn, task_id)
            .await?
            .ok_or_else(|| AppError::TaskNotFound(task_id.to_string()))
    }

    fn decrypt_task(&self, rec: &TaskRecord) -> Result<Task> {
        Ok(Task {
            id: rec.id.clone(),
            note_id: rec.note_id.clone(),
            fingerprint: rec.fingerprint.clone(),
            content: self.keys.decrypt_string(&rec.content_enc, &task_aad(&rec.id))?,
            line_index: rec.line_index,
            completed: rec.completed,
            orphaned: rec.orphaned,
            due_at: rec.due_at,
            reminder_at: rec.reminder_at,
            created_at: rec.created_at,
            updated_at: rec.updated_at,
        })
    }
}
