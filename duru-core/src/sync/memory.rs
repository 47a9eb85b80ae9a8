//! In-process backend
//!
//! Keeps an append-only change log for one account. The cursor is the log
//! length, so a push is stale whenever anyone appended since the pusher
//! last pulled. Several engines can share one instance to act as separate
//! devices. Failure injection hooks drive the retry and re-auth paths.

use super::backend::{ChangeNotification, PullBatch, PushBatch, PushOutcome, RemoteBackend, SessionToken};
use super::wire::RemoteChange;
use crate::error::{AppError, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const NOTIFICATION_BUFFER: usize = 64;

struct Inner {
    log: Vec<RemoteChange>,
    tokens: HashSet<String>,
    subscribers: Vec<mpsc::Sender<ChangeNotification>>,
    page_size: usize,
    latency: Duration,
    fail_next: u32,
    stale_next: u32,
    token_seq: u64,
    auth_calls: u32,
    push_calls: u32,
    pull_calls: u32,
}

pub struct InMemoryBackend {
    account_id: String,
    inner: Mutex<Inner>,
}

impl InMemoryBackend {
    pub fn new(account_id: impl Into<String>) -> Self {
        Self {
            account_id: account_id.into(),
            inner: Mutex::new(Inner {
                log: Vec::new(),
                tokens: HashSet::new(),
                subscribers: Vec::new(),
                page_size: usize::MAX,
                latency: Duration::ZERO,
                fail_next: 0,
                stale_next: 0,
                token_seq: 0,
                auth_calls: 0,
                push_calls: 0,
                pull_calls: 0,
            }),
        }
    }

    fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Append a change as if another device had pushed it
    pub fn inject_remote_change(&self, change: RemoteChange) {
        let mut inner = self.inner();
        Self::notify(&mut inner, &change);
        inner.log.push(change);
    }

    /// Fail the next `n` backend calls with a transient error
    pub fn fail_next(&self, n: u32) {
        self.inner().fail_next = n;
    }

    /// Reject the next `n` pushes as stale regardless of cursor
    pub fn reject_next_push_stale(&self, n: u32) {
        self.inner().stale_next = n;
    }

    /// Invalidate every issued session
    pub fn expire_sessions(&self) {
        self.inner().tokens.clear();
    }

    /// Close every notification channel
    pub fn disconnect_subscribers(&self) {
        self.inner().subscribers.clear();
    }

    /// Delay every pull by `latency` before answering
    pub fn set_latency(&self, latency: Duration) {
        self.inner().latency = latency;
    }

    pub fn set_page_size(&self, page_size: usize) {
        self.inner().page_size = page_size.max(1);
    }

    /// Snapshot of the full change log
    pub fn changes(&self) -> Vec<RemoteChange> {
        self.inner().log.clone()
    }

    pub fn head(&self) -> String {
        self.inner().log.len().to_string()
    }

    pub fn subscriber_count(&self) -> usize {
        let mut inner = self.inner();
        inner.subscribers.retain(|tx| !tx.is_closed());
        inner.subscribers.len()
    }

    pub fn auth_calls(&self) -> u32 {
        self.inner().auth_calls
    }

    pub fn push_calls(&self) -> u32 {
        self.inner().push_calls
    }

    pub fn pull_calls(&self) -> u32 {
        self.inner().pull_calls
    }

    fn notify(inner: &mut Inner, change: &RemoteChange) {
        let notification = ChangeNotification {
            entity_type: change.entity_type,
            entity_id: change.entity_id.clone(),
        };
        // A full buffer drops the notification; receivers pull everything anyway
        inner
            .subscribers
            .retain(|tx| !matches!(tx.try_send(notification.clone()), Err(mpsc::error::TrySendError::Closed(_))));
    }

    fn take_failure(inner: &mut Inner, operation: &str) -> Result<()> {
        if inner.fail_next > 0 {
            inner.fail_next -= 1;
            return Err(AppError::TransientNetwork(format!("injected {} failure", operation)));
        }
        Ok(())
    }

    fn check_session(&self, inner: &Inner, session: &SessionToken) -> Result<()> {
        if session.account_id != self.account_id {
            return Err(AppError::AccountMismatch {
                expected: self.account_id.clone(),
                actual: session.account_id.clone(),
            });
        }
        if !inner.tokens.contains(&session.token) {
            return Err(AppError::AuthExpired);
        }
        Ok(())
    }

    fn parse_cursor(cursor: Option<&str>) -> Result<usize> {
        match cursor {
            None => Ok(0),
            Some(c) => c
                .parse()
                .map_err(|_| AppError::Generic(format!("Malformed cursor: {}", c))),
        }
    }
}

#[async_trait]
impl RemoteBackend for InMemoryBackend {
    async fn authenticate(&self, account_id: &str) -> Result<SessionToken> {
        let mut inner = self.inner();
        inner.auth_calls += 1;
        Self::take_failure(&mut inner, "authenticate")?;

        if account_id != self.account_id {
            return Err(AppError::AccountMismatch {
                expected: self.account_id.clone(),
                actual: account_id.to_string(),
            });
        }

        inner.token_seq += 1;
        let token = format!("session-{}", inner.token_seq);
        inner.tokens.insert(token.clone());

        Ok(SessionToken {
            account_id: self.account_id.clone(),
            token,
            expires_at: None,
        })
    }

    async fn push(&self, session: &SessionToken, batch: PushBatch) -> Result<PushOutcome> {
        let mut inner = self.inner();
        inner.push_calls += 1;
        Self::take_failure(&mut inner, "push")?;
        self.check_session(&inner, session)?;

        if batch.account_id != self.account_id {
            return Err(AppError::AccountMismatch {
                expected: self.account_id.clone(),
                actual: batch.account_id,
            });
        }

        if inner.stale_next > 0 {
            inner.stale_next -= 1;
            return Ok(PushOutcome::StaleCursor);
        }
        if Self::parse_cursor(batch.cursor.as_deref())? != inner.log.len() {
            return Ok(PushOutcome::StaleCursor);
        }

        for change in batch.changes {
            Self::notify(&mut inner, &change);
            inner.log.push(change);
        }

        Ok(PushOutcome::Accepted {
            cursor: Some(inner.log.len().to_string()),
        })
    }

    async fn pull(&self, session: &SessionToken, since: Option<&str>) -> Result<PullBatch> {
        let latency = self.inner().latency;
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let mut inner = self.inner();
        inner.pull_calls += 1;
        Self::take_failure(&mut inner, "pull")?;
        self.check_session(&inner, session)?;

        let start = Self::parse_cursor(since)?.min(inner.log.len());
        let end = start.saturating_add(inner.page_size).min(inner.log.len());

        Ok(PullBatch {
            account_id: self.account_id.clone(),
            changes: inner.log[start..end].to_vec(),
            cursor: Some(end.to_string()),
            has_more: end < inner.log.len(),
        })
    }

    async fn subscribe(&self, session: &SessionToken) -> Result<mpsc::Receiver<ChangeNotification>> {
        let mut inner = self.inner();
        Self::take_failure(&mut inner, "subscribe")?;
        self.check_session(&inner, session)?;

        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        inner.subscribers.push(tx);
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::database::EntityKind;
    use chrono::Utc;

    fn delete_change(id: &str) -> RemoteChange {
        RemoteChange {
            entity_type: EntityKind::Note,
            entity_id: id.to_string(),
            updated_at: Utc::now(),
            origin_device: "dev-x".to_string(),
            deleted: true,
            payload: None,
        }
    }

    fn batch(cursor: Option<&str>, changes: Vec<RemoteChange>) -> PushBatch {
        PushBatch {
            account_id: "acct".into(),
            device_id: "dev-a".into(),
            cursor: cursor.map(str::to_string),
            changes,
        }
    }

    #[tokio::test]
    async fn test_push_requires_current_cursor() {
        let backend = InMemoryBackend::new("acct");
        let session = backend.authenticate("acct").await.unwrap();

        let outcome = backend.push(&session, batch(None, vec![delete_change("n1")])).await.unwrap();
        assert_eq!(outcome, PushOutcome::Accepted { cursor: Some("1".into()) });

        // Still at the old cursor
        let outcome = backend.push(&session, batch(None, vec![delete_change("n2")])).await.unwrap();
        assert_eq!(outcome, PushOutcome::StaleCursor);
        assert_eq!(backend.changes().len(), 1);
    }

    #[tokio::test]
    async fn test_pull_pages() {
        let backend = InMemoryBackend::new("acct");
        let session = backend.authenticate("acct").await.unwrap();
        for i in 0..3 {
            backend.inject_remote_change(delete_change(&format!("n{}", i)));
        }
        backend.set_page_size(2);

        let first = backend.pull(&session, None).await.unwrap();
        assert_eq!(first.changes.len(), 2);
        assert!(first.has_more);

        let second = backend.pull(&session, first.cursor.as_deref()).await.unwrap();
        assert_eq!(second.changes.len(), 1);
        assert!(!second.has_more);
        assert_eq!(second.cursor.as_deref(), Some("3"));
    }

    #[tokio::test]
    async fn test_expired_session_and_wrong_account() {
        let backend = InMemoryBackend::new("acct");
        let session = backend.authenticate("acct").await.unwrap();

        backend.expire_sessions();
        assert!(matches!(backend.pull(&session, None).await, Err(AppError::AuthExpired)));

        assert!(matches!(
            backend.authenticate("other").await,
            Err(AppError::AccountMismatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_injected_failures_are_transient() {
        let backend = InMemoryBackend::new("acct");
        backend.fail_next(1);

        let err = backend.authenticate("acct").await.unwrap_err();
        assert!(err.is_transient());
        assert!(backend.authenticate("acct").await.is_ok());
    }

    #[tokio::test]
    async fn test_subscribers_are_notified() {
        let backend = InMemoryBackend::new("acct");
        let session = backend.authenticate("acct").await.unwrap();
        let mut rx = backend.subscribe(&session).await.unwrap();

        backend.inject_remote_change(delete_change("n1"));
        let note = rx.recv().await.unwrap();
        assert_eq!(note.entity_id, "n1");

        backend.disconnect_subscribers();
        assert!(rx.recv().await.is_none());
    }
}
