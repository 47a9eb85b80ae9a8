//! HTTP backend
//!
//! JSON over HTTPS against the sync service. Notifications are long-polled
//! in a background task and forwarded into a channel; the channel closes
//! when the poll fails, which the realtime bridge treats as a lost
//! connection.

use super::backend::{ChangeNotification, PullBatch, PushBatch, PushOutcome, RemoteBackend, SessionToken};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::mpsc;

const USER_AGENT: &str = "DuruNotes-Sync";
const NOTIFICATION_BUFFER: usize = 64;
/// How long the server may hold a notification poll open
const LONG_POLL_SECS: u64 = 55;

#[derive(Serialize)]
struct TokenRequest<'a> {
    account_id: &'a str,
    refresh_token: Option<&'a str>,
}

#[derive(Deserialize)]
struct PushResponse {
    cursor: Option<String>,
}

#[derive(Deserialize)]
struct NotificationPage {
    #[serde(default)]
    notifications: Vec<ChangeNotification>,
    cursor: Option<String>,
}

pub struct HttpBackend {
    client: Client,
    base_url: String,
    refresh_token: Option<String>,
}

impl HttpBackend {
    pub fn new(base_url: &str, refresh_token: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .connect_timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            refresh_token,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn account_url(&self, account_id: &str, path: &str) -> String {
        self.url(&format!("/v1/accounts/{}{}", account_id, path))
    }

    fn check_account(session: &SessionToken, reported: &str) -> Result<()> {
        if reported != session.account_id {
            return Err(AppError::AccountMismatch {
                expected: session.account_id.clone(),
                actual: reported.to_string(),
            });
        }
        Ok(())
    }
}

/// Map non-success statuses onto the error taxonomy
fn check_status(response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }

    tracing::warn!("Sync backend returned status: {}", status);
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(AppError::AuthExpired),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            Err(AppError::TransientNetwork(format!("backend returned {}", status)))
        }
        s if s.is_server_error() => Err(AppError::TransientNetwork(format!("backend returned {}", status))),
        _ => Err(AppError::Generic(format!("Backend returned status: {}", status))),
    }
}

#[async_trait]
impl RemoteBackend for HttpBackend {
    async fn authenticate(&self, account_id: &str) -> Result<SessionToken> {
        let response = self
            .client
            .post(self.url("/v1/auth/token"))
            .json(&TokenRequest {
                account_id,
                refresh_token: self.refresh_token.as_deref(),
            })
            .send()
            .await?;

        let session: SessionToken = check_status(response)?.json().await?;
        if session.account_id != account_id {
            return Err(AppError::AccountMismatch {
                expected: account_id.to_string(),
                actual: session.account_id,
            });
        }
        Ok(session)
    }

    async fn push(&self, session: &SessionToken, batch: PushBatch) -> Result<PushOutcome> {
        let response = self
            .client
            .post(self.account_url(&session.account_id, "/push"))
            .bearer_auth(&session.token)
            .json(&batch)
            .send()
            .await?;

        if response.status() == StatusCode::CONFLICT {
            return Ok(PushOutcome::StaleCursor);
        }

        let body: PushResponse = check_status(response)?.json().await?;
        Ok(PushOutcome::Accepted { cursor: body.cursor })
    }

    async fn pull(&self, session: &SessionToken, since: Option<&str>) -> Result<PullBatch> {
        let mut request = self
            .client
            .get(self.account_url(&session.account_id, "/changes"))
            .bearer_auth(&session.token);
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }

        let batch: PullBatch = check_status(request.send().await?)?.json().await?;
        Self::check_account(session, &batch.account_id)?;
        Ok(batch)
    }

    async fn subscribe(&self, session: &SessionToken) -> Result<mpsc::Receiver<ChangeNotification>> {
        let (tx, rx) = mpsc::channel(NOTIFICATION_BUFFER);
        let client = self.client.clone();
        let url = self.account_url(&session.account_id, "/notifications");
        let token = session.token.clone();

        tokio::spawn(async move {
            let mut since: Option<String> = None;

            loop {
                let mut request = client
                    .get(&url)
                    .bearer_auth(&token)
                    .timeout(Duration::from_secs(LONG_POLL_SECS + 5));
                if let Some(since) = since.as_deref() {
                    request = request.query(&[("since", since)]);
                }

                let page = tokio::select! {
                    _ = tx.closed() => break,
                    result = request.send() => result,
                };

                let page: NotificationPage = match page.map_err(AppError::from).and_then(check_status) {
                    Ok(response) => match response.json().await {
                        Ok(page) => page,
                        Err(e) => {
                            tracing::warn!("Malformed notification page: {}", e);
                            break;
                        }
                    },
                    Err(e) => {
                        tracing::warn!("Notification channel lost: {}", e);
                        break;
                    }
                };

                for notification in page.notifications {
                    if tx.send(notification).await.is_err() {
                        return;
                    }
                }
                if page.cursor.is_some() {
                    since = page.cursor;
                }
            }
            // Dropping `tx` closes the receiver
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_urls_ignore_trailing_slash() {
        let backend = HttpBackend::new("https://sync.example/", None, Duration::from_secs(5)).unwrap();
        assert_eq!(backend.url("/v1/auth/token"), "https://sync.example/v1/auth/token");
        assert_eq!(
            backend.account_url("acct-1", "/push"),
            "https://sync.example/v1/accounts/acct-1/push"
        );
    }

    #[test]
    fn test_pull_batch_parses_without_optional_fields() {
        let batch: PullBatch =
            serde_json::from_str(r#"{"account_id":"a","changes":[],"cursor":null}"#).unwrap();
        assert!(!batch.has_more);
        assert!(batch.cursor.is_none());
    }

    #[test]
    fn test_mismatched_account_is_rejected() {
        let session = SessionToken {
            account_id: "mine".into(),
            token: "t".into(),
            expires_at: None,
        };
        assert!(HttpBackend::check_account(&session, "mine").is_ok());
        assert!(matches!(
            HttpBackend::check_account(&session, "theirs"),
            Err(AppError::AccountMismatch { .. })
        ));
    }
}
