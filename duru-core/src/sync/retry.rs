//! Timeouts and exponential backoff for backend calls

use crate::cancel::Cancellation;
use crate::error::{AppError, Result};
use crate::services::settings::SyncSettings;
use std::future::Future;
use std::time::Duration;

/// Delay before retry number `attempt` (zero-based): base * 2^attempt,
/// capped at the configured maximum
pub fn backoff_delay(settings: &SyncSettings, attempt: u32) -> Duration {
    let factor = 1u64.checked_shl(attempt.min(32)).unwrap_or(u64::MAX);
    let ms = settings
        .backoff_base_ms
        .saturating_mul(factor)
        .min(settings.backoff_max_ms);
    Duration::from_millis(ms)
}

/// Run a backend call under the network timeout, retrying transient
/// failures with backoff. A timeout counts as transient. `retries` is
/// increased once per retry.
pub async fn with_retry<T, F, Fut>(
    settings: &SyncSettings,
    operation: &str,
    cancel: &Cancellation,
    retries: &mut u32,
    mut call: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 0;

    loop {
        let attempt_result = tokio::select! {
            _ = cancel.cancelled() => return Err(AppError::Cancelled),
            r = tokio::time::timeout(settings.network_timeout(), call()) => r,
        };
        let result = match attempt_result {
            Ok(result) => result,
            Err(_) => Err(AppError::TransientNetwork(format!("{} timed out", operation))),
        };

        match result {
            Err(e) if e.is_transient() && attempt < settings.max_transient_retries => {
                let delay = backoff_delay(settings, attempt);
                tracing::warn!(
                    "{} failed ({}), retrying in {:?} (attempt {}/{})",
                    operation,
                    e,
                    delay,
                    attempt + 1,
                    settings.max_transient_retries
                );
                attempt += 1;
                *retries += 1;

                tokio::select! {
                    _ = cancel.cancelled() => return Err(AppError::Cancelled),
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            other => return other,
        }
    }
}
