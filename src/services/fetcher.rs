//! Bounded-concurrency message fetching with retry and backoff.
//!
//! [`BoundedFetcher`] fans a set of message ids out to the remote with a fixed
//! concurrency ceiling and a hard timeout per attempt. Retryable failures
//! (timeouts, transport errors, rate limits, 5xx) are retried with doubling
//! backoff; everything else fails the item immediately.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::FetchSettings;
use crate::domain::MessageId;
use crate::providers::mail::{MessageFormat, RemoteError, RemoteMailClient, RemoteMessage};

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts including the first.
    pub max_attempts: u32,
    /// Delay after the first failure.
    pub base_delay: Duration,
    /// Ceiling on any single delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Builds the policy from fetch settings.
    pub fn from_settings(settings: &FetchSettings) -> Self {
        Self {
            max_attempts: settings.max_attempts.max(1),
            base_delay: Duration::from_millis(settings.base_delay_ms),
            max_delay: Duration::from_millis(settings.max_delay_ms),
        }
    }

    /// Delay before the attempt following failed attempt number `attempt`
    /// (1-based). A server-provided `Retry-After` takes precedence.
    pub fn delay_after(&self, attempt: u32, error: &RemoteError) -> Duration {
        if let Some(retry_after) = error.retry_after() {
            return retry_after.min(self.max_delay);
        }
        let factor = 1u32 << attempt.saturating_sub(1).min(16);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Runs `op` until it succeeds, fails permanently, or attempts run out.
///
/// Cancellation interrupts the backoff sleep and returns the last error.
pub async fn retry_with_backoff<T, F, Fut>(
    policy: &RetryPolicy,
    cancel: &CancellationToken,
    what: &str,
    mut op: F,
) -> Result<T, RemoteError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RemoteError>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_attempts => {
                let delay = policy.delay_after(attempt, &e);
                warn!(what, attempt, delay_ms = delay.as_millis() as u64, error = %e, "retrying remote call");
                tokio::select! {
                    _ = cancel.cancelled() => return Err(e),
                    _ = tokio::time::sleep(delay) => {}
                }
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// A message the fetcher gave up on.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedFetch {
    /// Message id.
    pub id: MessageId,
    /// Last error seen.
    pub error: RemoteError,
    /// Attempts made.
    pub attempts: u32,
}

impl FailedFetch {
    /// True when retrying within this pass is pointless.
    pub fn is_permanent(&self) -> bool {
        !self.error.is_retryable()
    }
}

/// Outcome of a batch fetch.
#[derive(Debug, Default)]
pub struct FetchReport {
    /// Fetched messages, in request order.
    pub fetched: Vec<RemoteMessage>,
    /// Items that exhausted retries or failed permanently.
    pub failed: Vec<FailedFetch>,
    /// Items never attempted because the pass was cancelled.
    pub skipped: Vec<MessageId>,
}

impl FetchReport {
    /// Ids that failed.
    pub fn failed_ids(&self) -> Vec<MessageId> {
        self.failed.iter().map(|f| f.id.clone()).collect()
    }

    /// Folds another report into this one.
    pub fn absorb(&mut self, other: FetchReport) {
        self.fetched.extend(other.fetched);
        self.failed.extend(other.failed);
        self.skipped.extend(other.skipped);
    }
}

enum ItemOutcome {
    Fetched(usize, RemoteMessage),
    Failed(FailedFetch),
    Skipped(MessageId),
}

/// Fetches messages with bounded concurrency.
#[derive(Clone)]
pub struct BoundedFetcher {
    remote: Arc<dyn RemoteMailClient>,
    policy: RetryPolicy,
    concurrency: usize,
    item_timeout: Duration,
}

impl BoundedFetcher {
    /// Creates a fetcher over `remote`.
    pub fn new(remote: Arc<dyn RemoteMailClient>, settings: &FetchSettings) -> Self {
        Self {
            remote,
            policy: RetryPolicy::from_settings(settings),
            concurrency: settings.max_concurrency.max(1),
            item_timeout: settings.item_timeout(),
        }
    }

    /// The remote this fetcher talks to.
    pub fn remote(&self) -> &Arc<dyn RemoteMailClient> {
        &self.remote
    }

    /// The retry schedule shared with list and history calls.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Fetches every id, at most `max_concurrency` at a time.
    ///
    /// Once `cancel` fires no new fetch is started; in-flight ones finish
    /// and the rest are reported as skipped.
    pub async fn fetch_batch(
        &self,
        ids: &[MessageId],
        format: MessageFormat,
        cancel: &CancellationToken,
    ) -> FetchReport {
        let mut seen = HashSet::new();
        let unique: Vec<(usize, MessageId)> = ids
            .iter()
            .filter(|id| seen.insert((*id).clone()))
            .cloned()
            .enumerate()
            .collect();

        let outcomes: Vec<ItemOutcome> = stream::iter(unique)
            .map(|(index, id)| async move {
                if cancel.is_cancelled() {
                    return ItemOutcome::Skipped(id);
                }
                match self.fetch_one(&id, format, cancel).await {
                    Ok(message) => ItemOutcome::Fetched(index, message),
                    Err((error, attempts)) => {
                        ItemOutcome::Failed(FailedFetch { id, error, attempts })
                    }
                }
            })
            .buffer_unordered(self.concurrency)
            .collect()
            .await;

        let mut report = FetchReport::default();
        let mut fetched = Vec::new();
        for outcome in outcomes {
            match outcome {
                ItemOutcome::Fetched(index, message) => fetched.push((index, message)),
                ItemOutcome::Failed(failure) => report.failed.push(failure),
                ItemOutcome::Skipped(id) => report.skipped.push(id),
            }
        }
        fetched.sort_by_key(|(index, _)| *index);
        report.fetched = fetched.into_iter().map(|(_, m)| m).collect();

        debug!(
            requested = ids.len(),
            fetched = report.fetched.len(),
            failed = report.failed.len(),
            skipped = report.skipped.len(),
            "batch fetch finished"
        );
        report
    }

    /// Fetches one message with retries. Errors carry the attempt count.
    pub async fn fetch_one(
        &self,
        id: &MessageId,
        format: MessageFormat,
        cancel: &CancellationToken,
    ) -> Result<RemoteMessage, (RemoteError, u32)> {
        let mut attempt = 1;
        loop {
            let result = match tokio::time::timeout(
                self.item_timeout,
                self.remote.get_message(id, format),
            )
            .await
            {
                Ok(result) => result,
                Err(_) => Err(RemoteError::Timeout),
            };

            match result {
                Ok(message) => return Ok(message),
                Err(e) if e.is_retryable() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.delay_after(attempt, &e);
                    debug!(message_id = %id, attempt, error = %e, "retrying message fetch");
                    tokio::select! {
                        _ = cancel.cancelled() => return Err((e, attempt)),
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => {
                    warn!(message_id = %id, attempts = attempt, error = %e, "message fetch failed");
                    return Err((e, attempt));
                }
            }
        }
    }
}
