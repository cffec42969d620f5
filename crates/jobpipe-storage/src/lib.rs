//! Raw job storage, local tracking storage + downstream HTTP utilities.

use std::time::Duration;

use async_trait::async_trait;
use jobpipe_core::{JobPosting, JobSource, RawJobRecord, TrackingRecord};
use reqwest::StatusCode;
use thiserror::Error;
use uuid::Uuid;

pub mod downstream;
pub mod memory;
pub mod postgres;

pub use downstream::{DownstreamApi, DownstreamError, DownstreamJob, HttpDownstreamClient};
pub use memory::MemoryStore;
pub use postgres::PostgresStore;

pub const CRATE_NAME: &str = "jobpipe-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    /// The backing store could not be reached. Callers abort the whole cycle.
    #[error("storage unavailable: {0}")]
    Unavailable(String),
    #[error("raw job {0} not found")]
    NotFound(Uuid),
    #[error("{context}: {message}")]
    Query {
        context: &'static str,
        message: String,
    },
    #[error("corrupt row: {0}")]
    Corrupt(String),
}

impl StoreError {
    pub fn is_unavailable(&self) -> bool {
        matches!(self, StoreError::Unavailable(_))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkOutcome {
    Marked,
    AlreadyProcessed,
}

/// Retry bookkeeping after a failed processing attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureState {
    pub attempts: u32,
    pub poisoned: bool,
}

/// Raw scraped postings keyed by `(source, url)`.
///
/// `save` is an upsert enforced by the store itself, so concurrent writers of the
/// same key never produce two rows. `processed` only ever flips false -> true.
#[async_trait]
pub trait RawJobStore: Send + Sync {
    async fn ping(&self) -> Result<(), StoreError>;

    async fn save(&self, posting: JobPosting) -> Result<Uuid, StoreError>;

    /// Oldest-first unprocessed records, excluding poisoned ones.
    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError>;

    async fn mark_processed(&self, id: Uuid) -> Result<MarkOutcome, StoreError>;

    async fn get_by_source(
        &self,
        source: JobSource,
        processed: Option<bool>,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, StoreError>;

    async fn record_failure(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: u32,
    ) -> Result<FailureState, StoreError>;

    async fn get_poisoned(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError>;

    /// Clear the retry budget of an unprocessed record so the next batch picks it up.
    /// Returns `false` when the record was already processed.
    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError>;
}

/// Local mirror of records pushed downstream, unique on `source_url`.
#[async_trait]
pub trait TrackingStore: Send + Sync {
    async fn find_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<TrackingRecord>, StoreError>;

    /// Insert, or refresh the existing row with the same `source_url`. Returns the stored row.
    async fn upsert(&self, record: &TrackingRecord) -> Result<TrackingRecord, StoreError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(60))
    }
}

impl BackoffPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            base_delay: delay,
            max_delay: delay,
        }
    }

    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn fixed_backoff_never_grows() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(0), Duration::from_secs(60));
        assert_eq!(policy.delay_for_attempt(7), Duration::from_secs(60));
    }

    #[test]
    fn server_errors_and_throttling_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY),
            RetryDisposition::NonRetryable
        );
    }
}
