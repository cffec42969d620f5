//! Batch transform + publish over the unprocessed backlog.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jobpipe_core::{PublishEvent, PublishEventType, RawJobRecord, JOB_EVENTS_TOPIC};
use jobpipe_storage::{MarkOutcome, RawJobStore, StoreError};
use thiserror::Error;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::normalize::{NormalizationEngine, TransformError};
use crate::publisher::{EventPublisher, PublishError, PublishFailure};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

#[derive(Debug, Error)]
pub enum EtlError {
    #[error("loading unprocessed records: {0}")]
    Fetch(#[source] StoreError),
    /// The store dropped away mid-batch; remaining records were not attempted.
    #[error("storage unavailable during batch: {0}")]
    StorageUnavailable(#[source] StoreError),
    /// No bus connection could be opened; remaining records were not attempted.
    #[error("event bus unavailable during batch: {0}")]
    BusUnavailable(#[source] PublishError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Another runner marked the record between our read and our write.
    AlreadyProcessed,
}

#[derive(Debug, Clone, PartialEq)]
pub enum FailureReason {
    Transform(TransformError),
    Publish {
        reason: PublishFailure,
        message: String,
    },
    MarkProcessed(String),
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Transform(err) => write!(f, "transform: {err}"),
            FailureReason::Publish { reason, message } => {
                write!(f, "publish ({}): {message}", reason.as_str())
            }
            FailureReason::MarkProcessed(message) => write!(f, "mark processed: {message}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecordOutcome {
    Processed,
    Skipped(SkipReason),
    Failed { reason: FailureReason, poisoned: bool },
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordReport {
    pub raw_job_id: Uuid,
    pub url: String,
    pub outcome: RecordOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub records: Vec<RecordReport>,
}

impl BatchReport {
    pub fn processed(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Processed))
    }

    pub fn skipped(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Skipped(_)))
    }

    pub fn failed(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Failed { .. }))
    }

    pub fn poisoned(&self) -> usize {
        self.count(|o| matches!(o, RecordOutcome::Failed { poisoned: true, .. }))
    }

    fn count(&self, pred: impl Fn(&RecordOutcome) -> bool) -> usize {
        self.records.iter().filter(|r| pred(&r.outcome)).count()
    }
}

/// Runs normalize -> publish -> mark_processed for each pending record.
///
/// Records are independent. A failure that follows the record's own content
/// (transform, serialize) is charged against `max_attempts` and the batch moves on.
/// Bus trouble is never charged: a failed connect aborts the batch, a rejected
/// publish leaves the record pending as it was. A record published but not marked
/// is published again next time.
pub struct BatchEtlRunner {
    store: Arc<dyn RawJobStore>,
    engine: NormalizationEngine,
    publisher: Arc<EventPublisher>,
    topic: String,
    max_attempts: u32,
}

impl BatchEtlRunner {
    pub fn new(
        store: Arc<dyn RawJobStore>,
        engine: NormalizationEngine,
        publisher: Arc<EventPublisher>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            store,
            engine,
            publisher,
            topic: topic.into(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    pub async fn process_pending(&self, batch_size: usize) -> Result<BatchReport, EtlError> {
        let started_at = Utc::now();
        let pending = self
            .store
            .get_unprocessed(batch_size)
            .await
            .map_err(EtlError::Fetch)?;

        let mut records = Vec::with_capacity(pending.len());
        for record in pending {
            let span = info_span!(
                "etl_record",
                raw_job_id = %record.id,
                source = %record.source,
                url = %record.url
            );
            let outcome = self.process_record(&record).instrument(span).await?;
            records.push(RecordReport {
                raw_job_id: record.id,
                url: record.url,
                outcome,
            });
        }

        let report = BatchReport {
            started_at,
            finished_at: Utc::now(),
            records,
        };
        info!(
            topic = %self.topic,
            processed = report.processed(),
            skipped = report.skipped(),
            failed = report.failed(),
            poisoned = report.poisoned(),
            "batch finished"
        );
        Ok(report)
    }

    async fn process_record(&self, record: &RawJobRecord) -> Result<RecordOutcome, EtlError> {
        let processed = match self.engine.normalize(record) {
            Ok(processed) => processed,
            Err(err) => return self.charge(record, FailureReason::Transform(err)).await,
        };

        let event = PublishEvent::new(
            PublishEventType::JobCreated,
            processed,
            record.job_id.clone(),
            Utc::now(),
        );
        if let Err(err) = self.publisher.send(&self.topic, &event).await {
            let reason = FailureReason::Publish {
                reason: err.reason(),
                message: err.to_string(),
            };
            return match err.reason() {
                PublishFailure::Connect => Err(EtlError::BusUnavailable(err)),
                PublishFailure::Serialize => self.charge(record, reason).await,
                PublishFailure::Transport | PublishFailure::NotAcknowledged => {
                    warn!(reason = %reason, "publish failed; record stays pending");
                    Ok(RecordOutcome::Failed {
                        reason,
                        poisoned: false,
                    })
                }
            };
        }

        match self.store.mark_processed(record.id).await {
            Ok(MarkOutcome::Marked) => Ok(RecordOutcome::Processed),
            Ok(MarkOutcome::AlreadyProcessed) => {
                info!("record already processed by another runner");
                Ok(RecordOutcome::Skipped(SkipReason::AlreadyProcessed))
            }
            Err(err) if err.is_unavailable() => Err(EtlError::StorageUnavailable(err)),
            Err(err) => {
                // published but unmarked: next batch publishes it again
                error!(error = %err, "marking record processed failed after publish");
                Ok(RecordOutcome::Failed {
                    reason: FailureReason::MarkProcessed(err.to_string()),
                    poisoned: false,
                })
            }
        }
    }

    /// Count a failure against the record's retry budget.
    async fn charge(
        &self,
        record: &RawJobRecord,
        reason: FailureReason,
    ) -> Result<RecordOutcome, EtlError> {
        let message = reason.to_string();
        let poisoned = match self
            .store
            .record_failure(record.id, &message, self.max_attempts)
            .await
        {
            Ok(state) => {
                error!(
                    reason = %message,
                    attempts = state.attempts,
                    poisoned = state.poisoned,
                    "record processing failed"
                );
                state.poisoned
            }
            Err(err) if err.is_unavailable() => return Err(EtlError::StorageUnavailable(err)),
            Err(err) => {
                warn!(reason = %message, error = %err, "could not record processing failure");
                false
            }
        };
        Ok(RecordOutcome::Failed { reason, poisoned })
    }
}

impl std::fmt::Debug for BatchEtlRunner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchEtlRunner")
            .field("topic", &self.topic)
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}

/// Runner on the fixed job-events topic.
pub fn default_runner(
    store: Arc<dyn RawJobStore>,
    publisher: Arc<EventPublisher>,
) -> BatchEtlRunner {
    BatchEtlRunner::new(store, NormalizationEngine::new(), publisher, JOB_EVENTS_TOPIC)
}
