//! Periodic ingest + ETL cycles.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use jobpipe_storage::BackoffPolicy;
use thiserror::Error;
use tokio::time::sleep;
use tokio_cron_scheduler::{Job, JobScheduler};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, Instrument};
use uuid::Uuid;

use crate::etl::{BatchEtlRunner, BatchReport, EtlError};
use crate::ingest::{IngestError, IngestReport, Ingestor};

#[derive(Debug, Error)]
pub enum CycleError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error(transparent)]
    Etl(#[from] EtlError),
}

#[derive(Debug, Clone)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub ingest: IngestReport,
    pub batch: BatchReport,
}

pub struct SchedulingLoop {
    ingestor: Ingestor,
    runner: BatchEtlRunner,
    batch_size: usize,
    interval: Duration,
    backoff: BackoffPolicy,
}

impl SchedulingLoop {
    pub fn new(ingestor: Ingestor, runner: BatchEtlRunner, batch_size: usize) -> Self {
        Self {
            ingestor,
            runner,
            batch_size,
            interval: Duration::from_secs(3600),
            backoff: BackoffPolicy::default(),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn runner(&self) -> &BatchEtlRunner {
        &self.runner
    }

    /// One full cycle: ping + ingest every source, then drain one batch.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        let span = info_span!("cycle", %run_id);
        async {
            let ingest = self.ingestor.run(run_id).await?;
            let batch = self.runner.process_pending(self.batch_size).await?;
            Ok(CycleReport {
                run_id,
                started_at,
                finished_at: Utc::now(),
                ingest,
                batch,
            })
        }
        .instrument(span)
        .await
    }

    /// Run cycles until `shutdown` fires. A failed or panicking cycle is logged and
    /// followed by a backoff sleep; it never ends the loop.
    #[instrument(skip_all)]
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        info!(interval_secs = self.interval.as_secs(), "scheduling loop started");
        let mut consecutive_failures = 0usize;

        while !shutdown.is_cancelled() {
            let cycle = Arc::clone(&self);
            let wait = match tokio::spawn(async move { cycle.run_cycle().await }).await {
                Ok(Ok(report)) => {
                    consecutive_failures = 0;
                    info!(
                        run_id = %report.run_id,
                        saved = report.ingest.saved,
                        processed = report.batch.processed(),
                        failed = report.batch.failed(),
                        "cycle complete"
                    );
                    self.interval
                }
                Ok(Err(err)) => {
                    error!(error = %err, "cycle failed");
                    self.failure_delay(&mut consecutive_failures)
                }
                Err(join_err) => {
                    error!(error = %join_err, "cycle panicked");
                    self.failure_delay(&mut consecutive_failures)
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(wait) => {}
            }
        }

        info!("scheduling loop stopped");
    }

    fn failure_delay(&self, consecutive_failures: &mut usize) -> Duration {
        let delay = self.backoff.delay_for_attempt(*consecutive_failures);
        *consecutive_failures += 1;
        delay
    }
}

/// Cron-driven alternative to [`SchedulingLoop::run`]; each tick runs one cycle.
pub async fn build_cron_scheduler(
    scheduling: Arc<SchedulingLoop>,
    cron: &str,
) -> anyhow::Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job = Job::new_async(cron, move |_uuid, _l| {
        let scheduling = Arc::clone(&scheduling);
        Box::pin(async move {
            match scheduling.run_cycle().await {
                Ok(report) => info!(
                    run_id = %report.run_id,
                    processed = report.batch.processed(),
                    "scheduled cycle complete"
                ),
                Err(err) => error!(error = %err, "scheduled cycle failed"),
            }
        })
    })
    .with_context(|| format!("creating scheduler job for cron {cron}"))?;
    sched.add(job).await.context("adding scheduler job")?;
    Ok(sched)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use jobpipe_adapters::{AdapterContext, AdapterError, JobSourceAdapter, RawPosting};
    use jobpipe_core::{JobSource, JOB_EVENTS_TOPIC};
    use jobpipe_storage::{MemoryStore, RawJobStore};
    use serde_json::json;

    use crate::etl::default_runner;
    use crate::ingest::SourceRun;
    use crate::publisher::{EventPublisher, MemoryBus};

    /// Panics on its first fetch, then serves one posting.
    #[derive(Default)]
    struct FlakyAdapter {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl JobSourceAdapter for FlakyAdapter {
        fn source(&self) -> JobSource {
            JobSource::Linkedin
        }

        fn name(&self) -> &str {
            "flaky"
        }

        async fn fetch(&self, _ctx: &AdapterContext) -> Result<Vec<RawPosting>, AdapterError> {
            if self.calls.fetch_add(1, Ordering::SeqCst) == 0 {
                panic!("adapter blew up");
            }
            Ok(vec![json!({
                "title": "Platform Engineer",
                "company": "Acme",
                "description": "Remote friendly",
                "job_url": "https://linkedin.test/jobs/1",
                "location": "Lima, Peru",
            })
            .as_object()
            .cloned()
            .unwrap()])
        }
    }

    fn scheduling(store: Arc<MemoryStore>, bus: &MemoryBus) -> SchedulingLoop {
        let publisher = Arc::new(EventPublisher::new(Arc::new(bus.clone())));
        let ingestor = Ingestor::new(
            store.clone(),
            vec![SourceRun::new(Arc::new(FlakyAdapter::default()), vec![])],
            Duration::from_secs(5),
        );
        SchedulingLoop::new(ingestor, default_runner(store, publisher), 10)
            .with_interval(Duration::from_millis(10))
            .with_backoff(BackoffPolicy::fixed(Duration::from_millis(10)))
    }

    #[tokio::test]
    async fn run_cycle_surfaces_storage_outage() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let bus = MemoryBus::new();

        let err = scheduling(store, &bus).run_cycle().await.unwrap_err();
        assert!(matches!(err, CycleError::Ingest(IngestError::StorageUnavailable(_))));
    }

    #[tokio::test]
    async fn panicking_cycle_does_not_stop_the_loop() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let scheduling = Arc::new(scheduling(store.clone(), &bus));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&scheduling).run(shutdown.clone()));

        tokio::time::timeout(Duration::from_secs(5), async {
            while bus.publish_count() == 0 {
                sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("loop recovered and published");

        shutdown.cancel();
        handle.await.unwrap();
        let events = bus.events_on(JOB_EVENTS_TOPIC);
        assert_eq!(events[0].data.source, JobSource::Linkedin);
        assert!(events[0].data.is_remote);
        assert!(store.get_unprocessed(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_interrupts_the_interval_sleep() {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let scheduling =
            Arc::new(scheduling(store, &bus).with_interval(Duration::from_secs(3600)));
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(Arc::clone(&scheduling).run(shutdown.clone()));

        sleep(Duration::from_millis(50)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("loop stopped promptly")
            .unwrap();
    }
}
