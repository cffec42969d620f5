//! Pipeline orchestration: normalize, publish, batch ETL, on-demand sync + scheduling.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use jobpipe_adapters::adapter_for_source;
use jobpipe_storage::{BackoffPolicy, HttpClientConfig, HttpDownstreamClient, PostgresStore};
use tracing::info;

pub mod config;
pub mod coordinator;
pub mod etl;
pub mod ingest;
pub mod normalize;
pub mod publisher;
pub mod scheduler;

pub use config::{PipelineConfig, SourceConfig, SourceRegistry};
pub use coordinator::{DeliveryPath, SyncAction, SyncCoordinator, SyncError, SyncOutcome};
pub use etl::{BatchEtlRunner, BatchReport, EtlError, FailureReason, RecordOutcome, SkipReason};
pub use ingest::{IngestError, IngestReport, Ingestor, SourceRun};
pub use normalize::{NormalizationEngine, RequirementExtractor, TransformError};
pub use publisher::{
    BusConnection, BusConnector, EventPublisher, MemoryBus, NatsConnector, PublishError,
    PublishFailure,
};
pub use scheduler::{build_cron_scheduler, CycleError, CycleReport, SchedulingLoop};

pub const CRATE_NAME: &str = "jobpipe-sync";

/// Every long-lived component, wired from one [`PipelineConfig`].
pub struct Pipeline {
    pub config: PipelineConfig,
    pub store: Arc<PostgresStore>,
    pub publisher: Arc<EventPublisher>,
    pub coordinator: SyncCoordinator,
    pub scheduling: Arc<SchedulingLoop>,
}

impl Pipeline {
    pub async fn from_config(config: PipelineConfig) -> Result<Self> {
        let store = Arc::new(
            PostgresStore::connect(&config.database_url)
                .await
                .context("connecting to raw job store")?,
        );
        store.ensure_schema().await.context("bootstrapping schema")?;

        let connector = NatsConnector::new(
            config.nats_url.clone(),
            config.nats_stream.clone(),
            vec![config.topic.clone()],
        );
        let publisher = Arc::new(EventPublisher::new(Arc::new(connector)));

        let api = HttpDownstreamClient::new(
            config.downstream_api_url.clone(),
            HttpClientConfig {
                timeout: Duration::from_secs(config.http_timeout_secs),
                user_agent: Some(config.user_agent.clone()),
            },
        )
        .context("building downstream api client")?;
        let coordinator = SyncCoordinator::new(
            store.clone(),
            publisher.clone(),
            Arc::new(api),
            config.topic.clone(),
        );

        let registry = SourceRegistry::load(config.sources_path()).await?;
        let sources: Vec<SourceRun> = registry
            .enabled()
            .map(|source| {
                let adapter =
                    adapter_for_source(source.source, &source.fixture, &config.workspace_root);
                SourceRun::new(Arc::from(adapter), source.search_terms.clone())
                    .with_location(source.location.clone())
            })
            .collect();
        info!(sources = sources.len(), "source registry loaded");

        let ingestor = Ingestor::new(store.clone(), sources, config.adapter_timeout);
        let runner = BatchEtlRunner::new(
            store.clone(),
            NormalizationEngine::new(),
            publisher.clone(),
            config.topic.clone(),
        )
        .with_max_attempts(config.max_attempts);
        let scheduling = Arc::new(
            SchedulingLoop::new(ingestor, runner, config.batch_size)
                .with_interval(config.interval)
                .with_backoff(BackoffPolicy::fixed(config.failure_backoff)),
        );

        Ok(Self {
            config,
            store,
            publisher,
            coordinator,
            scheduling,
        })
    }

    pub async fn from_env() -> Result<Self> {
        Self::from_config(PipelineConfig::from_env()).await
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.publisher.stop().await.context("stopping event publisher")
    }
}

/// Run one ingest + ETL cycle against the environment-configured backends.
pub async fn run_once_from_env() -> Result<CycleReport> {
    let pipeline = Pipeline::from_env().await?;
    let report = pipeline.scheduling.run_cycle().await;
    pipeline.shutdown().await?;
    Ok(report?)
}
