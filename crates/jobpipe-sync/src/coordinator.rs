//! On-demand sync of a single processed job: bus first, REST as fallback.

use std::sync::Arc;

use chrono::Utc;
use jobpipe_core::{ProcessedJobRecord, PublishEvent, PublishEventType, TrackingRecord};
use jobpipe_storage::{DownstreamApi, DownstreamError, StoreError, TrackingStore};
use thiserror::Error;
use tracing::{info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::publisher::{EventPublisher, PublishFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncAction {
    Created,
    Updated,
}

impl SyncAction {
    fn event_type(self) -> PublishEventType {
        match self {
            SyncAction::Created => PublishEventType::JobCreated,
            SyncAction::Updated => PublishEventType::JobUpdated,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryPath {
    Bus,
    /// The bus publish failed and the REST call succeeded instead.
    ApiFallback { reason: PublishFailure },
    Api,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncOutcome {
    pub action: SyncAction,
    pub path: DeliveryPath,
    /// `None` when the delivery succeeded but the local mirror could not be written.
    pub tracking: Option<TrackingRecord>,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("looking up tracking record: {0}")]
    Lookup(#[source] StoreError),
    #[error("downstream api call failed: {source}")]
    Downstream {
        #[source]
        source: DownstreamError,
        /// Set when this call was itself the fallback for a failed publish.
        after_publish_failure: Option<PublishFailure>,
    },
}

pub struct SyncCoordinator {
    tracking: Arc<dyn TrackingStore>,
    publisher: Arc<EventPublisher>,
    api: Arc<dyn DownstreamApi>,
    topic: String,
}

impl SyncCoordinator {
    pub fn new(
        tracking: Arc<dyn TrackingStore>,
        publisher: Arc<EventPublisher>,
        api: Arc<dyn DownstreamApi>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            tracking,
            publisher,
            api,
            topic: topic.into(),
        }
    }

    /// Push one job downstream. Each call is a complete attempt; nothing resumes.
    pub async fn sync_job(
        &self,
        job: &ProcessedJobRecord,
        prefer_bus: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let span = info_span!("sync_job", source_url = %job.source_url, prefer_bus);
        self.sync_job_inner(job, prefer_bus).instrument(span).await
    }

    async fn sync_job_inner(
        &self,
        job: &ProcessedJobRecord,
        prefer_bus: bool,
    ) -> Result<SyncOutcome, SyncError> {
        let existing = self
            .tracking
            .find_by_source_url(&job.source_url)
            .await
            .map_err(SyncError::Lookup)?;
        let action = if existing.is_some() {
            SyncAction::Updated
        } else {
            SyncAction::Created
        };

        if !prefer_bus {
            let downstream_id = self.call_api(job, existing.as_ref(), None).await?;
            let tracking = self.persist(job, existing, downstream_id).await;
            return Ok(SyncOutcome {
                action,
                path: DeliveryPath::Api,
                tracking,
            });
        }

        let event = PublishEvent::new(
            action.event_type(),
            job.clone(),
            job.source_job_id.clone(),
            Utc::now(),
        );
        match self.publisher.send(&self.topic, &event).await {
            Ok(()) => {
                let tracking = self.persist(job, existing, None).await;
                Ok(SyncOutcome {
                    action,
                    path: DeliveryPath::Bus,
                    tracking,
                })
            }
            Err(err) => {
                let reason = err.reason();
                warn!(
                    error = %err,
                    reason = reason.as_str(),
                    "publish failed, falling back to api"
                );
                let downstream_id = self.call_api(job, existing.as_ref(), Some(reason)).await?;
                let tracking = self.persist(job, existing, downstream_id).await;
                Ok(SyncOutcome {
                    action,
                    path: DeliveryPath::ApiFallback { reason },
                    tracking,
                })
            }
        }
    }

    async fn call_api(
        &self,
        job: &ProcessedJobRecord,
        existing: Option<&TrackingRecord>,
        after_publish_failure: Option<PublishFailure>,
    ) -> Result<Option<Uuid>, SyncError> {
        let result = match existing {
            Some(record) => self.api.update_job(record.id, job).await,
            None => self.api.create_job(job).await,
        };
        result
            .map(|created| created.id)
            .map_err(|source| SyncError::Downstream {
                source,
                after_publish_failure,
            })
    }

    async fn persist(
        &self,
        job: &ProcessedJobRecord,
        existing: Option<TrackingRecord>,
        downstream_id: Option<Uuid>,
    ) -> Option<TrackingRecord> {
        let now = Utc::now();
        let record = match existing {
            Some(mut record) => {
                record.refresh_from(job, now);
                record
            }
            None => {
                let id = downstream_id.unwrap_or_else(Uuid::new_v4);
                TrackingRecord::from_processed(id, job, now)
            }
        };
        match self.tracking.upsert(&record).await {
            Ok(stored) => {
                info!(tracking_id = %stored.id, "tracking record written");
                Some(stored)
            }
            Err(err) => {
                warn!(error = %err, "job delivered but tracking record not written");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::MemoryBus;
    use jobpipe_core::{JobSource, JobType, JOB_EVENTS_TOPIC};
    use jobpipe_storage::{HttpClientConfig, HttpDownstreamClient, MemoryStore};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job(url: &str) -> ProcessedJobRecord {
        ProcessedJobRecord {
            source_job_id: "gd-77".into(),
            title: "QA Engineer".into(),
            company: "Acme".into(),
            description: "Testing".into(),
            requirements: vec![],
            location: "Lima, Peru".into(),
            is_remote: false,
            source_url: url.into(),
            salary_range: Some("PEN 1,000.00 - 3,000.00".into()),
            job_type: JobType::FullTime,
            level: "NOT_SPECIFIED".into(),
            source: JobSource::Glassdoor,
        }
    }

    struct Harness {
        store: Arc<MemoryStore>,
        bus: MemoryBus,
        server: MockServer,
        coordinator: SyncCoordinator,
    }

    async fn harness() -> Harness {
        let store = Arc::new(MemoryStore::new());
        let bus = MemoryBus::new();
        let server = MockServer::start().await;
        let api = HttpDownstreamClient::new(server.uri(), HttpClientConfig::default()).unwrap();
        let coordinator = SyncCoordinator::new(
            store.clone(),
            Arc::new(EventPublisher::new(Arc::new(bus.clone()))),
            Arc::new(api),
            JOB_EVENTS_TOPIC,
        );
        Harness {
            store,
            bus,
            server,
            coordinator,
        }
    }

    #[tokio::test]
    async fn bus_path_creates_then_updates_tracking() {
        let h = harness().await;
        let job = job("https://glassdoor.test/77");

        let first = h.coordinator.sync_job(&job, true).await.unwrap();
        assert_eq!(first.action, SyncAction::Created);
        assert_eq!(first.path, DeliveryPath::Bus);
        let created = first.tracking.unwrap();

        let second = h.coordinator.sync_job(&job, true).await.unwrap();
        assert_eq!(second.action, SyncAction::Updated);
        assert_eq!(second.tracking.unwrap().id, created.id);

        let events = h.bus.events_on(JOB_EVENTS_TOPIC);
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].event_type, PublishEventType::JobCreated);
        assert_eq!(events[1].event_type, PublishEventType::JobUpdated);
        assert_eq!(h.store.tracking_count(), 1);
    }

    #[tokio::test]
    async fn publish_failure_falls_back_to_api() {
        let h = harness().await;
        h.bus.set_fail_publish(true);
        let downstream_id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": downstream_id})))
            .expect(1)
            .mount(&h.server)
            .await;

        let outcome = h
            .coordinator
            .sync_job(&job("https://glassdoor.test/1"), true)
            .await
            .unwrap();

        assert_eq!(
            outcome.path,
            DeliveryPath::ApiFallback {
                reason: PublishFailure::Transport
            }
        );
        assert_eq!(outcome.tracking.unwrap().id, downstream_id);
    }

    #[tokio::test]
    async fn failed_fallback_is_a_hard_error_and_writes_no_tracking() {
        let h = harness().await;
        h.bus.set_fail_connect(true);
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&h.server)
            .await;

        let err = h
            .coordinator
            .sync_job(&job("https://glassdoor.test/1"), true)
            .await
            .unwrap_err();

        match err {
            SyncError::Downstream {
                after_publish_failure,
                ..
            } => assert_eq!(after_publish_failure, Some(PublishFailure::Connect)),
            other => panic!("unexpected error: {other:?}"),
        }
        assert_eq!(h.store.tracking_count(), 0);
    }

    #[tokio::test]
    async fn direct_api_path_skips_the_bus() {
        let h = harness().await;
        Mock::given(method("POST"))
            .and(path("/jobs"))
            .respond_with(ResponseTemplate::new(201))
            .expect(1)
            .mount(&h.server)
            .await;

        let outcome = h
            .coordinator
            .sync_job(&job("https://glassdoor.test/9"), false)
            .await
            .unwrap();

        assert_eq!(outcome.path, DeliveryPath::Api);
        assert!(outcome.tracking.is_some());
        assert_eq!(h.bus.connect_count(), 0);
        assert_eq!(h.bus.publish_count(), 0);
    }

    #[tokio::test]
    async fn direct_api_update_uses_tracked_id() {
        let h = harness().await;
        let job = job("https://glassdoor.test/5");
        let first = h.coordinator.sync_job(&job, true).await.unwrap();
        let tracked = first.tracking.unwrap();

        Mock::given(method("PUT"))
            .and(path(format!("/jobs/{}", tracked.id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(1)
            .mount(&h.server)
            .await;

        let outcome = h.coordinator.sync_job(&job, false).await.unwrap();
        assert_eq!(outcome.action, SyncAction::Updated);
        assert_eq!(outcome.tracking.unwrap().created_at, tracked.created_at);
    }
}
