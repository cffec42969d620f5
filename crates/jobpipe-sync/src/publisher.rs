//! Event bus publishing with lazy, single-shot connection setup.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use jobpipe_core::PublishEvent;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Why a publish did not go through. Callers branch on this instead of on error text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PublishFailure {
    Connect,
    Serialize,
    Transport,
    NotAcknowledged,
}

impl PublishFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            PublishFailure::Connect => "connect",
            PublishFailure::Serialize => "serialize",
            PublishFailure::Transport => "transport",
            PublishFailure::NotAcknowledged => "not_acknowledged",
        }
    }
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("connecting to event bus: {0}")]
    Connect(String),
    #[error("serializing event: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("publishing to `{topic}`: {message}")]
    Transport { topic: String, message: String },
    #[error("`{topic}` did not acknowledge publish: {message}")]
    NotAcknowledged { topic: String, message: String },
}

impl PublishError {
    pub fn reason(&self) -> PublishFailure {
        match self {
            PublishError::Connect(_) => PublishFailure::Connect,
            PublishError::Serialize(_) => PublishFailure::Serialize,
            PublishError::Transport { .. } => PublishFailure::Transport,
            PublishError::NotAcknowledged { .. } => PublishFailure::NotAcknowledged,
        }
    }
}

/// Opens bus connections. One connector backs one [`EventPublisher`].
#[async_trait]
pub trait BusConnector: Send + Sync {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, PublishError>;
}

/// A live connection. `publish` returns only once the broker has acknowledged the message.
#[async_trait]
pub trait BusConnection: Send + Sync {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError>;

    async fn close(&self) -> Result<(), PublishError>;
}

/// Publishes [`PublishEvent`]s, connecting on first use.
///
/// The connection slot sits behind an async mutex: concurrent first callers of
/// [`start`](Self::start) or [`send`](Self::send) wait on the one connect attempt.
/// `send` does not retry; the caller owns retry policy.
pub struct EventPublisher {
    connector: Arc<dyn BusConnector>,
    connection: Mutex<Option<Arc<dyn BusConnection>>>,
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").finish_non_exhaustive()
    }
}

impl EventPublisher {
    pub fn new(connector: Arc<dyn BusConnector>) -> Self {
        Self {
            connector,
            connection: Mutex::new(None),
        }
    }

    pub async fn start(&self) -> Result<(), PublishError> {
        self.connection().await.map(|_| ())
    }

    pub async fn stop(&self) -> Result<(), PublishError> {
        let connection = self.connection.lock().await.take();
        if let Some(connection) = connection {
            connection.close().await?;
            info!("event publisher stopped");
        }
        Ok(())
    }

    pub async fn is_started(&self) -> bool {
        self.connection.lock().await.is_some()
    }

    pub async fn send(&self, topic: &str, event: &PublishEvent) -> Result<(), PublishError> {
        let payload = Bytes::from(serde_json::to_vec(event)?);
        let connection = self.connection().await?;
        connection.publish(topic, payload).await?;
        debug!(
            topic,
            event_type = ?event.event_type,
            source_url = %event.data.source_url,
            "event published"
        );
        Ok(())
    }

    async fn connection(&self) -> Result<Arc<dyn BusConnection>, PublishError> {
        let mut slot = self.connection.lock().await;
        if let Some(connection) = slot.as_ref() {
            return Ok(Arc::clone(connection));
        }
        let connection = self.connector.connect().await?;
        *slot = Some(Arc::clone(&connection));
        info!("event publisher started");
        Ok(connection)
    }
}

/// NATS JetStream transport. The stream is created on connect if it does not exist yet.
#[derive(Debug, Clone)]
pub struct NatsConnector {
    url: String,
    stream: String,
    subjects: Vec<String>,
}

impl NatsConnector {
    pub fn new(url: impl Into<String>, stream: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            url: url.into(),
            stream: stream.into(),
            subjects,
        }
    }
}

#[async_trait]
impl BusConnector for NatsConnector {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, PublishError> {
        let client = async_nats::connect(self.url.as_str())
            .await
            .map_err(|err| PublishError::Connect(format!("{}: {err}", self.url)))?;
        let jetstream = async_nats::jetstream::new(client.clone());
        jetstream
            .get_or_create_stream(async_nats::jetstream::stream::Config {
                name: self.stream.clone(),
                subjects: self.subjects.clone(),
                ..Default::default()
            })
            .await
            .map_err(|err| PublishError::Connect(format!("stream {}: {err}", self.stream)))?;
        info!(url = %self.url, stream = %self.stream, "connected to nats jetstream");
        Ok(Arc::new(NatsConnection { client, jetstream }))
    }
}

struct NatsConnection {
    client: async_nats::Client,
    jetstream: async_nats::jetstream::Context,
}

#[async_trait]
impl BusConnection for NatsConnection {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        let ack = self
            .jetstream
            .publish(topic.to_string(), payload)
            .await
            .map_err(|err| PublishError::Transport {
                topic: topic.to_string(),
                message: err.to_string(),
            })?;
        ack.await.map_err(|err| PublishError::NotAcknowledged {
            topic: topic.to_string(),
            message: err.to_string(),
        })?;
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.client
            .flush()
            .await
            .map_err(|err| PublishError::Transport {
                topic: String::new(),
                message: format!("flush on close: {err}"),
            })
    }
}

#[derive(Debug, Clone)]
struct PublishedMessage {
    topic: String,
    payload: Bytes,
}

#[derive(Default)]
struct MemoryBusState {
    connects: AtomicUsize,
    closes: AtomicUsize,
    fail_connect: AtomicBool,
    fail_publish: AtomicBool,
    connect_delay: RwLock<Option<Duration>>,
    published: RwLock<Vec<PublishedMessage>>,
}

/// In-process bus that records every acknowledged message.
#[derive(Clone, Default)]
pub struct MemoryBus {
    state: Arc<MemoryBusState>,
}

impl MemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stretch each connect so concurrent first callers overlap.
    pub fn with_connect_delay(self, delay: Duration) -> Self {
        *self
            .state
            .connect_delay
            .write()
            .unwrap_or_else(|e| e.into_inner()) = Some(delay);
        self
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.state.fail_connect.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.state.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn connect_count(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn close_count(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn publish_count(&self) -> usize {
        self.state
            .published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    /// Decoded payloads of every message on `topic`, in publish order.
    pub fn events_on(&self, topic: &str) -> Vec<PublishEvent> {
        self.state
            .published
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .filter(|m| m.topic == topic)
            .filter_map(|m| serde_json::from_slice(&m.payload).ok())
            .collect()
    }
}

#[async_trait]
impl BusConnector for MemoryBus {
    async fn connect(&self) -> Result<Arc<dyn BusConnection>, PublishError> {
        let delay = *self
            .state
            .connect_delay
            .read()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.state.fail_connect.load(Ordering::SeqCst) {
            return Err(PublishError::Connect("memory bus offline".to_string()));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(self.clone()))
    }
}

#[async_trait]
impl BusConnection for MemoryBus {
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), PublishError> {
        if self.state.fail_publish.load(Ordering::SeqCst) {
            return Err(PublishError::Transport {
                topic: topic.to_string(),
                message: "memory bus rejected publish".to_string(),
            });
        }
        self.state
            .published
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload,
            });
        Ok(())
    }

    async fn close(&self) -> Result<(), PublishError> {
        self.state.closes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use jobpipe_core::{JobSource, JobType, ProcessedJobRecord, PublishEventType, JOB_EVENTS_TOPIC};

    fn event() -> PublishEvent {
        let data = ProcessedJobRecord {
            source_job_id: "lnk-1".into(),
            title: "SRE".into(),
            company: "Acme".into(),
            description: "Pager".into(),
            requirements: vec![],
            location: "Lima".into(),
            is_remote: false,
            source_url: "https://linkedin.test/jobs/1".into(),
            salary_range: None,
            job_type: JobType::FullTime,
            level: "NOT_SPECIFIED".into(),
            source: JobSource::Linkedin,
        };
        PublishEvent::new(PublishEventType::JobCreated, data, "lnk-1", Utc::now())
    }

    #[tokio::test]
    async fn send_starts_the_publisher_lazily() {
        let bus = MemoryBus::new();
        let publisher = EventPublisher::new(Arc::new(bus.clone()));
        assert!(!publisher.is_started().await);

        publisher.send(JOB_EVENTS_TOPIC, &event()).await.unwrap();

        assert!(publisher.is_started().await);
        assert_eq!(bus.connect_count(), 1);
        let events = bus.events_on(JOB_EVENTS_TOPIC);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].metadata.raw_job_id, "lnk-1");
    }

    #[tokio::test]
    async fn concurrent_first_starts_connect_once() {
        let bus = MemoryBus::new().with_connect_delay(Duration::from_millis(25));
        let publisher = Arc::new(EventPublisher::new(Arc::new(bus.clone())));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let publisher = Arc::clone(&publisher);
                tokio::spawn(async move { publisher.start().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(bus.connect_count(), 1);
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_restart_reconnects() {
        let bus = MemoryBus::new();
        let publisher = EventPublisher::new(Arc::new(bus.clone()));

        publisher.stop().await.unwrap();
        assert_eq!(bus.close_count(), 0);

        publisher.start().await.unwrap();
        publisher.start().await.unwrap();
        publisher.stop().await.unwrap();
        publisher.stop().await.unwrap();
        assert_eq!(bus.connect_count(), 1);
        assert_eq!(bus.close_count(), 1);

        publisher.send(JOB_EVENTS_TOPIC, &event()).await.unwrap();
        assert_eq!(bus.connect_count(), 2);
    }

    #[tokio::test]
    async fn failures_carry_an_enumerated_reason() {
        let bus = MemoryBus::new();
        bus.set_fail_connect(true);
        let publisher = EventPublisher::new(Arc::new(bus.clone()));

        let err = publisher.send(JOB_EVENTS_TOPIC, &event()).await.unwrap_err();
        assert_eq!(err.reason(), PublishFailure::Connect);
        assert!(!publisher.is_started().await);

        bus.set_fail_connect(false);
        bus.set_fail_publish(true);
        let err = publisher.send(JOB_EVENTS_TOPIC, &event()).await.unwrap_err();
        assert_eq!(err.reason(), PublishFailure::Transport);
        assert_eq!(bus.publish_count(), 0);
    }
}
