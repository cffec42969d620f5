//! Synchronous REST client for the downstream job catalog.

use async_trait::async_trait;
use jobpipe_core::ProcessedJobRecord;
use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;
use tracing::{info_span, Instrument};
use uuid::Uuid;

use crate::{classify_reqwest_error, classify_status, HttpClientConfig, RetryDisposition};

/// Body returned by the catalog on a successful write; only the id is used.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct DownstreamJob {
    #[serde(default)]
    pub id: Option<Uuid>,
}

#[derive(Debug, Error)]
pub enum DownstreamError {
    #[error("downstream request failed: {source}")]
    Request {
        #[source]
        source: reqwest::Error,
        disposition: RetryDisposition,
    },
    #[error("downstream returned http {status} for {url}: {body}")]
    UnexpectedStatus {
        status: u16,
        url: String,
        body: String,
        disposition: RetryDisposition,
    },
    #[error("building downstream client: {0}")]
    Client(String),
}

impl DownstreamError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            DownstreamError::Request { disposition, .. }
            | DownstreamError::UnexpectedStatus { disposition, .. } => *disposition,
            DownstreamError::Client(_) => RetryDisposition::NonRetryable,
        }
    }
}

impl From<reqwest::Error> for DownstreamError {
    fn from(source: reqwest::Error) -> Self {
        let disposition = classify_reqwest_error(&source);
        DownstreamError::Request {
            source,
            disposition,
        }
    }
}

/// Direct write path into the job catalog, used when the bus is bypassed or down.
#[async_trait]
pub trait DownstreamApi: Send + Sync {
    async fn create_job(&self, job: &ProcessedJobRecord) -> Result<DownstreamJob, DownstreamError>;

    async fn update_job(
        &self,
        id: Uuid,
        job: &ProcessedJobRecord,
    ) -> Result<DownstreamJob, DownstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpDownstreamClient {
    client: reqwest::Client,
    base_url: String,
}

impl HttpDownstreamClient {
    pub fn new(
        base_url: impl Into<String>,
        config: HttpClientConfig,
    ) -> Result<Self, DownstreamError> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder
            .build()
            .map_err(|err| DownstreamError::Client(err.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    async fn expect_status(
        response: reqwest::Response,
        accepted: &[StatusCode],
    ) -> Result<DownstreamJob, DownstreamError> {
        let status = response.status();
        let url = response.url().to_string();
        let body = response.text().await?;
        if accepted.contains(&status) {
            return Ok(serde_json::from_str(&body).unwrap_or_default());
        }
        Err(DownstreamError::UnexpectedStatus {
            status: status.as_u16(),
            url,
            body,
            disposition: classify_status(status),
        })
    }
}

#[async_trait]
impl DownstreamApi for HttpDownstreamClient {
    async fn create_job(&self, job: &ProcessedJobRecord) -> Result<DownstreamJob, DownstreamError> {
        let url = format!("{}/jobs", self.base_url);
        let span = info_span!("downstream_create", url = %url, source_url = %job.source_url);
        async {
            let response = self.client.post(&url).json(job).send().await?;
            Self::expect_status(response, &[StatusCode::CREATED]).await
        }
        .instrument(span)
        .await
    }

    async fn update_job(
        &self,
        id: Uuid,
        job: &ProcessedJobRecord,
    ) -> Result<DownstreamJob, DownstreamError> {
        let url = format!("{}/jobs/{id}", self.base_url);
        let span = info_span!("downstream_update", url = %url, source_url = %job.source_url);
        async {
            let response = self.client.put(&url).json(job).send().await?;
            let mut updated =
                Self::expect_status(response, &[StatusCode::OK, StatusCode::NO_CONTENT]).await?;
            updated.id.get_or_insert(id);
            Ok(updated)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jobpipe_core::{JobSource, JobType};
    use serde_json::json;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn job() -> ProcessedJobRecord {
        ProcessedJobRecord {
            source_job_id: "https://jobs.test/1".into(),
            title: "Data Scientist".into(),
            company: "Acme".into(),
            description: "Models".into(),
            requirements: vec![],
            location: "Remote".into(),
            is_remote: true,
            source_url: "https://jobs.test/1".into(),
            salary_range: None,
            job_type: JobType::Contract,
            level: "SENIOR".into(),
            source: JobSource::Glassdoor,
        }
    }

    fn client(server: &MockServer) -> HttpDownstreamClient {
        HttpDownstreamClient::new(format!("{}/api/v1/", server.uri()), HttpClientConfig::default())
            .unwrap()
    }

    #[tokio::test]
    async fn create_accepts_201_and_reads_id() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs"))
            .and(body_partial_json(json!({"job_type": "CONTRACT", "source": "glassdoor"})))
            .respond_with(ResponseTemplate::new(201).set_body_json(json!({"id": id})))
            .expect(1)
            .mount(&server)
            .await;

        let created = client(&server).create_job(&job()).await.unwrap();
        assert_eq!(created.id, Some(id));
    }

    #[tokio::test]
    async fn create_treats_200_as_failure() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs"))
            .respond_with(ResponseTemplate::new(200).set_body_string("ok"))
            .mount(&server)
            .await;

        let err = client(&server).create_job(&job()).await.unwrap_err();
        match err {
            DownstreamError::UnexpectedStatus { status, .. } => assert_eq!(status, 200),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn server_error_is_marked_retryable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/jobs"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client(&server).create_job(&job()).await.unwrap_err();
        assert_eq!(err.disposition(), RetryDisposition::Retryable);
    }

    #[tokio::test]
    async fn update_puts_to_job_path() {
        let server = MockServer::start().await;
        let id = Uuid::new_v4();
        Mock::given(method("PUT"))
            .and(path(format!("/api/v1/jobs/{id}")))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let updated = client(&server).update_job(id, &job()).await.unwrap();
        assert_eq!(updated.id, Some(id));
    }
}
