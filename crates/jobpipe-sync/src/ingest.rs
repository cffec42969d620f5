//! Adapter fetch -> validation -> raw store.

use std::sync::Arc;
use std::time::Duration;

use jobpipe_adapters::{validate_posting, AdapterContext, JobSourceAdapter};
use jobpipe_core::JobSource;
use jobpipe_storage::{RawJobStore, StoreError};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum IngestError {
    #[error("storage unavailable during ingestion: {0}")]
    StorageUnavailable(#[source] StoreError),
}

/// One adapter plus the search terms it runs for.
pub struct SourceRun {
    pub adapter: Arc<dyn JobSourceAdapter>,
    pub search_terms: Vec<String>,
    pub location: Option<String>,
}

impl SourceRun {
    pub fn new(adapter: Arc<dyn JobSourceAdapter>, search_terms: Vec<String>) -> Self {
        Self {
            adapter,
            search_terms,
            location: None,
        }
    }

    pub fn with_location(mut self, location: Option<String>) -> Self {
        self.location = location;
        self
    }

    fn terms(&self) -> Vec<String> {
        if self.search_terms.is_empty() {
            vec![String::new()]
        } else {
            self.search_terms.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TermFailure {
    pub source: JobSource,
    pub search_term: String,
    pub reason: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IngestReport {
    pub fetched: usize,
    pub saved: usize,
    pub rejected: usize,
    pub save_failures: usize,
    pub failed_terms: Vec<TermFailure>,
}

pub struct Ingestor {
    store: Arc<dyn RawJobStore>,
    sources: Vec<SourceRun>,
    adapter_timeout: Duration,
}

impl Ingestor {
    pub fn new(
        store: Arc<dyn RawJobStore>,
        sources: Vec<SourceRun>,
        adapter_timeout: Duration,
    ) -> Self {
        Self {
            store,
            sources,
            adapter_timeout,
        }
    }

    /// Fetch every source/term pair and upsert the valid postings.
    ///
    /// Adapter errors and timeouts are per-term; an unreachable store aborts the run.
    pub async fn run(&self, run_id: Uuid) -> Result<IngestReport, IngestError> {
        self.store
            .ping()
            .await
            .map_err(IngestError::StorageUnavailable)?;

        let mut report = IngestReport::default();
        for run in &self.sources {
            let adapter = &run.adapter;
            for term in run.terms() {
                let ctx = AdapterContext::new(run_id, term.clone(), run.location.clone());
                let fetched = tokio::time::timeout(self.adapter_timeout, adapter.fetch(&ctx)).await;
                let postings = match fetched {
                    Ok(Ok(postings)) => postings,
                    Ok(Err(err)) => {
                        warn!(adapter = adapter.name(), search_term = %term, error = %err, "adapter fetch failed");
                        report.failed_terms.push(TermFailure {
                            source: adapter.source(),
                            search_term: term,
                            reason: err.to_string(),
                        });
                        continue;
                    }
                    Err(_) => {
                        warn!(
                            adapter = adapter.name(),
                            search_term = %term,
                            timeout_secs = self.adapter_timeout.as_secs(),
                            "adapter fetch timed out"
                        );
                        report.failed_terms.push(TermFailure {
                            source: adapter.source(),
                            search_term: term,
                            reason: format!("timed out after {:?}", self.adapter_timeout),
                        });
                        continue;
                    }
                };

                report.fetched += postings.len();
                for raw in &postings {
                    let posting = match validate_posting(adapter.source(), raw) {
                        Ok(posting) => posting,
                        Err(err) => {
                            warn!(adapter = adapter.name(), error = %err, "rejected posting");
                            report.rejected += 1;
                            continue;
                        }
                    };
                    let url = posting.url.clone();
                    match self.store.save(posting).await {
                        Ok(_) => report.saved += 1,
                        Err(err) if err.is_unavailable() => {
                            return Err(IngestError::StorageUnavailable(err));
                        }
                        Err(err) => {
                            warn!(url = %url, error = %err, "saving posting failed");
                            report.save_failures += 1;
                        }
                    }
                }
            }
        }

        info!(
            %run_id,
            fetched = report.fetched,
            saved = report.saved,
            rejected = report.rejected,
            failed_terms = report.failed_terms.len(),
            "ingestion finished"
        );
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use jobpipe_adapters::{AdapterError, RawPosting, StaticAdapter};
    use jobpipe_storage::MemoryStore;
    use serde_json::json;

    fn raw(title: &str, url: &str) -> RawPosting {
        json!({
            "TITLE": title,
            "COMPANY": "Acme",
            "DESCRIPTION": format!("{title} role"),
            "JOB_URL": url,
            "CITY": "Lima",
            "STATE": "Peru",
        })
        .as_object()
        .cloned()
        .unwrap()
    }

    struct SlowAdapter;

    #[async_trait]
    impl JobSourceAdapter for SlowAdapter {
        fn source(&self) -> JobSource {
            JobSource::Google
        }

        fn name(&self) -> &str {
            "slow"
        }

        async fn fetch(&self, _ctx: &AdapterContext) -> Result<Vec<RawPosting>, AdapterError> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Vec::new())
        }
    }

    #[tokio::test]
    async fn runs_each_search_term_and_upserts() {
        let store = Arc::new(MemoryStore::new());
        let adapter = StaticAdapter::new(
            JobSource::Indeed,
            vec![
                raw("Python Developer", "https://indeed.test/1"),
                raw("Data Analyst", "https://indeed.test/2"),
            ],
        );
        let ingestor = Ingestor::new(
            store.clone(),
            vec![SourceRun::new(
                Arc::new(adapter),
                vec!["python".into(), "data".into(), "developer".into()],
            )],
            Duration::from_secs(5),
        );

        let report = ingestor.run(Uuid::new_v4()).await.unwrap();
        assert_eq!(report.fetched, 3);
        assert_eq!(report.saved, 3);
        assert_eq!(store.raw_count(), 2);
    }

    #[tokio::test]
    async fn invalid_postings_are_skipped_and_counted() {
        let store = Arc::new(MemoryStore::new());
        let mut missing_company = raw("Tester", "https://indeed.test/3");
        missing_company.remove("COMPANY");
        let adapter = StaticAdapter::new(
            JobSource::Indeed,
            vec![missing_company, raw("Engineer", "https://indeed.test/4")],
        );
        let ingestor = Ingestor::new(
            store.clone(),
            vec![SourceRun::new(Arc::new(adapter), vec![])],
            Duration::from_secs(5),
        );

        let report = ingestor.run(Uuid::new_v4()).await.unwrap();
        assert_eq!(report.rejected, 1);
        assert_eq!(report.saved, 1);
    }

    #[tokio::test]
    async fn failing_and_slow_adapters_do_not_stop_other_sources() {
        let store = Arc::new(MemoryStore::new());
        let ingestor = Ingestor::new(
            store.clone(),
            vec![
                SourceRun::new(Arc::new(StaticAdapter::failing(JobSource::Linkedin, "blocked")), vec![]),
                SourceRun::new(Arc::new(SlowAdapter), vec!["rust".into()]),
                SourceRun::new(
                    Arc::new(StaticAdapter::new(
                        JobSource::Glassdoor,
                        vec![raw("Rust Engineer", "https://glassdoor.test/1")],
                    )),
                    vec![],
                ),
            ],
            Duration::from_millis(50),
        );

        let report = ingestor.run(Uuid::new_v4()).await.unwrap();
        assert_eq!(report.failed_terms.len(), 2);
        assert_eq!(report.failed_terms[0].reason, "blocked");
        assert_eq!(report.failed_terms[1].source, JobSource::Google);
        assert!(report.failed_terms[1].reason.starts_with("timed out"));
        assert_eq!(store.raw_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_store_aborts_before_fetching() {
        let store = Arc::new(MemoryStore::new());
        store.set_available(false);
        let ingestor = Ingestor::new(
            store.clone(),
            vec![SourceRun::new(
                Arc::new(StaticAdapter::new(JobSource::Indeed, vec![raw("A", "https://a.test/1")])),
                vec![],
            )],
            Duration::from_secs(5),
        );

        let err = ingestor.run(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, IngestError::StorageUnavailable(StoreError::Unavailable(_))));
    }
}
