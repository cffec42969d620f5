//! Source adapter contracts, ingestion-boundary validation + fixture-first adapters.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use jobpipe_core::{JobPosting, JobSource, RawData, SalaryInput};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpipe-adapters";

/// One unstructured posting as an adapter hands it over. Keys and casing vary by source.
pub type RawPosting = RawData;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
    pub search_term: String,
    pub location: Option<String>,
}

impl AdapterContext {
    pub fn new(run_id: Uuid, search_term: impl Into<String>, location: Option<String>) -> Self {
        Self {
            run_id,
            fetched_at: Utc::now(),
            search_term: search_term.into(),
            location,
        }
    }
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// External collaborator yielding raw per-posting records for one source.
#[async_trait]
pub trait JobSourceAdapter: Send + Sync {
    fn source(&self) -> JobSource;

    fn name(&self) -> &str;

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawPosting>, AdapterError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("field `{0}` has an unsupported type")]
    InvalidType(&'static str),
    #[error("invalid posting url `{0}`")]
    InvalidUrl(String),
}

const TITLE_KEYS: &[&str] = &["title", "job_title"];
const COMPANY_KEYS: &[&str] = &["company", "company_name"];
const DESCRIPTION_KEYS: &[&str] = &["description", "job_description", "summary"];
const URL_KEYS: &[&str] = &["job_url", "url", "source_url"];
const JOB_ID_KEYS: &[&str] = &["job_id", "id"];
const LEVEL_KEYS: &[&str] = &["job_level", "experience_level"];

/// Map a site name onto a known source; unknown sites become [`JobSource::Other`].
pub fn map_source(site: &str) -> JobSource {
    match site.parse::<JobSource>() {
        Ok(source) => source,
        Err(_) => {
            warn!(site, "unrecognized site, defaulting to other");
            JobSource::Other
        }
    }
}

fn lookup<'a>(raw: &'a RawPosting, aliases: &[&str]) -> Option<&'a JsonValue> {
    aliases.iter().find_map(|alias| {
        raw.iter()
            .find(|(key, value)| key.eq_ignore_ascii_case(alias) && !value.is_null())
            .map(|(_, value)| value)
    })
}

fn text(
    raw: &RawPosting,
    aliases: &[&str],
    field: &'static str,
) -> Result<Option<String>, ValidationError> {
    let Some(value) = lookup(raw, aliases) else {
        return Ok(None);
    };
    let rendered = match value {
        JsonValue::String(s) => s.trim().to_string(),
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        _ => return Err(ValidationError::InvalidType(field)),
    };
    Ok(if rendered.is_empty() { None } else { Some(rendered) })
}

fn required_text(
    raw: &RawPosting,
    aliases: &[&str],
    field: &'static str,
) -> Result<String, ValidationError> {
    text(raw, aliases, field)?.ok_or(ValidationError::MissingField(field))
}

fn amount(raw: &RawPosting, key: &'static str) -> Result<Option<f64>, ValidationError> {
    let Some(value) = lookup(raw, &[key]) else {
        return Ok(None);
    };
    let parsed = match value {
        JsonValue::Number(n) => n.as_f64(),
        JsonValue::String(s) if s.trim().is_empty() => None,
        JsonValue::String(s) => Some(
            s.trim()
                .replace(',', "")
                .parse::<f64>()
                .map_err(|_| ValidationError::InvalidType(key))?,
        ),
        _ => return Err(ValidationError::InvalidType(key)),
    };
    Ok(parsed.filter(|v| v.is_finite()))
}

fn requirements(raw: &RawPosting) -> Result<Vec<String>, ValidationError> {
    match lookup(raw, &["requirements"]) {
        None => Ok(Vec::new()),
        Some(JsonValue::Array(items)) => Ok(items
            .iter()
            .filter_map(|item| item.as_str())
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect()),
        Some(_) => Err(ValidationError::InvalidType("requirements")),
    }
}

fn location(raw: &RawPosting) -> Result<String, ValidationError> {
    if let Some(location) = text(raw, &["location"], "location")? {
        return Ok(location);
    }
    let city = text(raw, &["city"], "city")?.unwrap_or_default();
    let state = text(raw, &["state"], "state")?.unwrap_or_default();
    Ok(format!("{city} {state}").trim().to_string())
}

/// Validate one adapter record into the typed posting stored by the pipeline.
///
/// A `site` key overrides the adapter's own source. Title, company, description and
/// an absolute http(s) url are required; the url doubles as `job_id` when the source
/// supplies none.
pub fn validate_posting(
    default_source: JobSource,
    raw: &RawPosting,
) -> Result<JobPosting, ValidationError> {
    let source = match text(raw, &["site"], "site")? {
        Some(site) => map_source(&site),
        None => default_source,
    };

    let url = required_text(raw, URL_KEYS, "url")?;
    match url::Url::parse(&url) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") => {}
        _ => return Err(ValidationError::InvalidUrl(url)),
    }

    let salary = SalaryInput {
        min_amount: amount(raw, "min_amount")?,
        max_amount: amount(raw, "max_amount")?,
        interval: text(raw, &["interval"], "interval")?.map(|s| s.to_ascii_lowercase()),
        currency: text(raw, &["currency"], "currency")?.map(|s| s.to_ascii_uppercase()),
    };

    Ok(JobPosting {
        source,
        job_id: text(raw, JOB_ID_KEYS, "job_id")?.unwrap_or_else(|| url.clone()),
        title: required_text(raw, TITLE_KEYS, "title")?,
        company: required_text(raw, COMPANY_KEYS, "company")?,
        description: required_text(raw, DESCRIPTION_KEYS, "description")?,
        location: location(raw)?,
        url,
        salary_range: text(raw, &["salary_range"], "salary_range")?,
        salary,
        requirements: requirements(raw)?,
        job_type: text(raw, &["job_type"], "job_type")?,
        experience_level: text(raw, LEVEL_KEYS, "experience_level")?,
        raw_data: raw.clone(),
    })
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixtureFile {
    #[serde(default)]
    pub captured_from_url: Option<String>,
    pub postings: Vec<RawPosting>,
}

pub async fn load_fixture_file(path: impl AsRef<Path>) -> anyhow::Result<FixtureFile> {
    let path = path.as_ref();
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn matches_term(posting: &RawPosting, term: &str) -> bool {
    let term = term.trim().to_lowercase();
    if term.is_empty() {
        return true;
    }
    [TITLE_KEYS, DESCRIPTION_KEYS].iter().any(|aliases| {
        lookup(posting, aliases)
            .and_then(|v| v.as_str())
            .is_some_and(|s| s.to_lowercase().contains(&term))
    })
}

/// Replays captured postings from a JSON fixture, filtered by the search term.
#[derive(Debug, Clone)]
pub struct FixtureAdapter {
    source: JobSource,
    name: String,
    path: PathBuf,
}

impl FixtureAdapter {
    pub fn new(source: JobSource, path: impl Into<PathBuf>) -> Self {
        Self {
            source,
            name: format!("{source}-fixture"),
            path: path.into(),
        }
    }
}

#[async_trait]
impl JobSourceAdapter for FixtureAdapter {
    fn source(&self) -> JobSource {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawPosting>, AdapterError> {
        let fixture = load_fixture_file(&self.path).await?;
        Ok(fixture
            .postings
            .into_iter()
            .filter(|posting| matches_term(posting, &ctx.search_term))
            .collect())
    }
}

/// Fixed in-memory postings; handy for wiring tests and dry runs.
#[derive(Debug, Clone)]
pub struct StaticAdapter {
    source: JobSource,
    name: String,
    postings: Arc<Vec<RawPosting>>,
    failure: Option<String>,
}

impl StaticAdapter {
    pub fn new(source: JobSource, postings: Vec<RawPosting>) -> Self {
        Self {
            source,
            name: format!("{source}-static"),
            postings: Arc::new(postings),
            failure: None,
        }
    }

    /// An adapter whose every fetch fails with `message`.
    pub fn failing(source: JobSource, message: impl Into<String>) -> Self {
        Self {
            failure: Some(message.into()),
            ..Self::new(source, Vec::new())
        }
    }
}

#[async_trait]
impl JobSourceAdapter for StaticAdapter {
    fn source(&self) -> JobSource {
        self.source
    }

    fn name(&self) -> &str {
        &self.name
    }

    async fn fetch(&self, ctx: &AdapterContext) -> Result<Vec<RawPosting>, AdapterError> {
        if let Some(message) = &self.failure {
            return Err(AdapterError::Message(message.clone()));
        }
        Ok(self
            .postings
            .iter()
            .filter(|posting| matches_term(posting, &ctx.search_term))
            .cloned()
            .collect())
    }
}

/// Build the adapter for a configured source, resolving its fixture against `workspace_root`.
pub fn adapter_for_source(
    source: JobSource,
    fixture: &Path,
    workspace_root: &Path,
) -> Box<dyn JobSourceAdapter> {
    let path = if fixture.is_absolute() {
        fixture.to_path_buf()
    } else {
        workspace_root.join(fixture)
    };
    Box::new(FixtureAdapter::new(source, path))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn raw(value: JsonValue) -> RawPosting {
        value.as_object().cloned().expect("object")
    }

    #[test]
    fn validates_upper_case_jobspy_style_record() {
        let record = raw(json!({
            "SITE": "Indeed",
            "TITLE": "Python Developer",
            "COMPANY": "Acme",
            "DESCRIPTION": "Work on ETL",
            "CITY": "Lima",
            "STATE": "Peru",
            "JOB_URL": "https://indeed.test/viewjob?jk=1",
            "JOB_TYPE": "fulltime",
            "job_level": "mid",
            "min_amount": 1200,
            "max_amount": "2,400",
            "interval": "Yearly",
            "currency": null
        }));

        let posting = validate_posting(JobSource::Other, &record).unwrap();
        assert_eq!(posting.source, JobSource::Indeed);
        assert_eq!(posting.title, "Python Developer");
        assert_eq!(posting.location, "Lima Peru");
        assert_eq!(posting.job_id, "https://indeed.test/viewjob?jk=1");
        assert_eq!(posting.job_type.as_deref(), Some("fulltime"));
        assert_eq!(posting.experience_level.as_deref(), Some("mid"));
        assert_eq!(posting.salary.min_amount, Some(1200.0));
        assert_eq!(posting.salary.max_amount, Some(2400.0));
        assert_eq!(posting.salary.interval.as_deref(), Some("yearly"));
        assert_eq!(posting.salary.currency, None);
        assert_eq!(posting.raw_data, record);
    }

    #[test]
    fn validates_lower_case_scraper_record_with_aliases() {
        let record = raw(json!({
            "job_title": "Frontend Developer",
            "company_name": "Globex",
            "job_description": "React",
            "location": "Remote",
            "source_url": "https://www.linkedin.com/jobs/view/42",
            "requirements": ["TypeScript", " ", "CSS"]
        }));

        let posting = validate_posting(JobSource::Linkedin, &record).unwrap();
        assert_eq!(posting.source, JobSource::Linkedin);
        assert_eq!(posting.company, "Globex");
        assert_eq!(posting.requirements, vec!["TypeScript", "CSS"]);
        assert!(posting.salary.is_empty());
    }

    #[test]
    fn missing_title_is_rejected() {
        let record = raw(json!({
            "company": "Acme",
            "description": "x",
            "url": "https://jobs.test/1"
        }));
        assert_eq!(
            validate_posting(JobSource::Google, &record).unwrap_err(),
            ValidationError::MissingField("title")
        );
    }

    #[test]
    fn blank_description_is_rejected() {
        let record = raw(json!({
            "title": "t",
            "company": "Acme",
            "description": "   ",
            "url": "https://jobs.test/1"
        }));
        assert_eq!(
            validate_posting(JobSource::Google, &record).unwrap_err(),
            ValidationError::MissingField("description")
        );
    }

    #[test]
    fn relative_url_is_rejected() {
        let record = raw(json!({
            "title": "t",
            "company": "Acme",
            "description": "d",
            "url": "/jobs/1"
        }));
        assert!(matches!(
            validate_posting(JobSource::Google, &record),
            Err(ValidationError::InvalidUrl(_))
        ));
    }

    #[test]
    fn non_numeric_salary_is_rejected() {
        let record = raw(json!({
            "title": "t",
            "company": "Acme",
            "description": "d",
            "url": "https://jobs.test/1",
            "min_amount": "competitive"
        }));
        assert_eq!(
            validate_posting(JobSource::Google, &record).unwrap_err(),
            ValidationError::InvalidType("min_amount")
        );
    }

    #[test]
    fn unknown_sites_map_to_other() {
        assert_eq!(map_source("GLASSDOOR"), JobSource::Glassdoor);
        assert_eq!(map_source("monster"), JobSource::Other);
    }

    #[tokio::test]
    async fn static_adapter_filters_by_search_term() {
        let adapter = StaticAdapter::new(
            JobSource::Indeed,
            vec![
                raw(json!({"title": "Python Developer", "description": "d"})),
                raw(json!({"title": "Nurse", "description": "hospital"})),
            ],
        );
        let ctx = AdapterContext::new(Uuid::new_v4(), "python", None);
        let postings = adapter.fetch(&ctx).await.unwrap();
        assert_eq!(postings.len(), 1);

        let all = adapter
            .fetch(&AdapterContext::new(Uuid::new_v4(), "", None))
            .await
            .unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn fixture_adapter_reads_postings_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("indeed.json");
        std::fs::write(
            &path,
            serde_json::to_vec(&json!({
                "captured_from_url": "https://indeed.test/search?q=devops",
                "postings": [
                    {"title": "DevOps Engineer", "company": "Acme", "description": "k8s", "job_url": "https://indeed.test/1"},
                    {"title": "Data Scientist", "company": "Acme", "description": "ml", "job_url": "https://indeed.test/2"}
                ]
            }))
            .unwrap(),
        )
        .unwrap();

        let adapter = adapter_for_source(JobSource::Indeed, Path::new("indeed.json"), dir.path());
        assert_eq!(adapter.source(), JobSource::Indeed);
        let postings = adapter
            .fetch(&AdapterContext::new(Uuid::new_v4(), "devops", None))
            .await
            .unwrap();
        assert_eq!(postings.len(), 1);
        assert!(validate_posting(adapter.source(), &postings[0]).is_ok());
    }

    #[tokio::test]
    async fn missing_fixture_is_an_adapter_error() {
        let adapter = FixtureAdapter::new(JobSource::Google, "/definitely/not/here.json");
        let err = adapter
            .fetch(&AdapterContext::new(Uuid::new_v4(), "", None))
            .await
            .unwrap_err();
        assert!(matches!(err, AdapterError::Anyhow(_)));
    }
}
