//! Core domain model for the job ingestion pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use uuid::Uuid;

pub const CRATE_NAME: &str = "jobpipe-core";

/// Bus topic carrying every job create/update event.
pub const JOB_EVENTS_TOPIC: &str = "job-events";

/// Level reported downstream when the source did not state one.
pub const DEFAULT_LEVEL: &str = "NOT_SPECIFIED";

pub type RawData = Map<String, JsonValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobSource {
    Linkedin,
    Indeed,
    Glassdoor,
    Google,
    Other,
}

impl JobSource {
    pub const ALL: [JobSource; 5] = [
        JobSource::Linkedin,
        JobSource::Indeed,
        JobSource::Glassdoor,
        JobSource::Google,
        JobSource::Other,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobSource::Linkedin => "linkedin",
            JobSource::Indeed => "indeed",
            JobSource::Glassdoor => "glassdoor",
            JobSource::Google => "google",
            JobSource::Other => "other",
        }
    }
}

impl fmt::Display for JobSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown job source: {0}")]
pub struct UnknownSource(pub String);

impl FromStr for JobSource {
    type Err = UnknownSource;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        JobSource::ALL
            .into_iter()
            .find(|source| source.as_str() == lower)
            .ok_or_else(|| UnknownSource(s.to_string()))
    }
}

/// Structured salary signals as reported by a source, before formatting.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SalaryInput {
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
    pub interval: Option<String>,
    pub currency: Option<String>,
}

impl SalaryInput {
    pub fn is_empty(&self) -> bool {
        self.min_amount.is_none()
            && self.max_amount.is_none()
            && self.interval.is_none()
            && self.currency.is_none()
    }
}

/// Validated adapter output. This is the only shape `RawJobStore::save` accepts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPosting {
    pub source: JobSource,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: String,
    pub url: String,
    pub salary_range: Option<String>,
    #[serde(default)]
    pub salary: SalaryInput,
    #[serde(default)]
    pub requirements: Vec<String>,
    pub job_type: Option<String>,
    pub experience_level: Option<String>,
    #[serde(default)]
    pub raw_data: RawData,
}

/// Deterministic identifier for the raw record keyed by `(source, url)`.
pub fn raw_job_uuid(source: JobSource, url: &str) -> Uuid {
    let key = format!("{}:{}", source.as_str(), url);
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

/// Stored raw posting plus its processing lifecycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawJobRecord {
    pub id: Uuid,
    pub source: JobSource,
    pub job_id: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub location: String,
    pub url: String,
    pub salary_range: Option<String>,
    pub salary: SalaryInput,
    pub requirements: Vec<String>,
    pub job_type: Option<String>,
    pub experience_level: Option<String>,
    pub raw_data: RawData,
    pub processed: bool,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub poisoned: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RawJobRecord {
    /// Fresh, unprocessed record for a first insert.
    pub fn from_posting(posting: JobPosting, now: DateTime<Utc>) -> Self {
        Self {
            id: raw_job_uuid(posting.source, &posting.url),
            source: posting.source,
            job_id: posting.job_id,
            title: posting.title,
            company: posting.company,
            description: posting.description,
            location: posting.location,
            url: posting.url,
            salary_range: posting.salary_range,
            salary: posting.salary,
            requirements: posting.requirements,
            job_type: posting.job_type,
            experience_level: posting.experience_level,
            raw_data: posting.raw_data,
            processed: false,
            attempts: 0,
            last_error: None,
            poisoned: false,
            created_at: now,
            updated_at: now,
        }
    }

    /// Overwrite the scraped fields from a re-ingested posting. Lifecycle
    /// columns (`processed`, attempts, `created_at`) are left untouched.
    pub fn apply_posting(&mut self, posting: JobPosting, now: DateTime<Utc>) {
        self.job_id = posting.job_id;
        self.title = posting.title;
        self.company = posting.company;
        self.description = posting.description;
        self.location = posting.location;
        self.salary_range = posting.salary_range;
        self.salary = posting.salary;
        self.requirements = posting.requirements;
        self.job_type = posting.job_type;
        self.experience_level = posting.experience_level;
        self.raw_data = posting.raw_data;
        self.updated_at = advance(self.updated_at, now);
    }
}

/// `now`, or one microsecond past `previous` when the clock has not moved.
pub fn advance(previous: DateTime<Utc>, now: DateTime<Utc>) -> DateTime<Utc> {
    let floor = previous + chrono::Duration::microseconds(1);
    if now > floor {
        now
    } else {
        floor
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobType {
    #[default]
    FullTime,
    PartTime,
    Contract,
}

impl JobType {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::FullTime => "FULL_TIME",
            JobType::PartTime => "PART_TIME",
            JobType::Contract => "CONTRACT",
        }
    }
}

/// Canonical record consumed by the downstream job catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessedJobRecord {
    pub source_job_id: String,
    pub title: String,
    pub company: String,
    pub description: String,
    pub requirements: Vec<String>,
    pub location: String,
    pub is_remote: bool,
    pub source_url: String,
    pub salary_range: Option<String>,
    pub job_type: JobType,
    pub level: String,
    pub source: JobSource,
}

/// Local, best-effort mirror of what was pushed downstream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackingRecord {
    pub id: Uuid,
    pub title: String,
    pub description: String,
    pub company: String,
    pub source: JobSource,
    pub source_url: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TrackingRecord {
    pub fn from_processed(id: Uuid, job: &ProcessedJobRecord, now: DateTime<Utc>) -> Self {
        Self {
            id,
            title: job.title.clone(),
            description: job.description.clone(),
            company: job.company.clone(),
            source: job.source,
            source_url: job.source_url.clone(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn refresh_from(&mut self, job: &ProcessedJobRecord, now: DateTime<Utc>) {
        self.title = job.title.clone();
        self.description = job.description.clone();
        self.company = job.company.clone();
        self.source = job.source;
        self.updated_at = advance(self.updated_at, now);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PublishEventType {
    JobCreated,
    JobUpdated,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventMetadata {
    pub source: JobSource,
    pub processed_at: DateTime<Utc>,
    pub raw_job_id: String,
}

/// Wire payload published on [`JOB_EVENTS_TOPIC`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishEvent {
    #[serde(rename = "type")]
    pub event_type: PublishEventType,
    pub data: ProcessedJobRecord,
    pub metadata: EventMetadata,
}

impl PublishEvent {
    pub fn new(
        event_type: PublishEventType,
        data: ProcessedJobRecord,
        raw_job_id: impl Into<String>,
        processed_at: DateTime<Utc>,
    ) -> Self {
        let metadata = EventMetadata {
            source: data.source,
            processed_at,
            raw_job_id: raw_job_id.into(),
        };
        Self {
            event_type,
            data,
            metadata,
        }
    }
}
