//! Raw record -> canonical record transform.
//!
//! Everything here is a pure function of the raw record: no clock, no I/O, no
//! randomness. Running it twice on the same record gives the same output.

use std::sync::Arc;

use jobpipe_core::{JobType, ProcessedJobRecord, RawJobRecord, SalaryInput, DEFAULT_LEVEL};
use thiserror::Error;

pub const REMOTE_KEYWORDS: &[&str] = &[
    "remote",
    "remoto",
    "trabajo a distancia",
    "home office",
    "teletrabajo",
];

// Checked in this order; the first group with a hit wins.
const FULL_TIME_KEYWORDS: &[&str] = &["full", "tiempo completo"];
const PART_TIME_KEYWORDS: &[&str] = &["part", "medio tiempo"];
const CONTRACT_KEYWORDS: &[&str] = &["contract", "contrato"];

/// Range substituted when a posting carries no salary bounds at all.
pub const DEFAULT_SALARY_MIN: f64 = 1000.0;
pub const DEFAULT_SALARY_MAX: f64 = 3000.0;

pub const PERU_COUNTRY_CODE: &str = "PE";
pub const PERU_CURRENCY: &str = "PEN";
const PERU_IDENTIFIERS: &[&str] = &["pe", "peru", "perú"];

pub const UNSPECIFIED_SALARY: &str = "Salario no especificado.";

#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransformError {
    #[error("field `{0}` is empty")]
    EmptyField(&'static str),
    #[error("invalid salary {field}: {value}")]
    InvalidSalary { field: &'static str, value: f64 },
    #[error("requirement extraction failed: {0}")]
    Requirements(String),
}

/// Hook for pulling requirement bullet points out of free text.
pub trait RequirementExtractor: Send + Sync {
    fn extract(&self, description: &str) -> Result<Vec<String>, TransformError>;
}

/// Current extractor: always an empty list.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoRequirementExtractor;

impl RequirementExtractor for NoRequirementExtractor {
    fn extract(&self, _description: &str) -> Result<Vec<String>, TransformError> {
        Ok(Vec::new())
    }
}

#[derive(Clone)]
pub struct NormalizationEngine {
    requirements: Arc<dyn RequirementExtractor>,
}

impl Default for NormalizationEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for NormalizationEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NormalizationEngine").finish_non_exhaustive()
    }
}

impl NormalizationEngine {
    pub fn new() -> Self {
        Self {
            requirements: Arc::new(NoRequirementExtractor),
        }
    }

    pub fn with_requirement_extractor(mut self, extractor: Arc<dyn RequirementExtractor>) -> Self {
        self.requirements = extractor;
        self
    }

    pub fn normalize(&self, raw: &RawJobRecord) -> Result<ProcessedJobRecord, TransformError> {
        if raw.title.trim().is_empty() {
            return Err(TransformError::EmptyField("title"));
        }
        if raw.description.trim().is_empty() {
            return Err(TransformError::EmptyField("description"));
        }
        if raw.url.trim().is_empty() {
            return Err(TransformError::EmptyField("url"));
        }

        let requirements = self.requirements.extract(&raw.description)?;
        let salary_range = match raw.salary_range.as_deref().map(str::trim) {
            Some(provided) if !provided.is_empty() => provided.to_string(),
            _ => normalize_salary(&raw.salary, &raw.location)?.render(),
        };

        Ok(ProcessedJobRecord {
            source_job_id: raw.job_id.clone(),
            title: raw.title.clone(),
            company: raw.company.clone(),
            description: raw.description.clone(),
            requirements,
            location: raw.location.clone(),
            is_remote: detect_remote(&raw.description, &raw.location),
            source_url: raw.url.clone(),
            salary_range: Some(salary_range),
            job_type: normalize_job_type(raw.job_type.as_deref()),
            level: raw
                .experience_level
                .as_deref()
                .map(str::trim)
                .filter(|level| !level.is_empty())
                .unwrap_or(DEFAULT_LEVEL)
                .to_string(),
            source: raw.source,
        })
    }
}

pub fn detect_remote(description: &str, location: &str) -> bool {
    let description = description.to_lowercase();
    let location = location.to_lowercase();
    REMOTE_KEYWORDS
        .iter()
        .any(|keyword| description.contains(keyword) || location.contains(keyword))
}

pub fn normalize_job_type(job_type: Option<&str>) -> JobType {
    let Some(job_type) = job_type.map(str::to_lowercase) else {
        return JobType::FullTime;
    };
    let hit = |keywords: &[&str]| keywords.iter().any(|k| job_type.contains(k));
    if hit(FULL_TIME_KEYWORDS) {
        JobType::FullTime
    } else if hit(PART_TIME_KEYWORDS) {
        JobType::PartTime
    } else if hit(CONTRACT_KEYWORDS) {
        JobType::Contract
    } else {
        JobType::FullTime
    }
}

/// Two-letter country code found in free-form location text, if any.
///
/// Identifiers match whole words only, so "Peruvian" or "Perth" give no signal.
pub fn country_signal(location: &str) -> Option<&'static str> {
    let lower = location.to_lowercase();
    let hit = lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .any(|token| PERU_IDENTIFIERS.contains(&token));
    hit.then_some(PERU_COUNTRY_CODE)
}

pub fn interval_label(interval: &str) -> &'static str {
    match interval {
        "monthly" => "mensual",
        "yearly" => "anual",
        "weekly" => "semanal",
        "daily" => "diario",
        "hourly" => "por hora",
        _ => "",
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct NormalizedSalary {
    pub currency: Option<String>,
    pub interval: Option<String>,
    pub min_amount: Option<f64>,
    pub max_amount: Option<f64>,
}

fn checked_amount(
    field: &'static str,
    value: Option<f64>,
) -> Result<Option<f64>, TransformError> {
    match value {
        Some(v) if !v.is_finite() || v < 0.0 => {
            Err(TransformError::InvalidSalary { field, value: v })
        }
        // zero means "not stated"
        Some(v) if v == 0.0 => Ok(None),
        other => Ok(other),
    }
}

pub fn normalize_salary(
    input: &SalaryInput,
    location: &str,
) -> Result<NormalizedSalary, TransformError> {
    let mut min_amount = checked_amount("min_amount", input.min_amount)?;
    let mut max_amount = checked_amount("max_amount", input.max_amount)?;
    let mut interval = input
        .interval
        .as_deref()
        .map(|s| s.trim().to_lowercase())
        .filter(|s| !s.is_empty());
    let mut currency = input
        .currency
        .as_deref()
        .map(|s| s.trim().to_uppercase())
        .filter(|s| !s.is_empty());

    if country_signal(location) == Some(PERU_COUNTRY_CODE) {
        if currency.as_deref().map_or(true, |c| c == "USD") {
            currency = Some(PERU_CURRENCY.to_string());
        }
        if interval.as_deref() == Some("yearly") {
            min_amount = min_amount.map(|v| v / 12.0);
            max_amount = max_amount.map(|v| v / 12.0);
            interval = Some("monthly".to_string());
        }
    }

    if min_amount.is_none() && max_amount.is_none() {
        min_amount = Some(DEFAULT_SALARY_MIN);
        max_amount = Some(DEFAULT_SALARY_MAX);
    }

    Ok(NormalizedSalary {
        currency,
        interval,
        min_amount,
        max_amount,
    })
}

/// `1234.5` -> `"1,234.50"`.
pub fn format_amount(value: f64) -> String {
    let fixed = format!("{value:.2}");
    let (int_part, frac_part) = fixed.split_once('.').unwrap_or((fixed.as_str(), "00"));
    let mut grouped = String::with_capacity(int_part.len() + int_part.len() / 3);
    for (i, ch) in int_part.chars().enumerate() {
        if i > 0 && (int_part.len() - i) % 3 == 0 {
            grouped.push(',');
        }
        grouped.push(ch);
    }
    format!("{grouped}.{frac_part}")
}

impl NormalizedSalary {
    pub fn render(&self) -> String {
        let currency = self.currency.as_deref().unwrap_or_default();
        let label = self.interval.as_deref().map(interval_label).unwrap_or_default();
        let parts = match (self.min_amount, self.max_amount) {
            (Some(min), Some(max)) => vec![
                currency.to_string(),
                format_amount(min),
                "-".to_string(),
                format_amount(max),
                label.to_string(),
            ],
            (Some(min), None) => vec![
                currency.to_string(),
                format!("{}+", format_amount(min)),
                label.to_string(),
            ],
            (None, Some(max)) => vec![
                "Hasta".to_string(),
                currency.to_string(),
                format_amount(max),
                label.to_string(),
            ],
            (None, None) => return UNSPECIFIED_SALARY.to_string(),
        };
        parts
            .into_iter()
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ")
    }
}
