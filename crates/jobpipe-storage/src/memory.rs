//! In-memory stores for tests and local dry runs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::Utc;
use jobpipe_core::{advance, raw_job_uuid, JobPosting, JobSource, RawJobRecord, TrackingRecord};
use uuid::Uuid;

use crate::{FailureState, MarkOutcome, RawJobStore, StoreError, TrackingStore};

#[derive(Debug, Clone)]
struct StoredRaw {
    seq: u64,
    record: RawJobRecord,
}

/// Raw and tracking tables held behind locks.
///
/// Raw rows are keyed by the deterministic `(source, url)` id, so the map key is
/// the uniqueness constraint. Data is lost on drop.
#[derive(Debug)]
pub struct MemoryStore {
    raw: RwLock<HashMap<Uuid, StoredRaw>>,
    tracking: RwLock<HashMap<String, TrackingRecord>>,
    next_seq: AtomicU64,
    available: AtomicBool,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            raw: RwLock::new(HashMap::new()),
            tracking: RwLock::new(HashMap::new()),
            next_seq: AtomicU64::new(0),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate the backing store going away (or coming back).
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub fn raw_count(&self) -> usize {
        self.raw.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn tracking_count(&self) -> usize {
        self.tracking.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn get(&self, id: Uuid) -> Option<RawJobRecord> {
        self.raw
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .map(|stored| stored.record.clone())
    }

    fn check_available(&self) -> Result<(), StoreError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StoreError::Unavailable("memory store offline".to_string()))
        }
    }

    fn select_raw<F>(&self, limit: usize, filter: F) -> Vec<RawJobRecord>
    where
        F: Fn(&RawJobRecord) -> bool,
    {
        let guard = self.raw.read().unwrap_or_else(|e| e.into_inner());
        let mut rows = guard
            .values()
            .filter(|stored| filter(&stored.record))
            .collect::<Vec<_>>();
        rows.sort_by_key(|stored| (stored.record.created_at, stored.seq));
        rows.into_iter()
            .take(limit)
            .map(|stored| stored.record.clone())
            .collect()
    }
}

#[async_trait]
impl RawJobStore for MemoryStore {
    async fn ping(&self) -> Result<(), StoreError> {
        self.check_available()
    }

    async fn save(&self, posting: JobPosting) -> Result<Uuid, StoreError> {
        self.check_available()?;
        let now = Utc::now();
        let id = raw_job_uuid(posting.source, &posting.url);
        let mut guard = self.raw.write().unwrap_or_else(|e| e.into_inner());
        match guard.get_mut(&id) {
            Some(existing) => existing.record.apply_posting(posting, now),
            None => {
                let seq = self.next_seq.fetch_add(1, Ordering::SeqCst);
                guard.insert(
                    id,
                    StoredRaw {
                        seq,
                        record: RawJobRecord::from_posting(posting, now),
                    },
                );
            }
        }
        Ok(id)
    }

    async fn get_unprocessed(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.select_raw(limit, |r| !r.processed && !r.poisoned))
    }

    async fn mark_processed(&self, id: Uuid) -> Result<MarkOutcome, StoreError> {
        self.check_available()?;
        let mut guard = self.raw.write().unwrap_or_else(|e| e.into_inner());
        let stored = guard.get_mut(&id).ok_or(StoreError::NotFound(id))?;
        if stored.record.processed {
            return Ok(MarkOutcome::AlreadyProcessed);
        }
        stored.record.processed = true;
        stored.record.updated_at = advance(stored.record.updated_at, Utc::now());
        Ok(MarkOutcome::Marked)
    }

    async fn get_by_source(
        &self,
        source: JobSource,
        processed: Option<bool>,
        limit: usize,
    ) -> Result<Vec<RawJobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.select_raw(limit, |r| {
            r.source == source && processed.map_or(true, |p| r.processed == p)
        }))
    }

    async fn record_failure(
        &self,
        id: Uuid,
        reason: &str,
        max_attempts: u32,
    ) -> Result<FailureState, StoreError> {
        self.check_available()?;
        let mut guard = self.raw.write().unwrap_or_else(|e| e.into_inner());
        let record = &mut guard.get_mut(&id).ok_or(StoreError::NotFound(id))?.record;
        if !record.processed {
            record.attempts = record.attempts.saturating_add(1);
            record.last_error = Some(reason.to_string());
            record.poisoned = record.attempts >= max_attempts;
            record.updated_at = advance(record.updated_at, Utc::now());
        }
        Ok(FailureState {
            attempts: record.attempts,
            poisoned: record.poisoned,
        })
    }

    async fn get_poisoned(&self, limit: usize) -> Result<Vec<RawJobRecord>, StoreError> {
        self.check_available()?;
        Ok(self.select_raw(limit, |r| r.poisoned && !r.processed))
    }

    async fn requeue(&self, id: Uuid) -> Result<bool, StoreError> {
        self.check_available()?;
        let mut guard = self.raw.write().unwrap_or_else(|e| e.into_inner());
        let record = &mut guard.get_mut(&id).ok_or(StoreError::NotFound(id))?.record;
        if record.processed {
            return Ok(false);
        }
        record.attempts = 0;
        record.last_error = None;
        record.poisoned = false;
        record.updated_at = advance(record.updated_at, Utc::now());
        Ok(true)
    }
}

#[async_trait]
impl TrackingStore for MemoryStore {
    async fn find_by_source_url(
        &self,
        source_url: &str,
    ) -> Result<Option<TrackingRecord>, StoreError> {
        self.check_available()?;
        Ok(self
            .tracking
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(source_url)
            .cloned())
    }

    async fn upsert(&self, record: &TrackingRecord) -> Result<TrackingRecord, StoreError> {
        self.check_available()?;
        let mut guard = self.tracking.write().unwrap_or_else(|e| e.into_inner());
        let stored = guard
            .entry(record.source_url.clone())
            .and_modify(|existing| {
                existing.title = record.title.clone();
                existing.description = record.description.clone();
                existing.company = record.company.clone();
                existing.source = record.source;
                existing.updated_at = advance(existing.updated_at, record.updated_at);
            })
            .or_insert_with(|| record.clone());
        Ok(stored.clone())
    }
}
