//! Job persistence: key-value repository port and in-memory implementation.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde_json::Value as JsonValue;

use muster_core::JobId;

use crate::job::{Job, JobStatus};
use crate::policy::ConfigOverrides;
use crate::trigger::TriggerRecord;

/// Well-known key for the runtime config override record.
pub const CONFIG_OVERRIDES_KEY: &str = "config:fan_in";

fn job_key(id: JobId) -> String {
    format!("job:{id}")
}

fn trigger_key(job_id: JobId, queue_name: &str) -> String {
    format!("{job_id}:{queue_name}")
}

/// Repository operation error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("storage error: {0}")]
    Storage(String),
}

impl StoreError {
    /// Whether a caller may simply retry on a later tick.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Storage(_))
    }
}

/// Key-value persistence for job, trigger-audit, and config records.
///
/// The backing store offers no transactions and no locks: `merge` is a plain
/// read-modify-write sequence, and concurrent writers race under
/// last-writer-wins. Callers keep mutations convergent (set-union growth,
/// disjoint field ownership) instead of relying on atomicity. If a backend
/// offers conditional writes, an implementation may upgrade `merge` to a
/// compare-and-swap without changing this contract.
pub trait JobRepository: Send + Sync {
    /// Persist a new job. Fails with [`StoreError::AlreadyExists`] on id
    /// collision.
    fn create(&self, job: &Job) -> Result<(), StoreError>;

    /// Fetch a job by id.
    fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Read-modify-write a job record. **Not atomic.**
    fn merge<F>(&self, id: JobId, mutate: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
        Self: Sized;

    /// All jobs still awaiting reconciliation, oldest first.
    fn list_active(&self) -> Result<Vec<Job>, StoreError>;

    /// Write a downstream-trigger audit record (TTL-bounded).
    fn put_trigger_record(&self, record: &TriggerRecord) -> Result<(), StoreError>;

    /// Fetch the unexpired audit record for `(job, queue)`, if any.
    fn trigger_record(
        &self,
        job_id: JobId,
        queue_name: &str,
    ) -> Result<Option<TriggerRecord>, StoreError>;

    /// Runtime config override record, if present.
    fn config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError>;

    /// Write the runtime config override record.
    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError>;
}

impl<S> JobRepository for Arc<S>
where
    S: JobRepository,
{
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        (**self).create(job)
    }

    fn get(&self, id: JobId) -> Result<Job, StoreError> {
        (**self).get(id)
    }

    fn merge<F>(&self, id: JobId, mutate: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        (**self).merge(id, mutate)
    }

    fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        (**self).list_active()
    }

    fn put_trigger_record(&self, record: &TriggerRecord) -> Result<(), StoreError> {
        (**self).put_trigger_record(record)
    }

    fn trigger_record(
        &self,
        job_id: JobId,
        queue_name: &str,
    ) -> Result<Option<TriggerRecord>, StoreError> {
        (**self).trigger_record(job_id, queue_name)
    }

    fn config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError> {
        (**self).config_overrides()
    }

    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError> {
        (**self).put_config_overrides(overrides)
    }
}

/// In-memory repository for tests/dev.
///
/// Emulates a document KV store: every record round-trips through JSON, so
/// `merge` has the same read-deserialize-mutate-write shape (and the same
/// lost-update window) as a remote store.
#[derive(Debug, Default)]
pub struct InMemoryJobRepository {
    records: RwLock<HashMap<String, JsonValue>>,
}

impl InMemoryJobRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn encode<T: serde::Serialize>(value: &T) -> Result<JsonValue, StoreError> {
        serde_json::to_value(value)
            .map_err(|e| StoreError::Storage(format!("record serialization failed: {e}")))
    }

    fn decode<T: serde::de::DeserializeOwned>(value: &JsonValue) -> Result<T, StoreError> {
        serde_json::from_value(value.clone())
            .map_err(|e| StoreError::Storage(format!("record deserialization failed: {e}")))
    }

    fn read_lock(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, JsonValue>>, StoreError> {
        self.records
            .read()
            .map_err(|_| StoreError::Storage("repository lock poisoned".to_string()))
    }

    fn write_lock(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, JsonValue>>, StoreError> {
        self.records
            .write()
            .map_err(|_| StoreError::Storage("repository lock poisoned".to_string()))
    }
}

impl JobRepository for InMemoryJobRepository {
    fn create(&self, job: &Job) -> Result<(), StoreError> {
        let encoded = Self::encode(job)?;
        let mut records = self.write_lock()?;
        let key = job_key(job.id);
        if records.contains_key(&key) {
            return Err(StoreError::AlreadyExists(job.id));
        }
        records.insert(key, encoded);
        Ok(())
    }

    fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let records = self.read_lock()?;
        match records.get(&job_key(id)) {
            Some(raw) => Self::decode(raw),
            None => Err(StoreError::NotFound(id)),
        }
    }

    fn merge<F>(&self, id: JobId, mutate: F) -> Result<Job, StoreError>
    where
        F: FnOnce(&mut Job),
    {
        // read
        let mut job = self.get(id)?;
        // modify
        mutate(&mut job);
        // write back, last-writer-wins
        let encoded = Self::encode(&job)?;
        let mut records = self.write_lock()?;
        records.insert(job_key(id), encoded);
        Ok(job)
    }

    fn list_active(&self) -> Result<Vec<Job>, StoreError> {
        let records = self.read_lock()?;
        let mut jobs = Vec::new();
        for (key, raw) in records.iter() {
            if !key.starts_with("job:") {
                continue;
            }
            let job: Job = Self::decode(raw)?;
            if job.status == JobStatus::Active {
                jobs.push(job);
            }
        }
        // FIFO: oldest jobs are reconciled first when the cycle cap bites
        jobs.sort_by_key(|j| (j.created_at, j.id));
        Ok(jobs)
    }

    fn put_trigger_record(&self, record: &TriggerRecord) -> Result<(), StoreError> {
        let encoded = Self::encode(record)?;
        let mut records = self.write_lock()?;
        records.insert(trigger_key(record.job_id, &record.queue_name), encoded);
        Ok(())
    }

    fn trigger_record(
        &self,
        job_id: JobId,
        queue_name: &str,
    ) -> Result<Option<TriggerRecord>, StoreError> {
        let records = self.read_lock()?;
        match records.get(&trigger_key(job_id, queue_name)) {
            Some(raw) => {
                let record: TriggerRecord = Self::decode(raw)?;
                if record.is_expired(Utc::now()) {
                    Ok(None)
                } else {
                    Ok(Some(record))
                }
            }
            None => Ok(None),
        }
    }

    fn config_overrides(&self) -> Result<Option<ConfigOverrides>, StoreError> {
        let records = self.read_lock()?;
        match records.get(CONFIG_OVERRIDES_KEY) {
            Some(raw) => Ok(Some(Self::decode(raw)?)),
            None => Ok(None),
        }
    }

    fn put_config_overrides(&self, overrides: &ConfigOverrides) -> Result<(), StoreError> {
        let encoded = Self::encode(overrides)?;
        let mut records = self.write_lock()?;
        records.insert(CONFIG_OVERRIDES_KEY.to_string(), encoded);
        Ok(())
    }
}
