//! Job creation and per-subtask launch fan-out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use muster_core::{JobId, SubtaskId};

use crate::job::Job;
use crate::store::{JobRepository, StoreError};

/// Kind tag stamped on every outbound subtask trigger.
pub const SUBTASK_TRIGGER_KIND: &str = "subtask_trigger";

/// Outbound trigger call for one subtask, sent to the external task engine.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LaunchRequest {
    pub job_id: JobId,
    pub subtask_id: SubtaskId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "JsonValue::is_null")]
    pub metadata: JsonValue,
}

/// Port to the external task engine (webhook-style, fire-and-forget).
///
/// A launch failure means that subtask will never report back; the job
/// surfaces it later through the timeout/partial path, so implementations
/// should not retry aggressively here.
pub trait SubtaskLauncher: Send + Sync {
    fn launch(&self, request: &LaunchRequest) -> anyhow::Result<()>;
}

impl<L> SubtaskLauncher for Arc<L>
where
    L: SubtaskLauncher + ?Sized,
{
    fn launch(&self, request: &LaunchRequest) -> anyhow::Result<()> {
        (**self).launch(request)
    }
}

/// Outcome of one job creation. The job record always exists once this is
/// returned, whatever the launch counts say.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct DispatchSummary {
    pub job_id: JobId,
    pub triggered: usize,
    pub failed: usize,
}

#[derive(Debug, thiserror::Error)]
pub enum CreateJobError {
    /// A job with zero subtasks would trivially finalize complete on the
    /// first tick; reject it at the boundary instead.
    #[error("a job needs at least one subtask")]
    NoSubtasks,
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Allocates jobs and fans the subtask triggers out to the external engine.
pub struct JobCreator<R, L> {
    repository: R,
    launcher: L,
}

impl<R, L> JobCreator<R, L>
where
    R: JobRepository,
    L: SubtaskLauncher,
{
    pub fn new(repository: R, launcher: L) -> Self {
        Self {
            repository,
            launcher,
        }
    }

    /// Create a job for `subtask_ids` and trigger each subtask.
    ///
    /// Launch calls are isolated: a failing call is counted and logged but
    /// never aborts the batch, and the job proceeds without that subtask
    /// (it will surface through the timeout path). Only the initial record
    /// write can fail the operation as a whole.
    pub fn create_job(
        &self,
        subtask_ids: Vec<SubtaskId>,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Result<DispatchSummary, CreateJobError> {
        if subtask_ids.is_empty() {
            return Err(CreateJobError::NoSubtasks);
        }

        let job = Job::new(JobId::new(), subtask_ids, metadata, now);
        self.repository.create(&job)?;

        let mut triggered = 0;
        let mut failed = 0;
        for subtask_id in &job.subtask_ids {
            let request = LaunchRequest {
                job_id: job.id,
                subtask_id: subtask_id.clone(),
                timestamp: now,
                kind: SUBTASK_TRIGGER_KIND.to_string(),
                metadata: job.metadata.clone(),
            };
            match self.launcher.launch(&request) {
                Ok(()) => triggered += 1,
                Err(e) => {
                    failed += 1;
                    warn!(
                        job_id = %job.id,
                        subtask_id = %subtask_id,
                        error = %e,
                        "subtask launch failed; job proceeds without it"
                    );
                }
            }
        }

        info!(job_id = %job.id, total = job.total(), triggered, failed, "job created");

        Ok(DispatchSummary {
            job_id: job.id,
            triggered,
            failed,
        })
    }
}
