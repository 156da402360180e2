//! Core job record and status state machine.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use muster_core::{JobId, SubtaskId};

use crate::report::ErrorSummary;

/// Lifecycle status of an orchestrated job.
///
/// `Active` is the only non-terminal state; the monitor moves jobs to
/// `Complete`, `Partial`, or `Timeout`, and the reporter creates `Failed`
/// stubs for reports that reference an unknown job. Terminal states are
/// never left.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Waiting for subtask reports; examined by the monitor each tick.
    Active,
    /// Every expected subtask reported success.
    Complete,
    /// Timed out with enough successes to proceed downstream anyway.
    Partial,
    /// Timed out below the partial-completion threshold; nothing is sent.
    Timeout,
    /// Orphaned or corrupt record discovered while reporting.
    Failed,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::Active)
    }
}

/// Normalized failure detail for one subtask.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub summary: ErrorSummary,
    pub retry_count: u32,
    pub reported_at: DateTime<Utc>,
}

/// One orchestrated unit of work spanning multiple remote subtasks.
///
/// Field ownership is split between writers to keep racing read-modify-write
/// cycles convergent: the reporter only grows `completed`/`failed`, the
/// monitor only writes `status`/`processed_at`/`processing_note`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub status: JobStatus,
    /// Expected subtasks, fixed at creation. Empty only on orphan stubs.
    pub subtask_ids: Vec<SubtaskId>,
    /// Subtasks that reported success.
    pub completed: BTreeSet<SubtaskId>,
    /// Subtasks that reported failure, with normalized detail.
    pub failed: BTreeMap<SubtaskId, FailureRecord>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set exactly once, when the job reaches a terminal state.
    pub processed_at: Option<DateTime<Utc>>,
    /// Human-readable finalization reason.
    pub processing_note: Option<String>,
    /// Free-form metadata carried through to the downstream message.
    pub metadata: JsonValue,
}

impl Job {
    /// Create a fresh active job.
    ///
    /// Duplicate subtask ids are collapsed (first occurrence wins) so the
    /// completion arithmetic stays consistent with set membership.
    pub fn new(
        id: JobId,
        subtask_ids: Vec<SubtaskId>,
        metadata: JsonValue,
        now: DateTime<Utc>,
    ) -> Self {
        let mut seen = BTreeSet::new();
        let subtask_ids: Vec<SubtaskId> = subtask_ids
            .into_iter()
            .filter(|id| seen.insert(id.clone()))
            .collect();

        Self {
            id,
            status: JobStatus::Active,
            subtask_ids,
            completed: BTreeSet::new(),
            failed: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            processed_at: None,
            processing_note: None,
            metadata,
        }
    }

    pub fn total(&self) -> usize {
        self.subtask_ids.len()
    }

    pub fn done_count(&self) -> usize {
        self.completed.len()
    }

    /// Fraction of expected subtasks that reported success, in `[0, 1]`.
    pub fn completion_ratio(&self) -> f64 {
        if self.subtask_ids.is_empty() {
            return 0.0;
        }
        self.done_count() as f64 / self.total() as f64
    }

    /// Whether a reported subtask id belongs to this job.
    ///
    /// Orphan stubs carry no expected set and accept anything.
    pub fn expects(&self, subtask_id: &SubtaskId) -> bool {
        self.subtask_ids.is_empty() || self.subtask_ids.contains(subtask_id)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        // updated_at is monotonic even when reports carry stale clocks
        self.updated_at = self.updated_at.max(now);
    }

    /// Record a success report for one subtask.
    ///
    /// Idempotent: a duplicate report changes nothing and returns `false`.
    /// Success wins over an earlier failure report for the same subtask (a
    /// retry eventually landed), so the id moves out of `failed`.
    pub fn record_success(&mut self, subtask_id: &SubtaskId, now: DateTime<Utc>) -> bool {
        if !self.expects(subtask_id) {
            return false;
        }
        let removed = self.failed.remove(subtask_id).is_some();
        let inserted = self.completed.insert(subtask_id.clone());
        if inserted || removed {
            self.touch(now);
        }
        inserted
    }

    /// Record a failure report for one subtask.
    ///
    /// A subtask that already reported success stays successful (the failure
    /// is a stale duplicate of a retried call). Membership in `failed` is
    /// set-union; the stored detail is last-writer-wins so retry counts can
    /// climb.
    pub fn record_failure(
        &mut self,
        subtask_id: &SubtaskId,
        record: FailureRecord,
        now: DateTime<Utc>,
    ) -> bool {
        if !self.expects(subtask_id) || self.completed.contains(subtask_id) {
            return false;
        }
        let newly_failed = !self.failed.contains_key(subtask_id);
        self.failed.insert(subtask_id.clone(), record);
        self.touch(now);
        newly_failed
    }

    /// Move the job to a terminal state.
    ///
    /// `processed_at` is set exactly once; re-finalizing an already-terminal
    /// record is a no-op so overlapping ticks cannot rewrite history.
    pub fn finalize(&mut self, status: JobStatus, note: impl Into<String>, now: DateTime<Utc>) {
        if self.status.is_terminal() {
            return;
        }
        self.status = status;
        self.processed_at = Some(now);
        self.processing_note = Some(note.into());
        self.touch(now);
    }

    /// Undo a finalization whose downstream send failed, so a later tick
    /// retries the whole decision.
    pub fn reopen(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Active;
        self.processed_at = None;
        self.processing_note = None;
        self.touch(now);
    }
}
