//! Inbound subtask report handling.
//!
//! Reports arrive concurrently, in any order, from independent retrying
//! callers. Everything here funnels into the convergent set mutators on
//! [`Job`], so duplicated and reordered deliveries cannot corrupt a record.
//! Overall job status is deliberately *not* recomputed on this path: a
//! single report sees only a partial view, and the monitor owns that
//! decision.

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use muster_core::{JobId, SubtaskId};

use crate::job::{FailureRecord, Job, JobStatus};
use crate::report::{FailureReport, SuccessReport, normalize_error};
use crate::store::{JobRepository, StoreError};

/// Result of applying one inbound report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReportOutcome {
    /// Subtask entries newly recorded by this report (duplicates and
    /// unexpected ids count zero).
    pub recorded: usize,
    /// Whether the report referenced an unknown job and a stub was created.
    pub stub_created: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ReportError {
    /// Malformed report rejected at the boundary; nothing was mutated.
    #[error("invalid report: {0}")]
    Validation(String),
    #[error(transparent)]
    Store(StoreError),
}

/// Applies inbound success/failure reports to job records.
pub struct SubtaskReporter<R> {
    repository: R,
}

impl<R> SubtaskReporter<R>
where
    R: JobRepository,
{
    pub fn new(repository: R) -> Self {
        Self { repository }
    }

    /// Record a success report.
    ///
    /// Idempotent per `(job, subtask)`: re-delivery after the first changes
    /// nothing. An unknown job id gets a stub record rather than a dropped
    /// report.
    pub fn report_success(
        &self,
        report: SuccessReport,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, ReportError> {
        let job_id = parse_job_id(&report.job_id)?;
        if report.subtask_id.is_blank() {
            return Err(ReportError::Validation(
                "subtaskId must not be blank".to_string(),
            ));
        }

        let subtask_id = report.subtask_id.clone();
        let apply = |job: &mut Job| -> usize {
            usize::from(job.record_success(&subtask_id, now))
        };

        let mut recorded = 0;
        match self.repository.merge(job_id, |job| recorded = apply(job)) {
            Ok(_) => {
                if recorded == 0 {
                    debug!(
                        job_id = %job_id,
                        subtask_id = %subtask_id,
                        "duplicate or unexpected success report ignored"
                    );
                }
                Ok(ReportOutcome {
                    recorded,
                    stub_created: false,
                })
            }
            Err(StoreError::NotFound(_)) => {
                let note = format!("orphan success report for subtask {subtask_id}");
                self.record_orphan(job_id, now, note, apply)
            }
            Err(e) => Err(ReportError::Store(e)),
        }
    }

    /// Record a failure report.
    ///
    /// The error payload is normalized whatever its shape; each affected
    /// subtask id is added to the failed set unless that subtask already
    /// succeeded. A report naming no subtask at all is accepted (only the
    /// job id and error are required) and recorded as zero mutations.
    pub fn report_failure(
        &self,
        report: FailureReport,
        now: DateTime<Utc>,
    ) -> Result<ReportOutcome, ReportError> {
        let job_id = parse_job_id(&report.job_id)?;
        let summary = normalize_error(&report.error);
        let retry_count = report.retry_count.unwrap_or(0);

        let affected: Vec<SubtaskId> = report
            .affected_subtasks()
            .into_iter()
            .filter(|id| {
                if id.is_blank() {
                    warn!(job_id = %job_id, "blank subtask id in failure report ignored");
                    false
                } else {
                    true
                }
            })
            .collect();

        if affected.is_empty() {
            warn!(
                job_id = %job_id,
                message = %summary.message,
                "failure report names no subtask; nothing to record"
            );
            return match self.repository.get(job_id) {
                Ok(_) => Ok(ReportOutcome {
                    recorded: 0,
                    stub_created: false,
                }),
                Err(StoreError::NotFound(_)) => {
                    let note = format!("orphan failure report: {}", summary.message);
                    self.record_orphan(job_id, now, note, |_job| 0)
                }
                Err(e) => Err(ReportError::Store(e)),
            };
        }

        let apply = |job: &mut Job| -> usize {
            affected
                .iter()
                .filter(|id| {
                    let record = FailureRecord {
                        summary: summary.clone(),
                        retry_count,
                        reported_at: now,
                    };
                    job.record_failure(id, record, now)
                })
                .count()
        };

        let mut recorded = 0;
        match self.repository.merge(job_id, |job| recorded = apply(job)) {
            Ok(_) => Ok(ReportOutcome {
                recorded,
                stub_created: false,
            }),
            Err(StoreError::NotFound(_)) => {
                let note = format!("orphan failure report: {}", summary.message);
                self.record_orphan(job_id, now, note, apply)
            }
            Err(e) => Err(ReportError::Store(e)),
        }
    }

    /// A report referenced a job this store has never seen. Losing the
    /// report would hide a real execution, so persist a terminal stub that
    /// carries it. The stub is `Failed` from birth: the monitor never picks
    /// it up and nothing is ever triggered for it.
    fn record_orphan(
        &self,
        job_id: JobId,
        now: DateTime<Utc>,
        note: String,
        apply: impl Fn(&mut Job) -> usize,
    ) -> Result<ReportOutcome, ReportError> {
        warn!(job_id = %job_id, note = %note, "report for unknown job; creating stub");

        let mut stub = Job::new(job_id, Vec::new(), JsonValue::Null, now);
        stub.finalize(JobStatus::Failed, note.as_str(), now);
        let recorded = apply(&mut stub);

        match self.repository.create(&stub) {
            Ok(()) => Ok(ReportOutcome {
                recorded,
                stub_created: true,
            }),
            Err(StoreError::AlreadyExists(_)) => {
                // another report raced its stub in first; merge into the winner
                let mut recorded = 0;
                self.repository
                    .merge(job_id, |job| recorded = apply(job))
                    .map_err(ReportError::Store)?;
                Ok(ReportOutcome {
                    recorded,
                    stub_created: false,
                })
            }
            Err(e) => Err(ReportError::Store(e)),
        }
    }
}

fn parse_job_id(raw: &str) -> Result<JobId, ReportError> {
    raw.parse::<JobId>()
        .map_err(|e| ReportError::Validation(e.to_string()))
}
