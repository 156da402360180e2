//! Periodic reconciliation: completion, timeout, and partial-completion rules.
//!
//! The monitor is tick-driven by an external scheduler and never self-times.
//! The decision for one job is a pure function of `(job, now, config)`, so
//! the rules are testable without real clocks; `run_tick` wraps that decision
//! with storage, per-job error isolation, and the downstream send.

use chrono::{DateTime, Duration, Utc};
use tracing::{debug, error, info, warn};

use crate::job::{Job, JobStatus};
use crate::policy::{self, ConfigOverrides, FanInConfig};
use crate::store::{JobRepository, StoreError};
use crate::trigger::{DownstreamQueue, DownstreamTrigger, TriggerDeliveryError};

/// Decision for one job at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobVerdict {
    /// Within its timeout and not yet complete; leave the record untouched.
    StillRunning,
    /// Every expected subtask reported success.
    Complete,
    /// Timed out, but enough subtasks succeeded to proceed with partial data.
    Partial,
    /// Timed out below the threshold; finalize without triggering.
    TimedOut,
}

/// Evaluate one job against the completion, timeout, and partial rules.
///
/// Completion is checked first: a job that finished between ticks is
/// `Complete` no matter how old it is.
pub fn evaluate(job: &Job, now: DateTime<Utc>, config: &FanInConfig) -> JobVerdict {
    let total = job.total();
    let done = job.done_count();

    if total > 0 && done == total {
        return JobVerdict::Complete;
    }

    let age = now - job.created_at;
    if age <= Duration::minutes(config.job_timeout_minutes) {
        return JobVerdict::StillRunning;
    }

    if config.enable_partial_completion
        && done > 0
        && job.completion_ratio() >= config.partial_completion_threshold
    {
        JobVerdict::Partial
    } else {
        JobVerdict::TimedOut
    }
}

/// Counters for one reconciliation tick.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct TickSummary {
    pub examined: usize,
    pub completed: usize,
    pub partial: usize,
    pub timed_out: usize,
    pub still_running: usize,
    pub errors: usize,
}

#[derive(Debug, thiserror::Error)]
enum ReconcileError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Trigger(#[from] TriggerDeliveryError),
}

/// The periodic reconciliation loop over all non-terminal jobs.
pub struct JobMonitor<R, Q> {
    repository: R,
    trigger: DownstreamTrigger<R, Q>,
    env_overrides: ConfigOverrides,
}

impl<R, Q> JobMonitor<R, Q>
where
    R: JobRepository + Clone,
    Q: DownstreamQueue,
{
    pub fn new(repository: R, queue: Q) -> Self {
        let trigger = DownstreamTrigger::new(repository.clone(), queue);
        Self {
            repository,
            trigger,
            env_overrides: ConfigOverrides::default(),
        }
    }

    /// Install the deployment-level config layer (normally
    /// [`ConfigOverrides::from_env`]).
    pub fn with_env_overrides(mut self, overrides: ConfigOverrides) -> Self {
        self.env_overrides = overrides;
        self
    }

    /// Run one reconciliation pass.
    ///
    /// Jobs are processed sequentially with per-job error isolation: a
    /// storage or delivery failure on one job is counted, logged, and never
    /// stops the rest of the batch.
    pub fn run_tick(&self, now: DateTime<Utc>) -> TickSummary {
        let stored = match self.repository.config_overrides() {
            Ok(overrides) => overrides.unwrap_or_default(),
            Err(e) => {
                warn!(error = %e, "config override read failed; using lower layers");
                ConfigOverrides::default()
            }
        };
        let config = policy::resolve(&self.env_overrides, &stored);

        let mut summary = TickSummary::default();
        let mut jobs = match self.repository.list_active() {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "active job listing failed; skipping tick");
                summary.errors += 1;
                return summary;
            }
        };

        if jobs.len() > config.max_jobs_per_cycle {
            warn!(
                eligible = jobs.len(),
                cap = config.max_jobs_per_cycle,
                "job batch truncated; remainder picked up next tick"
            );
            jobs.truncate(config.max_jobs_per_cycle);
        }

        for job in &jobs {
            summary.examined += 1;
            match self.reconcile(job, now, &config) {
                Ok(JobVerdict::StillRunning) => summary.still_running += 1,
                Ok(JobVerdict::Complete) => summary.completed += 1,
                Ok(JobVerdict::Partial) => summary.partial += 1,
                Ok(JobVerdict::TimedOut) => summary.timed_out += 1,
                Err(e) => {
                    summary.errors += 1;
                    error!(job_id = %job.id, error = %e, "job reconciliation failed; continuing");
                }
            }
        }

        info!(
            examined = summary.examined,
            completed = summary.completed,
            partial = summary.partial,
            timed_out = summary.timed_out,
            errors = summary.errors,
            "reconciliation tick complete"
        );
        summary
    }

    fn reconcile(
        &self,
        job: &Job,
        now: DateTime<Utc>,
        config: &FanInConfig,
    ) -> Result<JobVerdict, ReconcileError> {
        if job.status.is_terminal() {
            // defensive: list_active should never hand these out
            debug!(job_id = %job.id, status = ?job.status, "job already terminal; skipping");
            return Ok(JobVerdict::StillRunning);
        }

        let verdict = evaluate(job, now, config);
        match verdict {
            JobVerdict::StillRunning => {}
            JobVerdict::Complete => {
                let note = format!("all {} subtasks completed", job.total());
                self.finalize_and_send(job, JobStatus::Complete, false, note, now)?;
            }
            JobVerdict::Partial => {
                let note = format!(
                    "timed out; proceeding with {}/{} subtasks completed",
                    job.done_count(),
                    job.total()
                );
                self.finalize_and_send(job, JobStatus::Partial, true, note, now)?;
            }
            JobVerdict::TimedOut => {
                let note = format!(
                    "timed out with {}/{} subtasks completed; below partial threshold",
                    job.done_count(),
                    job.total()
                );
                self.repository
                    .merge(job.id, |j| j.finalize(JobStatus::Timeout, note.as_str(), now))?;
                info!(job_id = %job.id, note = %note, "job timed out; no downstream trigger");
            }
        }
        Ok(verdict)
    }

    /// Finalize, then send. Finalizing first makes the terminal status (and
    /// `processed_at`) visible to overlapping ticks before the message goes
    /// out; if the send fails the record is reopened so a later tick retries
    /// the whole decision.
    fn finalize_and_send(
        &self,
        job: &Job,
        status: JobStatus,
        partial: bool,
        note: String,
        now: DateTime<Utc>,
    ) -> Result<(), ReconcileError> {
        let finalized = self
            .repository
            .merge(job.id, |j| j.finalize(status, note.as_str(), now))?;

        match self.trigger.send(&finalized, partial, now) {
            Ok(_) => {
                info!(job_id = %job.id, status = ?status, partial, "job finalized");
                Ok(())
            }
            Err(send_error) => {
                warn!(
                    job_id = %job.id,
                    error = %send_error,
                    "downstream send failed; reopening job for retry"
                );
                if let Err(rollback_error) = self.repository.merge(job.id, |j| j.reopen(now)) {
                    error!(
                        job_id = %job.id,
                        error = %rollback_error,
                        "rollback after failed send also failed; job is finalized without a trigger"
                    );
                }
                Err(send_error.into())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryJobRepository;
    use crate::trigger::{InMemoryDownstreamQueue, QueueError, TriggerMessage};
    use muster_core::{JobId, SubtaskId};
    use serde_json::Value as JsonValue;
    use std::sync::{Arc, Mutex};

    fn subtasks(ids: &[&str]) -> Vec<SubtaskId> {
        ids.iter().map(|s| SubtaskId::from(*s)).collect()
    }

    /// Seed a job created `age_minutes` ago with `done` successful subtasks
    /// out of `ids`.
    fn seed_job(
        repo: &Arc<InMemoryJobRepository>,
        ids: &[&str],
        done: usize,
        age_minutes: i64,
        now: DateTime<Utc>,
    ) -> JobId {
        let created_at = now - Duration::minutes(age_minutes);
        let mut job = Job::new(JobId::new(), subtasks(ids), JsonValue::Null, created_at);
        for id in ids.iter().take(done) {
            job.record_success(&SubtaskId::from(*id), created_at);
        }
        repo.create(&job).unwrap();
        job.id
    }

    fn monitor(
        repo: &Arc<InMemoryJobRepository>,
        queue: &Arc<InMemoryDownstreamQueue>,
    ) -> JobMonitor<Arc<InMemoryJobRepository>, Arc<InMemoryDownstreamQueue>> {
        JobMonitor::new(repo.clone(), queue.clone())
    }

    mod evaluate_rules {
        use super::*;

        fn job_with(ids: &[&str], done: usize, age_minutes: i64, now: DateTime<Utc>) -> Job {
            let created_at = now - Duration::minutes(age_minutes);
            let mut job = Job::new(JobId::new(), subtasks(ids), JsonValue::Null, created_at);
            for id in ids.iter().take(done) {
                job.record_success(&SubtaskId::from(*id), created_at);
            }
            job
        }

        #[test]
        fn complete_wins_regardless_of_age() {
            let now = Utc::now();
            let config = FanInConfig::default();
            let job = job_with(&["a", "b"], 2, 500, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::Complete);
        }

        #[test]
        fn young_incomplete_job_keeps_running() {
            let now = Utc::now();
            let config = FanInConfig::default();
            let job = job_with(&["a", "b", "c"], 1, 10, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::StillRunning);
        }

        #[test]
        fn age_exactly_at_timeout_keeps_running() {
            let now = Utc::now();
            let config = FanInConfig::default();
            let job = job_with(&["a", "b"], 1, 30, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::StillRunning);
        }

        #[test]
        fn timed_out_above_threshold_is_partial() {
            let now = Utc::now();
            let config = FanInConfig::default();
            // 2/3 = 66.7% >= 50%
            let job = job_with(&["a", "b", "c"], 2, 45, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::Partial);
        }

        #[test]
        fn ratio_exactly_at_threshold_is_partial() {
            let now = Utc::now();
            let config = FanInConfig::default();
            let job = job_with(&["a", "b"], 1, 45, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::Partial);
        }

        #[test]
        fn timed_out_below_threshold_is_hard_timeout() {
            let now = Utc::now();
            let config = FanInConfig::default();
            // 1/3 = 33.3% < 50%
            let job = job_with(&["a", "b", "c"], 1, 45, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::TimedOut);
        }

        #[test]
        fn zero_successes_never_proceed_partially() {
            let now = Utc::now();
            let config = FanInConfig {
                partial_completion_threshold: 0.0,
                ..Default::default()
            };
            let job = job_with(&["a", "b"], 0, 45, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::TimedOut);
        }

        #[test]
        fn disabled_partial_completion_forces_hard_timeout() {
            let now = Utc::now();
            let config = FanInConfig {
                enable_partial_completion: false,
                ..Default::default()
            };
            let job = job_with(&["a", "b", "c"], 2, 45, now);
            assert_eq!(evaluate(&job, now, &config), JobVerdict::TimedOut);
        }
    }

    #[test]
    fn complete_job_is_finalized_and_triggered() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        let job_id = seed_job(&repo, &["a", "b"], 2, 5, now);

        let summary = monitor(&repo, &queue).run_tick(now);
        assert_eq!(summary.completed, 1);

        let job = repo.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Complete);
        assert!(job.processed_at.is_some());
        assert!(job.processing_note.as_deref().unwrap().contains("all 2"));

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id, job_id);
        assert!(!messages[0].partial);
    }

    #[test]
    fn partial_timeout_triggers_with_partial_flag() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        // 45 minutes old, 2/3 complete, default timeout 30 / threshold 0.5
        let job_id = seed_job(&repo, &["a", "b", "c"], 2, 45, now);

        let summary = monitor(&repo, &queue).run_tick(now);
        assert_eq!(summary.partial, 1);

        let job = repo.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Partial);

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        assert!(messages[0].partial);
    }

    #[test]
    fn hard_timeout_finalizes_without_a_message() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        // 45 minutes old, 1/3 complete: below the 0.5 threshold
        let job_id = seed_job(&repo, &["a", "b", "c"], 1, 45, now);

        let summary = monitor(&repo, &queue).run_tick(now);
        assert_eq!(summary.timed_out, 1);

        let job = repo.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Timeout);
        assert!(job.processed_at.is_some());
        assert!(queue.messages().is_empty());
        assert!(repo.trigger_record(job_id, "processing").unwrap().is_none());
    }

    #[test]
    fn young_job_is_left_completely_untouched() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        let job_id = seed_job(&repo, &["a", "b", "c"], 1, 10, now);
        let before = repo.get(job_id).unwrap();

        let summary = monitor(&repo, &queue).run_tick(now);
        assert_eq!(summary.still_running, 1);

        let after = repo.get(job_id).unwrap();
        assert_eq!(after.status, JobStatus::Active);
        assert_eq!(after.updated_at, before.updated_at);
        assert!(after.processed_at.is_none());
        assert!(queue.messages().is_empty());
    }

    #[test]
    fn batch_mixes_are_isolated_per_job() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();

        let complete_id = seed_job(&repo, &["a", "b"], 2, 5, now);
        let active_id = seed_job(&repo, &["a", "b", "c"], 1, 10, now);
        let partial_id = seed_job(&repo, &["a", "b", "c"], 2, 45, now);

        let summary = monitor(&repo, &queue).run_tick(now);
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.completed, 1);
        assert_eq!(summary.partial, 1);
        assert_eq!(summary.still_running, 1);

        let messages = queue.messages();
        assert_eq!(messages.len(), 2);
        let triggered: Vec<JobId> = messages.iter().map(|m| m.job_id).collect();
        assert!(triggered.contains(&complete_id));
        assert!(triggered.contains(&partial_id));

        assert_eq!(repo.get(active_id).unwrap().status, JobStatus::Active);
    }

    #[test]
    fn finalized_jobs_never_trigger_twice() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        seed_job(&repo, &["a", "b"], 2, 5, now);

        let m = monitor(&repo, &queue);
        m.run_tick(now);
        let second = m.run_tick(now + Duration::minutes(5));

        assert_eq!(second.examined, 0);
        assert_eq!(queue.messages().len(), 1);
    }

    #[test]
    fn send_failure_reopens_the_job_for_retry() {
        /// Queue that fails until told otherwise.
        struct FlakyQueue {
            healthy: Mutex<bool>,
            inner: InMemoryDownstreamQueue,
        }

        impl DownstreamQueue for FlakyQueue {
            fn name(&self) -> &str {
                self.inner.name()
            }

            fn enqueue(&self, message: &TriggerMessage) -> Result<(), QueueError> {
                if *self.healthy.lock().unwrap() {
                    self.inner.enqueue(message)
                } else {
                    Err(QueueError("downstream unavailable".to_string()))
                }
            }
        }

        let repo = InMemoryJobRepository::arc();
        let queue = Arc::new(FlakyQueue {
            healthy: Mutex::new(false),
            inner: InMemoryDownstreamQueue::new("processing"),
        });
        let now = Utc::now();
        let job_id = seed_job(&repo, &["a", "b"], 2, 5, now);

        let m = JobMonitor::new(repo.clone(), queue.clone());

        let first = m.run_tick(now);
        assert_eq!(first.errors, 1);
        // not silently marked processed: the job is back to active
        let job = repo.get(job_id).unwrap();
        assert_eq!(job.status, JobStatus::Active);
        assert!(job.processed_at.is_none());

        *queue.healthy.lock().unwrap() = true;
        let second = m.run_tick(now + Duration::minutes(5));
        assert_eq!(second.completed, 1);
        assert_eq!(queue.inner.messages().len(), 1);
        assert_eq!(repo.get(job_id).unwrap().status, JobStatus::Complete);
    }

    #[test]
    fn cycle_cap_defers_the_newest_jobs() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();

        let older_id = seed_job(&repo, &["a"], 1, 20, now);
        let newer_id = seed_job(&repo, &["a"], 1, 10, now);

        repo.put_config_overrides(&ConfigOverrides {
            max_jobs_per_cycle: Some(1),
            ..Default::default()
        })
        .unwrap();

        let m = monitor(&repo, &queue);
        let first = m.run_tick(now);
        assert_eq!(first.examined, 1);
        assert_eq!(repo.get(older_id).unwrap().status, JobStatus::Complete);
        assert_eq!(repo.get(newer_id).unwrap().status, JobStatus::Active);

        let second = m.run_tick(now);
        assert_eq!(second.examined, 1);
        assert_eq!(repo.get(newer_id).unwrap().status, JobStatus::Complete);
    }

    #[test]
    fn stored_config_layer_is_applied_each_tick() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let now = Utc::now();
        // 20 minutes old: inside the default 30-minute timeout
        let job_id = seed_job(&repo, &["a", "b"], 1, 20, now);

        let m = monitor(&repo, &queue);
        assert_eq!(m.run_tick(now).still_running, 1);

        // operator shortens the timeout at runtime; next tick picks it up
        repo.put_config_overrides(&ConfigOverrides {
            job_timeout_minutes: Some(15),
            ..Default::default()
        })
        .unwrap();

        let summary = m.run_tick(now);
        assert_eq!(summary.partial, 1);
        assert_eq!(repo.get(job_id).unwrap().status, JobStatus::Partial);
    }
}
