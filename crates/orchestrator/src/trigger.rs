//! Downstream queue port and guarded trigger dispatch.

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value as JsonValue, json};
use tracing::{info, warn};

use muster_core::JobId;

use crate::job::Job;
use crate::store::JobRepository;

/// Message kind stamped on every downstream trigger.
pub const FAN_IN_TRIGGER_KIND: &str = "fan_in_trigger";

/// Audit records exist for debugging and best-effort duplicate detection,
/// not correctness; they expire after this many days.
pub const TRIGGER_RECORD_TTL_DAYS: i64 = 7;

/// The single message enqueued to start the next processing stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TriggerMessage {
    pub job_id: JobId,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: String,
    /// True when the job timed out but cleared the partial-completion
    /// threshold; the consumer proceeds with whatever data arrived.
    pub partial: bool,
    pub metadata: JsonValue,
}

/// Audit record for one downstream send, keyed by `(job, queue)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerRecord {
    pub job_id: JobId,
    pub queue_name: String,
    pub message: TriggerMessage,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl TriggerRecord {
    pub fn new(message: TriggerMessage, queue_name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            job_id: message.job_id,
            queue_name: queue_name.into(),
            message,
            created_at: now,
            expires_at: now + Duration::days(TRIGGER_RECORD_TTL_DAYS),
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// Queue send failure.
#[derive(Debug, Clone, thiserror::Error)]
#[error("queue send failed: {0}")]
pub struct QueueError(pub String);

/// Downstream queue port.
///
/// Delivery is at-least-once: overlapping ticks can re-send despite the
/// audit guard, so the downstream consumer must be idempotent.
pub trait DownstreamQueue: Send + Sync {
    /// Queue name, used to key the audit record.
    fn name(&self) -> &str;

    fn enqueue(&self, message: &TriggerMessage) -> Result<(), QueueError>;
}

impl<Q> DownstreamQueue for Arc<Q>
where
    Q: DownstreamQueue + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    fn enqueue(&self, message: &TriggerMessage) -> Result<(), QueueError> {
        (**self).enqueue(message)
    }
}

/// Downstream send failure; the job stays non-terminal and the decision is
/// retried on a later tick.
#[derive(Debug, thiserror::Error)]
#[error("downstream delivery failed: {0}")]
pub struct TriggerDeliveryError(#[source] pub QueueError);

/// What a send call actually did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    Sent,
    /// An unexpired audit record already existed for `(job, queue)`.
    DuplicateSuppressed,
}

/// Sends the single downstream message for a finalized job and writes the
/// audit record.
pub struct DownstreamTrigger<R, Q> {
    repository: R,
    queue: Q,
}

impl<R, Q> DownstreamTrigger<R, Q>
where
    R: JobRepository,
    Q: DownstreamQueue,
{
    pub fn new(repository: R, queue: Q) -> Self {
        Self { repository, queue }
    }

    /// Enqueue the trigger for `job`, unless one was already recorded.
    ///
    /// The audit read happens before the send: two ticks racing over the same
    /// job (slow tick plus early retry) would otherwise both observe the job
    /// as eligible and both enqueue. The guard is best-effort only; a read
    /// failure is logged and the send proceeds, because losing the trigger
    /// outright is worse than a duplicate the consumer can absorb.
    pub fn send(
        &self,
        job: &Job,
        partial: bool,
        now: DateTime<Utc>,
    ) -> Result<SendOutcome, TriggerDeliveryError> {
        match self.repository.trigger_record(job.id, self.queue.name()) {
            Ok(Some(existing)) => {
                info!(
                    job_id = %job.id,
                    queue = self.queue.name(),
                    sent_at = %existing.created_at,
                    "duplicate downstream trigger suppressed"
                );
                return Ok(SendOutcome::DuplicateSuppressed);
            }
            Ok(None) => {}
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "audit record read failed; sending anyway");
            }
        }

        let message = TriggerMessage {
            job_id: job.id,
            timestamp: now,
            kind: FAN_IN_TRIGGER_KIND.to_string(),
            partial,
            metadata: json!({
                "total": job.total(),
                "completed": job.done_count(),
                "failed": job.failed.len(),
                "note": job.processing_note,
                "job": job.metadata,
            }),
        };

        self.queue.enqueue(&message).map_err(TriggerDeliveryError)?;
        info!(job_id = %job.id, queue = self.queue.name(), partial, "downstream trigger sent");

        let record = TriggerRecord::new(message, self.queue.name(), now);
        if let Err(e) = self.repository.put_trigger_record(&record) {
            // the message is already out; the audit record is debugging aid
            warn!(job_id = %job.id, error = %e, "trigger audit write failed");
        }

        Ok(SendOutcome::Sent)
    }
}

/// In-memory queue for tests/dev.
#[derive(Debug)]
pub struct InMemoryDownstreamQueue {
    name: String,
    messages: Mutex<Vec<TriggerMessage>>,
}

impl InMemoryDownstreamQueue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            messages: Mutex::new(Vec::new()),
        }
    }

    pub fn arc(name: impl Into<String>) -> Arc<Self> {
        Arc::new(Self::new(name))
    }

    /// Snapshot of everything enqueued so far.
    pub fn messages(&self) -> Vec<TriggerMessage> {
        self.messages.lock().map(|m| m.clone()).unwrap_or_default()
    }
}

impl DownstreamQueue for InMemoryDownstreamQueue {
    fn name(&self) -> &str {
        &self.name
    }

    fn enqueue(&self, message: &TriggerMessage) -> Result<(), QueueError> {
        let mut messages = self
            .messages
            .lock()
            .map_err(|_| QueueError("queue lock poisoned".to_string()))?;
        messages.push(message.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobStatus;
    use crate::store::InMemoryJobRepository;
    use muster_core::SubtaskId;

    fn finalized_job(now: DateTime<Utc>) -> Job {
        let mut job = Job::new(
            JobId::new(),
            vec![SubtaskId::from("a"), SubtaskId::from("b")],
            JsonValue::Null,
            now,
        );
        job.record_success(&SubtaskId::from("a"), now);
        job.record_success(&SubtaskId::from("b"), now);
        job.finalize(JobStatus::Complete, "all 2 subtasks completed", now);
        job
    }

    #[test]
    fn send_enqueues_and_records_audit() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let trigger = DownstreamTrigger::new(repo.clone(), queue.clone());

        let now = Utc::now();
        let job = finalized_job(now);

        let outcome = trigger.send(&job, false, now).unwrap();
        assert_eq!(outcome, SendOutcome::Sent);

        let messages = queue.messages();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].job_id, job.id);
        assert_eq!(messages[0].kind, FAN_IN_TRIGGER_KIND);
        assert!(!messages[0].partial);
        assert_eq!(messages[0].metadata["completed"], 2);

        let record = repo.trigger_record(job.id, "processing").unwrap().unwrap();
        assert_eq!(record.message, messages[0]);
    }

    #[test]
    fn second_send_is_suppressed_by_audit_record() {
        let repo = InMemoryJobRepository::arc();
        let queue = InMemoryDownstreamQueue::arc("processing");
        let trigger = DownstreamTrigger::new(repo, queue.clone());

        let now = Utc::now();
        let job = finalized_job(now);

        assert_eq!(trigger.send(&job, false, now).unwrap(), SendOutcome::Sent);
        assert_eq!(
            trigger.send(&job, false, now).unwrap(),
            SendOutcome::DuplicateSuppressed
        );
        assert_eq!(queue.messages().len(), 1);
    }

    #[test]
    fn queue_failure_surfaces_and_writes_no_audit() {
        struct BrokenQueue;

        impl DownstreamQueue for BrokenQueue {
            fn name(&self) -> &str {
                "processing"
            }

            fn enqueue(&self, _message: &TriggerMessage) -> Result<(), QueueError> {
                Err(QueueError("downstream unavailable".to_string()))
            }
        }

        let repo = InMemoryJobRepository::arc();
        let trigger = DownstreamTrigger::new(repo.clone(), BrokenQueue);

        let now = Utc::now();
        let job = finalized_job(now);

        assert!(trigger.send(&job, false, now).is_err());
        assert!(repo.trigger_record(job.id, "processing").unwrap().is_none());
    }
}
