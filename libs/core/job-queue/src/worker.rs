use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use job_actions::ActionContext;
use job_errors::{calculate_backoff, BackoffConfig, ErrorContext, JobError, JobErrorKind, Severity};
use serde_json::Value;
use tokio::sync::{watch, Semaphore};
use tokio::task::JoinSet;
use tracing::{error, info, warn};

pub use job_actions::Dependencies;

use crate::broker::{Broker, EnqueueOptions, QueuedJob};

/// A job to enqueue as a consequence of successfully processing another —
/// e.g. `FANOUT_LINES` emitting one ingredient job per parsed line.
#[derive(Debug, Clone)]
pub struct FollowOnJob {
    pub queue_name: String,
    pub payload: Value,
    pub opts: EnqueueOptions,
}

impl FollowOnJob {
    pub fn new(queue_name: impl Into<String>, payload: Value) -> Self {
        Self {
            queue_name: queue_name.into(),
            payload,
            opts: EnqueueOptions::default(),
        }
    }
}

/// The result of running a stage's pipeline against one job's payload.
#[derive(Debug, Clone)]
pub struct ProcessOutcome {
    pub payload: Value,
    pub follow_on: Vec<FollowOnJob>,
}

impl ProcessOutcome {
    pub fn new(payload: Value) -> Self {
        Self {
            payload,
            follow_on: Vec::new(),
        }
    }

    pub fn with_follow_on(mut self, jobs: Vec<FollowOnJob>) -> Self {
        self.follow_on = jobs;
        self
    }
}

/// Consulted before executing a job's pipeline (step 3 of the processing
/// loop). An unhealthy system fails the job as a retryable
/// `EXTERNAL_SERVICE_ERROR` rather than letting it run against a degraded
/// dependency.
pub trait HealthMonitor: Send + Sync {
    fn is_healthy(&self) -> bool;
}

/// Always-healthy monitor for workers run before C9 is wired in.
pub struct AlwaysHealthy;

impl HealthMonitor for AlwaysHealthy {
    fn is_healthy(&self) -> bool {
        true
    }
}

/// A stage's composed action pipeline, bound to one payload shape. One
/// `JobProcessor` per worker kind (categorization, ingredient, instruction,
/// note, pattern).
#[async_trait]
pub trait JobProcessor: Send + Sync {
    /// Field names that must be present (and non-null) in the raw job
    /// payload before the pipeline runs. A missing field is a terminal,
    /// non-retryable validation failure (step 2 of the processing loop).
    fn required_fields(&self) -> &'static [&'static str];

    async fn execute(
        &self,
        payload: Value,
        deps: &Dependencies,
        ctx: &ActionContext,
    ) -> Result<ProcessOutcome, JobError>;
}

/// Worker tuning knobs (spec §4.4: concurrency limit, default 3).
#[derive(Debug, Clone, Copy)]
pub struct WorkerConfig {
    pub concurrency: usize,
    pub max_retries: u32,
    pub poll_interval: Duration,
    pub backoff: BackoffConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 3,
            max_retries: job_errors::DEFAULT_MAX_RETRIES,
            poll_interval: Duration::from_millis(200),
            backoff: BackoffConfig::default(),
        }
    }
}

fn missing_field_error(field: &str, ctx: &QueuedJob) -> JobError {
    JobError::validation(
        format!("missing required field '{field}'"),
        ErrorContext {
            job_id: Some(ctx.job_id.clone()),
            queue_name: Some(ctx.queue_name.clone()),
            ..Default::default()
        },
    )
}

fn string_field(payload: &Value, field: &str) -> Option<String> {
    payload.get(field).and_then(Value::as_str).map(str::to_string)
}

/// Binds a queue to a dependencies bundle and a composed action pipeline,
/// dequeuing and running jobs up to `concurrency` at a time. Grounded in
/// `stream_worker::worker::StreamWorker`'s semaphore + `JoinSet` loop,
/// generalized from a Redis consumer group to the `Broker` trait.
pub struct Worker<P: JobProcessor + 'static> {
    pub worker_name: String,
    pub queue_name: String,
    broker: Arc<dyn Broker>,
    processor: Arc<P>,
    dependencies: Dependencies,
    health: Arc<dyn HealthMonitor>,
    config: WorkerConfig,
}

impl<P: JobProcessor + 'static> Worker<P> {
    pub fn new(
        worker_name: impl Into<String>,
        queue_name: impl Into<String>,
        broker: Arc<dyn Broker>,
        processor: Arc<P>,
        dependencies: Dependencies,
        health: Arc<dyn HealthMonitor>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            worker_name: worker_name.into(),
            queue_name: queue_name.into(),
            broker,
            processor,
            dependencies,
            health,
            config,
        }
    }

    /// Runs the per-job processing loop (spec §4.4 steps 1-5) once for
    /// `job`. Returns `Ok(())` once the job has been acked, nacked for
    /// retry, or routed to the dead-letter queue.
    pub async fn process_one(&self, job: QueuedJob) -> Result<(), JobError> {
        // Step 1: ActionContext from job fields.
        let import_id = string_field(&job.payload, "importId").unwrap_or_default();
        let mut ctx = ActionContext::new(
            job.job_id.clone(),
            job.queue_name.clone(),
            self.worker_name.clone(),
            self.worker_name.clone(),
            import_id,
        )
        .with_attempt(job.attempt_number);
        if let Some(note_id) = string_field(&job.payload, "noteId") {
            ctx = ctx.with_note_id(note_id);
        }

        // Step 2: required-field validation is terminal, non-retryable.
        for field in self.processor.required_fields() {
            if job.payload.get(*field).is_none_or(Value::is_null) {
                let err = missing_field_error(field, &job);
                err.log();
                self.dead_letter(&job, &err).await;
                return Err(err);
            }
        }

        // Step 3: health gate.
        if !self.health.is_healthy() {
            let err = JobError {
                kind: JobErrorKind::ExternalServiceError,
                severity: Severity::High,
                message: "system unhealthy, deferring job".to_string(),
                code: None,
                context: None,
                original_error: None,
                timestamp: chrono::Utc::now(),
                job_id: Some(job.job_id.clone()),
                queue_name: Some(job.queue_name.clone()),
                retry_count: Some(job.retry_count),
            };
            self.retry_or_dead_letter(&job, err.clone()).await;
            return Err(err);
        }

        // Step 4: execute the pipeline.
        match self.processor.execute(job.payload.clone(), &self.dependencies, &ctx).await {
            Ok(outcome) => {
                // Step 5: ack, enqueue follow-ons, done.
                if let Err(err) = self.broker.ack(&job).await {
                    warn!(job_id = %job.job_id, error = %err, "ack failed");
                }
                for follow_on in outcome.follow_on {
                    if let Err(err) = self
                        .broker
                        .enqueue(&follow_on.queue_name, follow_on.payload, follow_on.opts)
                        .await
                    {
                        warn!(queue = %follow_on.queue_name, error = %err, "follow-on enqueue failed");
                    }
                }
                info!(job_id = %job.job_id, queue = %job.queue_name, "job completed");
                Ok(())
            }
            Err(err) => {
                err.log();
                self.retry_or_dead_letter(&job, err.clone()).await;
                Err(err)
            }
        }
    }

    async fn retry_or_dead_letter(&self, job: &QueuedJob, err: JobError) {
        if err.should_retry(self.config.max_retries) {
            let delay = calculate_backoff(job.retry_count as i32, &self.config.backoff);
            if let Err(nack_err) = self.broker.nack(job, delay).await {
                warn!(job_id = %job.job_id, error = %nack_err, "nack failed");
            }
        } else {
            self.dead_letter(job, &err).await;
        }
    }

    async fn dead_letter(&self, job: &QueuedJob, err: &JobError) {
        let dlq_name = format!("{}:dlq", job.queue_name);
        let mut payload = job.payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("failureReason".to_string(), Value::String(err.message.clone()));
            map.insert("failureKind".to_string(), Value::String(err.kind.to_string()));
        }
        if let Err(enqueue_err) = self
            .broker
            .enqueue(&dlq_name, payload, EnqueueOptions::default())
            .await
        {
            error!(job_id = %job.job_id, error = %enqueue_err, "failed to enqueue to dead-letter queue");
        }
        if let Err(ack_err) = self.broker.ack(job).await {
            warn!(job_id = %job.job_id, error = %ack_err, "ack after dead-letter failed");
        }
    }

    /// Runs the worker loop: poll the broker, process up to `concurrency`
    /// jobs concurrently, until `shutdown` flips to `true`.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let semaphore = Arc::new(Semaphore::new(self.config.concurrency));
        let mut tasks = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let batch = match self.broker.dequeue(&self.queue_name, self.config.concurrency).await {
                Ok(jobs) => jobs,
                Err(err) => {
                    err.log();
                    Vec::new()
                }
            };

            for job in batch {
                let permit = Arc::clone(&semaphore).acquire_owned().await.expect("semaphore closed");
                let worker = Arc::clone(&self);
                tasks.spawn(async move {
                    let _permit = permit;
                    let _ = worker.process_one(job).await;
                });
            }

            tokio::select! {
                _ = tokio::time::sleep(self.config.poll_interval) => {}
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        while tasks.join_next().await.is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::InMemoryBroker;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoProcessor;

    #[async_trait]
    impl JobProcessor for EchoProcessor {
        fn required_fields(&self) -> &'static [&'static str] {
            &["noteId"]
        }

        async fn execute(
            &self,
            payload: Value,
            _deps: &Dependencies,
            _ctx: &ActionContext,
        ) -> Result<ProcessOutcome, JobError> {
            Ok(ProcessOutcome::new(payload))
        }
    }

    struct AlwaysFailProcessor;

    #[async_trait]
    impl JobProcessor for AlwaysFailProcessor {
        fn required_fields(&self) -> &'static [&'static str] {
            &[]
        }

        async fn execute(
            &self,
            _payload: Value,
            _deps: &Dependencies,
            ctx: &ActionContext,
        ) -> Result<ProcessOutcome, JobError> {
            Err(JobError::classify(
                "database outage",
                ErrorContext {
                    job_id: Some(ctx.job_id.clone()),
                    retry_count: Some(ctx.retry_count),
                    ..Default::default()
                },
            ))
        }
    }

    fn test_worker<P: JobProcessor + 'static>(
        broker: Arc<InMemoryBroker>,
        processor: P,
    ) -> Worker<P> {
        Worker::new(
            "test-worker",
            "note",
            broker,
            Arc::new(processor),
            Dependencies::new(),
            Arc::new(AlwaysHealthy),
            WorkerConfig::default(),
        )
    }

    #[tokio::test]
    async fn missing_required_field_is_terminal_and_dead_lettered() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("note", json!({"importId": "i1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker.dequeue("note", 1).await.unwrap().remove(0);

        let worker = test_worker(Arc::clone(&broker), EchoProcessor);
        let result = worker.process_one(job).await;

        assert!(result.is_err());
        assert_eq!(broker.queue_len("note:dlq"), 1);
    }

    #[tokio::test]
    async fn successful_job_is_acked_and_follow_ons_enqueued() {
        let concrete = Arc::new(InMemoryBroker::new());
        let broker: Arc<dyn Broker> = concrete.clone();
        broker
            .enqueue("note", json!({"importId": "i1", "noteId": "n1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker.dequeue("note", 1).await.unwrap().remove(0);

        struct FanoutProcessor;
        #[async_trait]
        impl JobProcessor for FanoutProcessor {
            fn required_fields(&self) -> &'static [&'static str] {
                &["noteId"]
            }
            async fn execute(
                &self,
                payload: Value,
                _deps: &Dependencies,
                _ctx: &ActionContext,
            ) -> Result<ProcessOutcome, JobError> {
                Ok(ProcessOutcome::new(payload.clone())
                    .with_follow_on(vec![FollowOnJob::new("ingredient", json!({"noteId": "n1"}))]))
            }
        }

        let worker = Worker::new(
            "note-worker",
            "note",
            broker,
            Arc::new(FanoutProcessor),
            Dependencies::new(),
            Arc::new(AlwaysHealthy),
            WorkerConfig::default(),
        );
        worker.process_one(job).await.unwrap();

        assert_eq!(concrete.queue_len("ingredient"), 1);
    }

    #[tokio::test]
    async fn retryable_failure_is_requeued_not_dead_lettered() {
        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("note", json!({"importId": "i1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker.dequeue("note", 1).await.unwrap().remove(0);

        let worker = test_worker(Arc::clone(&broker), AlwaysFailProcessor);
        let result = worker.process_one(job).await;

        assert!(result.is_err());
        assert_eq!(broker.queue_len("note:dlq"), 0);
    }

    #[tokio::test]
    async fn unhealthy_system_defers_job_as_retryable() {
        struct NeverHealthy;
        impl HealthMonitor for NeverHealthy {
            fn is_healthy(&self) -> bool {
                false
            }
        }

        let broker = Arc::new(InMemoryBroker::new());
        broker
            .enqueue("note", json!({"importId": "i1", "noteId": "n1"}), EnqueueOptions::default())
            .await
            .unwrap();
        let job = broker.dequeue("note", 1).await.unwrap().remove(0);

        let worker = Worker::new(
            "test-worker",
            "note",
            Arc::clone(&broker) as Arc<dyn Broker>,
            Arc::new(EchoProcessor),
            Dependencies::new(),
            Arc::new(NeverHealthy),
            WorkerConfig::default(),
        );
        let result = worker.process_one(job).await;

        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, JobErrorKind::ExternalServiceError);
        assert_eq!(broker.queue_len("note:dlq"), 0);
    }
}
