//! Generic queue + worker runtime: a `Broker`-bound worker loop that
//! dequeues, classifies failures, executes a stage's processor, and
//! acks/retries/DLQs — independent of which broker backs it.
//!
//! Grounded directly on `stream_worker::worker::StreamWorker` (semaphore-
//! bounded concurrent job processing via `tokio::task::JoinSet`) and
//! `stream_worker::consumer::StreamConsumer` (the XADD/XREADGROUP/XACK
//! sequence, generalized here into the `Broker` trait so the engine isn't
//! tied to Redis).

mod broker;
#[cfg(feature = "redis-broker")]
mod redis_broker;
mod worker;

pub use broker::{Backoff, Broker, EnqueueOptions, InMemoryBroker, QueuedJob};
#[cfg(feature = "redis-broker")]
pub use redis_broker::RedisBroker;
pub use worker::{
    AlwaysHealthy, Dependencies, FollowOnJob, HealthMonitor, JobProcessor, ProcessOutcome, Worker, WorkerConfig,
};

pub use job_actions::ActionContext;
