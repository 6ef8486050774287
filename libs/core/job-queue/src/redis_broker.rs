//! Redis-backed `Broker`, adapted from `stream_worker::consumer::StreamConsumer`'s
//! XADD/XREADGROUP/XACK sequence. A job's visibility window is expressed as
//! Redis stream pending-entry ownership rather than an explicit timestamp:
//! `nack` re-adds the job to the stream (XADD) after the caller-chosen
//! delay and acks the original entry, since Redis streams have no native
//! "deliver not before" primitive.

use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;

use chrono::Utc;
use job_errors::{ErrorContext, JobError};
use serde_json::Value;

use crate::broker::{Broker, EnqueueOptions, QueuedJob};

pub struct RedisBroker {
    conn: ConnectionManager,
    consumer_group: String,
    consumer_id: String,
}

impl RedisBroker {
    pub fn new(conn: ConnectionManager, consumer_group: impl Into<String>, consumer_id: impl Into<String>) -> Self {
        Self {
            conn,
            consumer_group: consumer_group.into(),
            consumer_id: consumer_id.into(),
        }
    }

    async fn ensure_group(&self, stream_name: &str) -> Result<(), JobError> {
        let mut conn = self.conn.clone();
        let result: Result<(), redis::RedisError> = redis::cmd("XGROUP")
            .arg("CREATE")
            .arg(stream_name)
            .arg(&self.consumer_group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(redis_job_error(&e, stream_name)),
        }
    }
}

fn redis_job_error(err: &redis::RedisError, queue_name: &str) -> JobError {
    JobError::classify(
        format!("redis: {err}"),
        ErrorContext {
            queue_name: Some(queue_name.to_string()),
            ..Default::default()
        },
    )
}

#[async_trait::async_trait]
impl Broker for RedisBroker {
    async fn enqueue(&self, queue_name: &str, payload: Value, opts: EnqueueOptions) -> Result<String, JobError> {
        self.ensure_group(queue_name).await?;

        let job_id = uuid::Uuid::new_v4().to_string();
        let job = QueuedJob {
            job_id: job_id.clone(),
            queue_name: queue_name.to_string(),
            payload: payload.clone(),
            attempt_number: 1,
            retry_count: 0,
            enqueued_at: Utc::now(),
            visible_at: Utc::now(),
            opts,
        };
        let job_json = serde_json::to_string(&job.payload).map_err(|e| redis_job_error_from_display(&e, queue_name))?;

        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(queue_name)
            .arg("*")
            .arg("jobId")
            .arg(&job_id)
            .arg("job")
            .arg(job_json)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_job_error(&e, queue_name))?;

        Ok(job_id)
    }

    async fn dequeue(&self, queue_name: &str, max: usize) -> Result<Vec<QueuedJob>, JobError> {
        self.ensure_group(queue_name).await?;
        let mut conn = self.conn.clone();

        let opts = StreamReadOptions::default()
            .group(&self.consumer_group, &self.consumer_id)
            .count(max);

        let reply: StreamReadReply = conn
            .xread_options(&[queue_name], &[">"], &opts)
            .await
            .map_err(|e| redis_job_error(&e, queue_name))?;

        let mut jobs = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let job_id = entry
                    .map
                    .get("jobId")
                    .and_then(|v| match v {
                        redis::Value::BulkString(bytes) => Some(String::from_utf8_lossy(bytes).to_string()),
                        redis::Value::SimpleString(s) => Some(s.clone()),
                        _ => None,
                    })
                    .unwrap_or_else(|| entry.id.clone());

                let payload = entry
                    .map
                    .get("job")
                    .and_then(|v| match v {
                        redis::Value::BulkString(bytes) => serde_json::from_slice(bytes).ok(),
                        redis::Value::SimpleString(s) => serde_json::from_str(s).ok(),
                        _ => None,
                    })
                    .unwrap_or(Value::Null);

                jobs.push(QueuedJob {
                    job_id,
                    queue_name: queue_name.to_string(),
                    payload,
                    attempt_number: 1,
                    retry_count: 0,
                    enqueued_at: Utc::now(),
                    visible_at: Utc::now(),
                    opts: EnqueueOptions::default(),
                });
            }
        }

        Ok(jobs)
    }

    async fn ack(&self, job: &QueuedJob) -> Result<(), JobError> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .xack(&job.queue_name, &self.consumer_group, &[&job.job_id])
            .await
            .map_err(|e| redis_job_error(&e, &job.queue_name))?;
        Ok(())
    }

    async fn nack(&self, job: &QueuedJob, retry_after_ms: i64) -> Result<(), JobError> {
        self.ack(job).await?;
        tokio::time::sleep(std::time::Duration::from_millis(retry_after_ms.max(0) as u64)).await;

        let mut retried = job.clone();
        retried.attempt_number += 1;
        retried.retry_count += 1;

        let job_json = serde_json::to_string(&retried.payload).map_err(|e| redis_job_error_from_display(&e, &job.queue_name))?;
        let mut conn = self.conn.clone();
        let _: String = redis::cmd("XADD")
            .arg(&job.queue_name)
            .arg("*")
            .arg("jobId")
            .arg(&retried.job_id)
            .arg("job")
            .arg(job_json)
            .query_async(&mut conn)
            .await
            .map_err(|e| redis_job_error(&e, &job.queue_name))?;
        Ok(())
    }
}

fn redis_job_error_from_display(err: &impl std::fmt::Display, queue_name: &str) -> JobError {
    JobError::classify(
        format!("job serialization error: {err}"),
        ErrorContext {
            queue_name: Some(queue_name.to_string()),
            ..Default::default()
        },
    )
}
