//! System-wide job/queue metrics and composite health reporting.
//! Grounded in `stream_worker::metrics` (the `counter!`/`histogram!`/
//! `gauge!` facade and metric name constants) and the teacher's
//! `PROMETHEUS_HANDLE: OnceLock` singleton pattern, generalized from one
//! stream to every queue/worker in the engine.

use std::collections::{HashMap, VecDeque};
use std::sync::{OnceLock, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use serde::Serialize;

const MAX_JOB_METRICS: usize = 1000;
const JOB_METRIC_MAX_AGE: chrono::Duration = chrono::Duration::hours(24);
const HEALTH_CACHE_DURATION: Duration = Duration::from_millis(30_000);

pub mod names {
    pub const JOBS_PROCESSED: &str = "recipe_jobs_processed_total";
    pub const JOB_DURATION: &str = "recipe_job_processing_duration_seconds";
    pub const QUEUE_DEPTH: &str = "recipe_queue_depth";
    pub const QUEUE_FAILED: &str = "recipe_queue_failed_total";
}

#[derive(Debug, Clone, Serialize)]
pub struct JobMetric {
    pub job_id: String,
    pub duration_ms: u64,
    pub success: bool,
    pub queue_name: Option<String>,
    pub worker_name: Option<String>,
    pub error: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct QueueMetric {
    pub queue_name: String,
    pub job_count: u64,
    pub waiting_count: u64,
    pub active_count: u64,
    pub completed_count: u64,
    pub failed_count: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    /// Worse-of comparison: `Unhealthy` dominates `Degraded` dominates
    /// `Healthy`, matching the overall-status rollup rule.
    fn worse(self, other: Self) -> Self {
        use HealthStatus::*;
        match (self, other) {
            (Unhealthy, _) | (_, Unhealthy) => Unhealthy,
            (Degraded, _) | (_, Degraded) => Degraded,
            _ => Healthy,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ComponentHealth {
    pub status: HealthStatus,
    pub message: Option<String>,
}

impl ComponentHealth {
    pub fn healthy() -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: None,
        }
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Degraded,
            message: Some(message.into()),
        }
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Unhealthy,
            message: Some(message.into()),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SystemMetrics {
    pub total_jobs_processed: u64,
    pub total_jobs_failed: u64,
    pub average_job_duration_ms: f64,
    pub total_errors: u64,
    pub uptime_seconds: u64,
    pub cpu_usage_percent: f64,
    pub memory_usage_bytes: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub queues: HashMap<String, ComponentHealth>,
    pub jobs: ComponentHealth,
    pub overall: HealthStatus,
    pub recommendations: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CachedHealth {
    pub database: ComponentHealth,
    pub redis: ComponentHealth,
    pub queues: HashMap<String, ComponentHealth>,
    pub overall: HealthStatus,
    pub recommendations: Vec<String>,
    pub checked_at: DateTime<Utc>,
}

/// Probes the out-of-scope database collaborator. A real implementation
/// issues a cheap connectivity check (e.g. `SELECT 1`).
#[async_trait]
pub trait DatabaseProbe: Send + Sync {
    async fn check(&self) -> Result<(), String>;
}

/// Probes Redis connectivity; returns the round-trip time on success.
#[async_trait]
pub trait RedisProbe: Send + Sync {
    async fn ping(&self) -> Result<Duration, String>;
}

struct Inner {
    job_metrics: HashMap<String, JobMetric>,
    job_order: VecDeque<String>,
    queue_metrics: HashMap<String, QueueMetric>,
    cached_health: Option<(Instant, CachedHealth)>,
}

impl Inner {
    fn new() -> Self {
        Self {
            job_metrics: HashMap::new(),
            job_order: VecDeque::new(),
            queue_metrics: HashMap::new(),
            cached_health: None,
        }
    }
}

/// Process-wide metrics/health singleton (spec §4.9). Interior state is
/// `RwLock`-guarded so the `OnceLock<SystemMonitor>` holding it can stay
/// immutable.
pub struct SystemMonitor {
    inner: RwLock<Inner>,
    prometheus_handle: OnceLock<PrometheusHandle>,
}

static GLOBAL: OnceLock<SystemMonitor> = OnceLock::new();

impl SystemMonitor {
    fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::new()),
            prometheus_handle: OnceLock::new(),
        }
    }

    pub fn global() -> &'static SystemMonitor {
        GLOBAL.get_or_init(SystemMonitor::new)
    }

    /// Installs the Prometheus recorder/exporter, idempotently.
    pub fn init_prometheus(&self) -> PrometheusHandle {
        self.prometheus_handle
            .get_or_init(|| {
                PrometheusBuilder::new()
                    .install_recorder()
                    .expect("failed to install prometheus recorder")
            })
            .clone()
    }

    pub fn prometheus_handle(&self) -> Option<PrometheusHandle> {
        self.prometheus_handle.get().cloned()
    }

    #[cfg(any(test, feature = "test-util"))]
    pub fn reset_for_test(&self) {
        let mut inner = self.inner.write().expect("job-health lock poisoned");
        *inner = Inner::new();
    }

    /// Upserts a job metric; re-recording the same `job_id` overwrites.
    pub fn track_job_metrics(
        &self,
        job_id: impl Into<String>,
        duration_ms: u64,
        success: bool,
        queue_name: Option<String>,
        worker_name: Option<String>,
        error: Option<String>,
    ) {
        let job_id = job_id.into();
        let metric = JobMetric {
            job_id: job_id.clone(),
            duration_ms,
            success,
            queue_name: queue_name.clone(),
            worker_name,
            error,
            recorded_at: Utc::now(),
        };

        if let Some(queue) = queue_name.as_deref() {
            counter!(
                names::JOBS_PROCESSED,
                "queue" => queue.to_string(),
                "status" => if success { "success" } else { "failed" }.to_string(),
            )
            .increment(1);
            histogram!(names::JOB_DURATION, "queue" => queue.to_string())
                .record(duration_ms as f64 / 1000.0);
        }

        let mut inner = self.inner.write().expect("job-health lock poisoned");
        if inner.job_metrics.insert(job_id.clone(), metric).is_none() {
            inner.job_order.push_back(job_id);
            if inner.job_order.len() > MAX_JOB_METRICS
                && let Some(oldest) = inner.job_order.pop_front()
            {
                inner.job_metrics.remove(&oldest);
            }
        }
    }

    /// Upserts per-queue counters.
    pub fn track_queue_metrics(
        &self,
        queue_name: impl Into<String>,
        job_count: u64,
        waiting_count: u64,
        active_count: u64,
        completed_count: u64,
        failed_count: u64,
    ) {
        let queue_name = queue_name.into();
        gauge!(names::QUEUE_DEPTH, "queue" => queue_name.clone()).set(job_count as f64);
        gauge!(names::QUEUE_FAILED, "queue" => queue_name.clone()).set(failed_count as f64);

        let metric = QueueMetric {
            queue_name: queue_name.clone(),
            job_count,
            waiting_count,
            active_count,
            completed_count,
            failed_count,
        };
        self.inner
            .write()
            .expect("job-health lock poisoned")
            .queue_metrics
            .insert(queue_name, metric);
    }

    /// Drops job metrics older than 24h. Intended to run hourly.
    pub fn cleanup_stale_metrics(&self) {
        let cutoff = Utc::now() - JOB_METRIC_MAX_AGE;
        let mut inner = self.inner.write().expect("job-health lock poisoned");
        let Inner {
            job_metrics, job_order, ..
        } = &mut *inner;
        job_order.retain(|job_id| job_metrics.get(job_id).map(|m| m.recorded_at > cutoff).unwrap_or(false));
        job_metrics.retain(|_, metric| metric.recorded_at > cutoff);
    }

    pub fn get_system_metrics(&self) -> SystemMetrics {
        let inner = self.inner.read().expect("job-health lock poisoned");
        let total_jobs_processed = inner.job_metrics.len() as u64;
        let total_jobs_failed = inner.job_metrics.values().filter(|m| !m.success).count() as u64;
        let total_errors = inner.job_metrics.values().filter(|m| m.error.is_some()).count() as u64;

        let durations: Vec<f64> = inner
            .job_metrics
            .values()
            .map(|m| m.duration_ms as f64)
            .filter(|d| *d > 0.0)
            .collect();
        let average_job_duration_ms = if durations.is_empty() {
            0.0
        } else {
            durations.iter().sum::<f64>() / durations.len() as f64
        };

        SystemMetrics {
            total_jobs_processed,
            total_jobs_failed,
            average_job_duration_ms,
            total_errors,
            uptime_seconds: 0,
            cpu_usage_percent: 0.0,
            memory_usage_bytes: 0,
        }
    }

    fn queue_health(&self) -> HashMap<String, ComponentHealth> {
        let inner = self.inner.read().expect("job-health lock poisoned");
        inner
            .queue_metrics
            .values()
            .map(|q| {
                let health = if q.job_count == 0 {
                    ComponentHealth::healthy()
                } else {
                    let failure_rate = q.failed_count as f64 / q.job_count as f64;
                    if failure_rate >= 0.25 {
                        ComponentHealth::unhealthy(format!("High failure rate: {:.1}%", failure_rate * 100.0))
                    } else if failure_rate >= 0.10 {
                        ComponentHealth::degraded(format!("Elevated failure rate: {:.1}%", failure_rate * 100.0))
                    } else {
                        ComponentHealth::healthy()
                    }
                };
                (q.queue_name.clone(), health)
            })
            .collect()
    }

    fn job_health(&self) -> ComponentHealth {
        let metrics = self.get_system_metrics();
        if metrics.total_jobs_processed == 0 {
            return ComponentHealth::healthy();
        }
        let failure_rate = metrics.total_jobs_failed as f64 / metrics.total_jobs_processed as f64;
        if failure_rate >= 0.15 {
            ComponentHealth::unhealthy(format!("High failure rate: {:.1}%", failure_rate * 100.0))
        } else if failure_rate >= 0.05 {
            ComponentHealth::degraded(format!("Elevated failure rate: {:.1}%", failure_rate * 100.0))
        } else {
            ComponentHealth::healthy()
        }
    }

    /// Composite health report: per-queue + overall job failure-rate
    /// health, rolled up into an overall status plus recommendations.
    pub fn generate_health_report(&self) -> HealthReport {
        let queues = self.queue_health();
        let jobs = self.job_health();

        let mut overall = jobs.status;
        for health in queues.values() {
            overall = overall.worse(health.status);
        }

        let mut recommendations = Vec::new();
        if jobs.status != HealthStatus::Healthy {
            recommendations.push("Investigate job failure rate".to_string());
        }
        let mut unhealthy_queues: Vec<&String> = queues
            .iter()
            .filter(|(_, h)| h.status != HealthStatus::Healthy)
            .map(|(name, _)| name)
            .collect();
        unhealthy_queues.sort();
        for queue in unhealthy_queues {
            recommendations.push(format!("Investigate {queue} queue failures"));
        }

        HealthReport {
            queues,
            jobs,
            overall,
            recommendations,
        }
    }

    /// Cached composite health including the external database/Redis
    /// probes, refreshed at most every 30s.
    pub async fn get_health(
        &self,
        database: &dyn DatabaseProbe,
        redis_host: &str,
        redis: &dyn RedisProbe,
    ) -> CachedHealth {
        {
            let inner = self.inner.read().expect("job-health lock poisoned");
            if let Some((checked_at, cached)) = &inner.cached_health
                && checked_at.elapsed() < HEALTH_CACHE_DURATION
            {
                return cached.clone();
            }
        }

        let (db_result, redis_result) = tokio::join!(database.check(), async {
            if redis_host.is_empty() {
                return Err("Redis host not configured".to_string());
            }
            redis.ping().await
        });

        let database_health = match db_result {
            Ok(()) => ComponentHealth::healthy(),
            Err(message) => ComponentHealth::unhealthy(message),
        };

        let redis_health = match redis_result {
            Ok(elapsed) if elapsed >= Duration::from_millis(500) => {
                ComponentHealth::degraded(format!("response time {}ms", elapsed.as_millis()))
            }
            Ok(_) => ComponentHealth::healthy(),
            Err(message) => ComponentHealth::unhealthy(message),
        };

        let queues = self.queue_health();
        let mut overall = database_health.status.worse(redis_health.status);
        for health in queues.values() {
            overall = overall.worse(health.status);
        }

        let mut recommendations = Vec::new();
        if database_health.status == HealthStatus::Unhealthy || redis_health.status == HealthStatus::Unhealthy {
            recommendations.push("Check database and Redis connectivity".to_string());
        }
        let mut unhealthy_queues: Vec<&String> = queues
            .iter()
            .filter(|(_, h)| h.status != HealthStatus::Healthy)
            .map(|(name, _)| name)
            .collect();
        unhealthy_queues.sort();
        for queue in unhealthy_queues {
            recommendations.push(format!("Investigate {queue} queue failures"));
        }

        let cached = CachedHealth {
            database: database_health,
            redis: redis_health,
            queues,
            overall,
            recommendations,
            checked_at: Utc::now(),
        };

        self.inner.write().expect("job-health lock poisoned").cached_health = Some((Instant::now(), cached.clone()));

        cached
    }
}
