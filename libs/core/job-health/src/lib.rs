mod http;
mod monitor;

pub use http::{router, HealthState};
pub use monitor::{
    names, CachedHealth, ComponentHealth, DatabaseProbe, HealthReport, HealthStatus, JobMetric, QueueMetric,
    RedisProbe, SystemMetrics, SystemMonitor,
};
