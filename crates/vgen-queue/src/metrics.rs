//! Queue gauges.

use metrics::gauge;

use crate::config::QueueStats;

pub mod names {
    pub const QUEUE_WAITING: &str = "vgen_queue_waiting";
    pub const QUEUE_ACTIVE: &str = "vgen_queue_active";
    pub const QUEUE_DELAYED: &str = "vgen_queue_delayed";
    pub const QUEUE_FAILED: &str = "vgen_queue_failed";
    pub const QUEUE_HEALTHY: &str = "vgen_queue_healthy";
}

/// Record queue depth gauges.
pub fn record_queue_stats(queue: &str, stats: &QueueStats) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_WAITING, &labels).set(stats.waiting as f64);
    gauge!(names::QUEUE_ACTIVE, &labels).set(stats.active as f64);
    gauge!(names::QUEUE_DELAYED, &labels).set(stats.delayed as f64);
    gauge!(names::QUEUE_FAILED, &labels).set(stats.failed as f64);
}

pub fn record_queue_health(queue: &str, healthy: bool) {
    let labels = [("queue", queue.to_string())];
    gauge!(names::QUEUE_HEALTHY, &labels).set(if healthy { 1.0 } else { 0.0 });
}
