//! Metrics module for dispatcher observability.
//!
//! Prometheus-compatible counters, gauges and histograms covering intake,
//! routing, pacing and SmartGuard activity.
//!
//! ## Available Metrics
//!
//! - `dispatcher_jobs_processed_total` - counter of jobs processed by status
//! - `dispatcher_task_duration_seconds` - histogram of handoff duration
//! - `dispatcher_session_queue_depth` - gauge of per-session queue depth
//! - `dispatcher_errors_total` - counter of errors by type
//! - `dispatcher_retries_total` - counter of retry attempts
//! - `dispatcher_smartguard_rpm` - gauge of the effective RPM per session

use metrics::{counter, gauge, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Duration;

static PROMETHEUS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Metric names as constants for consistency.
pub mod names {
    pub const JOBS_PROCESSED: &str = "dispatcher_jobs_processed_total";
    pub const TASK_DURATION: &str = "dispatcher_task_duration_seconds";
    pub const SESSION_QUEUE_DEPTH: &str = "dispatcher_session_queue_depth";
    pub const ERRORS: &str = "dispatcher_errors_total";
    pub const RETRIES: &str = "dispatcher_retries_total";
    pub const SMARTGUARD_RPM: &str = "dispatcher_smartguard_rpm";
    pub const ACTIVE_PACERS: &str = "dispatcher_active_pacers";
}

/// Job terminal status for metrics labeling.
#[derive(Debug, Clone, Copy)]
pub enum JobStatus {
    Done,
    DoneWithErrors,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Done => "done",
            Self::DoneWithErrors => "done_with_errors",
            Self::Failed => "failed",
        }
    }
}

/// Error category for metrics labeling.
#[derive(Debug, Clone, Copy)]
pub enum ErrorType {
    Transient,
    Permanent,
    RateLimited,
}

impl ErrorType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Permanent => "permanent",
            Self::RateLimited => "rate_limited",
        }
    }
}

/// Initialize the Prometheus metrics exporter. Call once at startup.
pub fn init_metrics() -> PrometheusHandle {
    PROMETHEUS_HANDLE
        .get_or_init(|| {
            PrometheusBuilder::new()
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

/// Get the global Prometheus handle, if initialized.
pub fn get_metrics_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.get().cloned()
}

pub fn record_job_processed(status: JobStatus) {
    counter!(names::JOBS_PROCESSED, "status" => status.as_str()).increment(1);
}

pub fn record_task_duration(session_id: &str, duration: Duration) {
    histogram!(names::TASK_DURATION, "session" => session_id.to_string()).record(duration.as_secs_f64());
}

pub fn set_session_queue_depth(session_id: &str, depth: f64) {
    gauge!(names::SESSION_QUEUE_DEPTH, "session" => session_id.to_string()).set(depth);
}

pub fn record_error(error_type: ErrorType) {
    counter!(names::ERRORS, "error_type" => error_type.as_str()).increment(1);
}

pub fn record_retry(session_id: &str) {
    counter!(names::RETRIES, "session" => session_id.to_string()).increment(1);
}

pub fn set_smartguard_rpm(session_id: &str, rpm: f64) {
    gauge!(names::SMARTGUARD_RPM, "session" => session_id.to_string()).set(rpm);
}

pub fn set_active_pacers(count: f64) {
    gauge!(names::ACTIVE_PACERS).set(count);
}

/// Helper struct for timing a handoff and recording its duration on drop.
pub struct MetricsTimer {
    session_id: String,
    start: std::time::Instant,
}

impl MetricsTimer {
    pub fn new(session_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            start: std::time::Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        record_task_duration(&self.session_id, self.start.elapsed());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_status_as_str() {
        assert_eq!(JobStatus::Done.as_str(), "done");
        assert_eq!(JobStatus::DoneWithErrors.as_str(), "done_with_errors");
        assert_eq!(JobStatus::Failed.as_str(), "failed");
    }

    #[test]
    fn test_error_type_as_str() {
        assert_eq!(ErrorType::Transient.as_str(), "transient");
        assert_eq!(ErrorType::RateLimited.as_str(), "rate_limited");
    }

    #[test]
    fn test_metrics_timer_elapsed() {
        let timer = MetricsTimer::new("s1");
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(timer.elapsed().as_millis() >= 5);
    }
}
