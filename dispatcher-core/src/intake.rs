//! Intake/routing loop: drains the retry queue, pops one job id from the
//! priority or gateway list, validates it, and fans it out to per-session
//! queues. Deliberately a single cooperative loop with no worker pool —
//! the per-session consumers provide the real parallelism.

use crate::error::{clamp_retry_delay_ms, DispatcherError};
use crate::incidents::IncidentSink;
use crate::kv::KvClient;
use crate::models::{invalid, Job, JobMode, JobStatus, RoutingHints, Task, NO_SESSIONS_AVAILABLE};
use crate::orchestrator::OrchestratorClient;
use crate::router::{Router, RoutingStrategy};
use dispatcher_config::queues::QueueConfig;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_ZSET: &str = "queue:retry";
const RETRY_DRAIN_BATCH: isize = 50;

pub struct IntakeStats {
    pub processed: AtomicU64,
    pub routed: AtomicU64,
    pub failed: AtomicU64,
}

impl Default for IntakeStats {
    fn default() -> Self {
        Self { processed: AtomicU64::new(0), routed: AtomicU64::new(0), failed: AtomicU64::new(0) }
    }
}

pub struct IntakeLoop {
    kv: KvClient,
    queues: QueueConfig,
    job_stats_ttl_seconds: i64,
    retry_delay_ms: u64,
    poll_interval_ms: u64,
    orchestrator: Arc<OrchestratorClient>,
    router: Arc<Router>,
    incidents: Arc<IncidentSink>,
    pub stats: Arc<IntakeStats>,
}

impl IntakeLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        kv: KvClient,
        queues: QueueConfig,
        job_stats_ttl_seconds: i64,
        retry_delay_ms: u64,
        poll_interval_ms: u64,
        orchestrator: Arc<OrchestratorClient>,
        router: Arc<Router>,
        incidents: Arc<IncidentSink>,
    ) -> Self {
        Self {
            kv,
            queues,
            job_stats_ttl_seconds,
            retry_delay_ms,
            poll_interval_ms,
            orchestrator,
            router,
            incidents,
            stats: Arc::new(IntakeStats::default()),
        }
    }

    /// Run the loop for as long as the process lives. `running` gates whether
    /// each tick actually drains and routes (set by `POST /start` and
    /// `/stop`); the loop itself only ends when the task is aborted at
    /// process shutdown.
    pub async fn run(&self, running: Arc<AtomicBool>) {
        loop {
            if !running.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
                continue;
            }

            self.drain_retry_queue().await;

            let job_id = match self.pop_next_job_id().await {
                Ok(id) => id,
                Err(e) => {
                    warn!(error = %e, "intake loop: KV error popping job id");
                    None
                }
            };

            if let Some(job_id) = job_id {
                self.stats.processed.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.route_gateway_job(&job_id).await {
                    warn!(error = %e, job_id = %job_id, "intake loop: failed to route job");
                }
            }

            tokio::time::sleep(Duration::from_millis(self.poll_interval_ms)).await;
        }
    }

    async fn drain_retry_queue(&self) {
        let now = chrono::Utc::now().timestamp_millis() as f64;
        let due = self.kv.zpop_due(RETRY_ZSET, now, RETRY_DRAIN_BATCH).await.unwrap_or_default();
        for job_id in due {
            if let Err(e) = self.kv.lpush(&self.queues.gateway_queue_key, &job_id).await {
                warn!(error = %e, job_id = %job_id, "failed to re-push retried job onto gateway queue");
            }
        }
    }

    async fn pop_next_job_id(&self) -> Result<Option<String>, DispatcherError> {
        if let Some(id) = self.kv.rpop(&self.queues.priority_queue_key).await? {
            return Ok(Some(id));
        }
        self.kv.rpop(&self.queues.gateway_queue_key).await
    }

    async fn load_job(&self, job_id: &str) -> Result<Option<Job>, DispatcherError> {
        let Some(raw) = self.kv.get(&format!("job:{}", job_id)).await? else {
            return Ok(None);
        };
        Ok(Some(serde_json::from_str(&raw)?))
    }

    async fn save_job(&self, job_id: &str, job: &Job) -> Result<(), DispatcherError> {
        let raw = serde_json::to_string(job)?;
        self.kv.set(&format!("job:{}", job_id), &raw).await
    }

    /// Validate a job and, on success, return its parsed mode (so callers
    /// don't have to re-parse the raw `mode` string after the fact).
    fn validate(job: &Job) -> Result<JobMode, &'static str> {
        if job.contacts.is_empty() {
            return Err(invalid::CONTACTS);
        }
        let mode = job.parsed_mode().ok_or(invalid::MODE)?;
        match mode {
            JobMode::Message => {
                if job.message.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid::MESSAGE);
                }
            }
            JobMode::Image => {
                if job.media_ref.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid::MEDIA_REF);
                }
            }
        }
        Ok(mode)
    }

    pub async fn route_gateway_job(&self, job_id: &str) -> Result<(), DispatcherError> {
        let Some(mut job) = self.load_job(job_id).await? else {
            debug!(job_id, "job record missing, dropping id");
            return Ok(());
        };

        let mode = match Self::validate(&job) {
            Ok(mode) => mode,
            Err(code) => {
                job.status = JobStatus::Failed;
                job.last_error = Some(code.to_string());
                self.save_job(job_id, &job).await?;
                self.stats.failed.fetch_add(1, Ordering::Relaxed);
                return Ok(());
            }
        };

        job.status = JobStatus::Routing;
        self.save_job(job_id, &job).await?;

        let total = job.contacts.len() as i64;
        let _ = self
            .kv
            .set_nx_ex(&format!("job:stats:{}:total", job_id), &total.to_string(), self.job_stats_ttl_seconds)
            .await?;
        let _ = self
            .kv
            .set_nx_ex(&format!("job:stats:{}:sent", job_id), "0", self.job_stats_ttl_seconds)
            .await?;
        let _ = self
            .kv
            .set_nx_ex(&format!("job:stats:{}:failed", job_id), "0", self.job_stats_ttl_seconds)
            .await?;

        let sessions = self.orchestrator.get_sessions_cached().await;
        if sessions.is_empty() {
            job.status = JobStatus::Queued;
            job.last_error = Some(NO_SESSIONS_AVAILABLE.to_string());
            self.save_job(job_id, &job).await?;

            let due_at = chrono::Utc::now().timestamp_millis() + clamp_retry_delay_ms(self.retry_delay_ms) as i64;
            self.kv.zadd(RETRY_ZSET, job_id, due_at as f64).await?;
            return Ok(());
        }

        let now = chrono::Utc::now().timestamp_millis();
        for (i, contact) in job.contacts.iter().enumerate() {
            let task = Task {
                task_id: format!("{}:{}", job_id, i),
                job_id: job_id.to_string(),
                mode,
                to: contact.phone.clone(),
                name: contact.name.clone(),
                text: if mode == JobMode::Message { job.message.clone() } else { None },
                media_ref: if mode == JobMode::Image { job.media_ref.clone() } else { None },
                media_path: job.media_path.clone(),
                created_at: now,
                retry_count: 0,
            };

            let session = self
                .router
                .select(&sessions, &contact.phone, &RoutingHints::default(), RoutingStrategy::Sticky)?;

            let session_queue_key = self.queues.session_queue_key(&contact.phone);
            let payload = serde_json::to_string(&task)?;
            self.kv.lpush(&session_queue_key, &payload).await?;
            self.kv.expire(&session_queue_key, 24 * 60 * 60).await?;

            let routed_key = format!("metrics:session:{}:routed60s", session.session_id);
            let _ = self.kv.incr(&routed_key).await;
            let _ = self.kv.expire(&routed_key, 60).await;
        }

        job.status = JobStatus::Routed;
        job.routed_at = Some(now);
        job.routed_count = Some(total as u32);
        self.save_job(job_id, &job).await?;
        self.stats.routed.fetch_add(total as u64, Ordering::Relaxed);

        Ok(())
    }
}

/// Attempt to finalize a job once its task accounting is complete: when
/// `sent + failed == total`, append `JOB_DONE`/`JOB_DONE_WITH_ERRORS`
/// exactly once, guarded by the `doneEmitted` set-if-absent key.
pub async fn try_finalize(
    kv: &KvClient,
    incidents: &IncidentSink,
    job_id: &str,
) -> Result<(), DispatcherError> {
    let total: i64 = kv.get(&format!("job:stats:{}:total", job_id)).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
    let sent: i64 = kv.get(&format!("job:stats:{}:sent", job_id)).await?.and_then(|v| v.parse().ok()).unwrap_or(0);
    let failed: i64 = kv.get(&format!("job:stats:{}:failed", job_id)).await?.and_then(|v| v.parse().ok()).unwrap_or(0);

    if total == 0 || sent + failed < total {
        return Ok(());
    }

    let guard_key = format!("job:stats:{}:doneEmitted", job_id);
    if !kv.set_nx(&guard_key, "1").await? {
        return Ok(());
    }

    let status = if failed == 0 { "DONE" } else { "DONE_WITH_ERRORS" };

    if let Some(raw) = kv.get(&format!("job:{}", job_id)).await? {
        if let Ok(mut job) = serde_json::from_str::<Job>(&raw) {
            job.status = if failed == 0 { JobStatus::Done } else { JobStatus::DoneWithErrors };
            job.done_at = Some(chrono::Utc::now().timestamp_millis());
            job.sent_count = Some(sent as u32);
            job.failed_count = Some(failed as u32);
            if let Ok(updated) = serde_json::to_string(&job) {
                let _ = kv.set(&format!("job:{}", job_id), &updated).await;
            }
        }
    }

    incidents
        .push_job_event(json!({
            "type": if failed == 0 { "JOB_DONE" } else { "JOB_DONE_WITH_ERRORS" },
            "jobId": job_id,
            "status": status,
            "sentCount": sent,
            "failedCount": failed,
            "ts": chrono::Utc::now().timestamp_millis(),
        }))
        .await;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Contact;

    fn base_job(mode: &str) -> Job {
        Job {
            mode: mode.to_string(),
            message: None,
            media_ref: None,
            media_path: None,
            contacts: vec![Contact { name: Some("A".to_string()), phone: "1".to_string() }],
            status: JobStatus::Queued,
            routed_at: None,
            done_at: None,
            last_error: None,
            routed_count: None,
            sent_count: None,
            failed_count: None,
            extra: Default::default(),
        }
    }

    #[test]
    fn validate_rejects_empty_contacts() {
        let mut job = base_job("message");
        job.contacts.clear();
        job.message = Some("hi".to_string());
        assert_eq!(IntakeLoop::validate(&job), Err(invalid::CONTACTS));
    }

    #[test]
    fn validate_rejects_empty_message() {
        let job = base_job("message");
        assert_eq!(IntakeLoop::validate(&job), Err(invalid::MESSAGE));
    }

    #[test]
    fn validate_rejects_missing_media_ref() {
        let job = base_job("image");
        assert_eq!(IntakeLoop::validate(&job), Err(invalid::MEDIA_REF));
    }

    #[test]
    fn validate_rejects_unknown_mode() {
        let mut job = base_job("voice");
        job.message = Some("hi".to_string());
        assert_eq!(IntakeLoop::validate(&job), Err(invalid::MODE));
    }

    #[test]
    fn validate_accepts_well_formed_message_job() {
        let mut job = base_job("message");
        job.message = Some("hi".to_string());
        assert_eq!(IntakeLoop::validate(&job), Ok(JobMode::Message));
    }

    #[test]
    fn validate_accepts_well_formed_image_job() {
        let mut job = base_job("image");
        job.media_ref = Some("media-1".to_string());
        assert_eq!(IntakeLoop::validate(&job), Ok(JobMode::Image));
    }
}
