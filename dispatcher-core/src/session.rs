//! Per-session consumers, the 5-second connected-session reconciler, and
//! the 1-second session-retry drain. Each session gets its own pacer and
//! its own consumer task; the reconciler starts and stops those tasks as
//! sessions connect and disconnect, and applies SmartGuard's RPM override
//! on every loop iteration.

use crate::error::clamp_retry_delay_ms;
use crate::incidents::IncidentSink;
use crate::intake::try_finalize;
use crate::models::{SessionDescriptor, SessionStatus, Task};
use crate::orchestrator::OrchestratorClient;
use crate::pacer::Pacer;
use crate::trust::{self, TrustLevel};
use crate::kv::KvClient;
use dispatcher_config::queues::QueueConfig;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const RETRY_SESSION_ZSET: &str = "queue:retry:session";
const RETRY_DRAIN_BATCH: isize = 25;
const CONSUMER_POP_TIMEOUT: Duration = Duration::from_secs(2);
const RECONCILE_INTERVAL: Duration = Duration::from_secs(5);
const RETRY_DRAIN_INTERVAL: Duration = Duration::from_secs(1);
const METRIC_WINDOW_SECONDS: i64 = 60;

/// Shared dependencies handed to every session consumer.
#[derive(Clone)]
pub struct SessionDeps {
    pub kv: KvClient,
    pub queues: QueueConfig,
    pub orchestrator: Arc<OrchestratorClient>,
    pub incidents: Arc<IncidentSink>,
    pub burst_limit: u32,
    pub burst_cooldown_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

struct ConsumerHandle {
    running: Arc<AtomicBool>,
    join: JoinHandle<()>,
    pacer: Arc<Mutex<Pacer>>,
    trust_level: TrustLevel,
}

/// Tracks the set of active per-session consumer tasks and reconciles it
/// against the connected-session roster. Each consumer's pacer is shared
/// via `Arc<Mutex<>>` so the control API can read or mutate it live.
pub struct SessionRuntime {
    deps: SessionDeps,
    consumers: Mutex<HashMap<String, ConsumerHandle>>,
}

impl SessionRuntime {
    pub fn new(deps: SessionDeps) -> Self {
        Self { deps, consumers: Mutex::new(HashMap::new()) }
    }

    pub async fn active_session_ids(&self) -> Vec<String> {
        self.consumers.lock().await.keys().cloned().collect()
    }

    /// Fetch the shared pacer for a session, if a consumer is running for it.
    pub async fn pacer_for(&self, session_id: &str) -> Option<Arc<Mutex<Pacer>>> {
        self.consumers.lock().await.get(session_id).map(|h| h.pacer.clone())
    }

    /// Snapshot `{sessionId: PacerStats}` for every active consumer.
    pub async fn all_pacer_stats(&self) -> Vec<(String, crate::pacer::PacerStats)> {
        let consumers = self.consumers.lock().await;
        let mut out = Vec::with_capacity(consumers.len());
        for (id, handle) in consumers.iter() {
            out.push((id.clone(), handle.pacer.lock().await.stats()));
        }
        out
    }

    /// Trust level computed at consumer-spawn time for a session, if a
    /// consumer is running for it.
    pub async fn trust_level_for(&self, session_id: &str) -> Option<TrustLevel> {
        self.consumers.lock().await.get(session_id).map(|h| h.trust_level)
    }

    /// Run the 5-second reconciler for as long as the process lives. While
    /// `running` is cleared (via `POST /stop`) every consumer is stopped and
    /// the reconciler idles; setting it again via `POST /start` resumes
    /// normal reconciliation on the next tick. The task itself only ends
    /// when aborted at process shutdown.
    pub async fn run_reconciler(&self, running: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(RECONCILE_INTERVAL);
        loop {
            interval.tick().await;
            if running.load(Ordering::SeqCst) {
                let sessions = self.deps.orchestrator.get_sessions_cached().await;
                self.reconcile(&sessions).await;
            } else {
                self.stop_all().await;
            }
        }
    }

    async fn reconcile(&self, sessions: &[SessionDescriptor]) {
        let connected: HashMap<&str, &SessionDescriptor> = sessions
            .iter()
            .filter(|s| s.status == SessionStatus::Connected)
            .map(|s| (s.session_id.as_str(), s))
            .collect();

        let mut consumers = self.consumers.lock().await;

        let stale: Vec<String> = consumers
            .keys()
            .filter(|id| !connected.contains_key(id.as_str()))
            .cloned()
            .collect();
        for id in stale {
            if let Some(handle) = consumers.remove(&id) {
                handle.running.store(false, Ordering::SeqCst);
                handle.join.abort();
                info!(session_id = %id, "stopped consumer for disconnected session");
            }
        }

        for (id, session) in connected {
            if consumers.contains_key(id) {
                continue;
            }
            let base = trust::level_for_created_at(session.created_at, chrono::Utc::now().timestamp_millis());
            let pacer = Arc::new(Mutex::new(Pacer::new(
                base.pacer_defaults(self.deps.burst_limit, self.deps.burst_cooldown_ms),
            )));
            let running = Arc::new(AtomicBool::new(true));
            let join = spawn_consumer(
                (*session).clone(),
                self.deps.clone(),
                pacer.clone(),
                running.clone(),
            );
            info!(session_id = %id, "started consumer for connected session");
            consumers.insert(id.to_string(), ConsumerHandle { running, join, pacer, trust_level: base });
        }

        crate::metrics::set_active_pacers(consumers.len() as f64);
    }

    async fn stop_all(&self) {
        let mut consumers = self.consumers.lock().await;
        for (_, handle) in consumers.drain() {
            handle.running.store(false, Ordering::SeqCst);
            handle.join.abort();
        }
    }

    /// Run the 1-second session-retry drain for as long as the process
    /// lives, skipping ticks while `running` is cleared.
    pub async fn run_retry_drain(&self, kv: KvClient, running: Arc<AtomicBool>) {
        let mut interval = tokio::time::interval(RETRY_DRAIN_INTERVAL);
        loop {
            interval.tick().await;
            if running.load(Ordering::SeqCst) {
                drain_session_retries(&kv, &self.deps.queues).await;
            }
        }
    }
}

async fn drain_session_retries(kv: &KvClient, queues: &QueueConfig) {
    let now = chrono::Utc::now().timestamp_millis() as f64;
    let due = match kv.zpop_due(RETRY_SESSION_ZSET, now, RETRY_DRAIN_BATCH).await {
        Ok(due) => due,
        Err(e) => {
            warn!(error = %e, "failed to drain session retry queue");
            return;
        }
    };
    for payload in due {
        let Ok(task) = serde_json::from_str::<Task>(&payload) else {
            warn!("dropping unparsable session retry entry");
            continue;
        };
        let key = queues.session_queue_key(&task.to);
        if let Err(e) = kv.lpush(&key, &payload).await {
            warn!(error = %e, task_id = %task.task_id, "failed to re-queue retried task");
            continue;
        }
        let _ = kv.expire(&key, 24 * 60 * 60).await;
    }
}

fn spawn_consumer(
    session: SessionDescriptor,
    deps: SessionDeps,
    pacer: Arc<Mutex<Pacer>>,
    running: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let rpm_key = format!("config:session:{}:rpm", session.session_id);

        while running.load(Ordering::SeqCst) {
            if let Ok(Some(raw)) = deps.kv.get(&rpm_key).await {
                if let Ok(rpm) = raw.parse::<f64>() {
                    let _ = pacer.lock().await.set_rpm(Some(rpm));
                }
            }

            let queue_key = deps.queues.session_queue_key(&session.phone);
            let popped = match deps.kv.blocking_rpop(&queue_key, CONSUMER_POP_TIMEOUT).await {
                Ok(v) => v,
                Err(e) => {
                    warn!(error = %e, session_id = %session.session_id, "blocking pop failed");
                    tokio::time::sleep(Duration::from_millis(500)).await;
                    continue;
                }
            };

            let Some(raw_task) = popped else {
                continue;
            };

            let task: Task = match serde_json::from_str(&raw_task) {
                Ok(t) => t,
                Err(e) => {
                    warn!(error = %e, "dropping unparsable task payload");
                    continue;
                }
            };

            pacer.lock().await.wait_for_slot().await;

            let timer = crate::metrics::MetricsTimer::new(session.session_id.clone());
            let outcome = deps.orchestrator.send_via_orchestrator(&session.session_id, &task).await;
            pacer.lock().await.record_send();
            drop(timer);

            if outcome.success {
                handle_success(&deps, &session, &task).await;
            } else {
                handle_failure(&deps, &session, task, outcome.error.unwrap_or_default()).await;
            }
        }
    })
}

async fn bump_window_counter(kv: &KvClient, key: &str) {
    let _ = kv.incr(key).await;
    let _ = kv.expire(key, METRIC_WINDOW_SECONDS).await;
}

async fn handle_success(deps: &SessionDeps, session: &SessionDescriptor, task: &Task) {
    bump_window_counter(&deps.kv, &format!("metrics:session:{}:sent60s", session.session_id)).await;

    let guard_key = format!("job:taskStatus:{}", task.task_id);
    match deps.kv.set_nx(&guard_key, "SENT").await {
        Ok(true) => {
            let _ = deps.kv.incr(&format!("job:stats:{}:sent", task.job_id)).await;
            crate::metrics::record_job_processed(crate::metrics::JobStatus::Done);
            if let Err(e) = try_finalize(&deps.kv, &deps.incidents, &task.job_id).await {
                warn!(error = %e, job_id = %task.job_id, "failed to finalize job after success");
            }
        }
        Ok(false) => {
            debug!(task_id = %task.task_id, "task already accounted for, skipping duplicate sent count");
        }
        Err(e) => {
            warn!(error = %e, task_id = %task.task_id, "failed to set taskStatus guard after success");
        }
    }

    debug!(session_id = %session.session_id, task_id = %task.task_id, "sent");
}

async fn handle_failure(deps: &SessionDeps, session: &SessionDescriptor, mut task: Task, error: String) {
    bump_window_counter(&deps.kv, &format!("metrics:session:{}:failed60s", session.session_id)).await;
    crate::metrics::record_error(crate::metrics::ErrorType::Transient);

    if task.retry_count < deps.max_retries {
        task.retry_count += 1;
        crate::metrics::record_retry(&session.session_id);
        let delay_ms = clamp_retry_delay_ms(deps.retry_delay_ms);
        let due_at = chrono::Utc::now().timestamp_millis() + delay_ms as i64;
        if let Ok(payload) = serde_json::to_string(&task) {
            if let Err(e) = deps.kv.zadd(RETRY_SESSION_ZSET, &payload, due_at as f64).await {
                warn!(error = %e, task_id = %task.task_id, "failed to schedule task retry");
            }
        }
        deps.incidents
            .push_incident(
                "SEND_RETRY_SCHEDULED",
                json!({
                    "sessionId": session.session_id,
                    "taskId": task.task_id,
                    "jobId": task.job_id,
                    "attempt": task.retry_count,
                    "error": error,
                }),
            )
            .await;
        return;
    }

    let guard_key = format!("job:taskStatus:{}", task.task_id);
    match deps.kv.set_nx(&guard_key, "FAILED").await {
        Ok(true) => {
            let _ = deps.kv.incr(&format!("job:stats:{}:failed", task.job_id)).await;
            crate::metrics::record_job_processed(crate::metrics::JobStatus::Failed);
        }
        Ok(false) => {
            debug!(task_id = %task.task_id, "task already accounted for, skipping duplicate failed count");
        }
        Err(e) => {
            warn!(error = %e, task_id = %task.task_id, "failed to set taskStatus guard after terminal failure");
        }
    }

    deps.incidents
        .push_incident(
            "SEND_FAILED",
            json!({
                "sessionId": session.session_id,
                "taskId": task.task_id,
                "jobId": task.job_id,
                "error": error,
            }),
        )
        .await;

    if let Err(e) = try_finalize(&deps.kv, &deps.incidents, &task.job_id).await {
        warn!(error = %e, job_id = %task.job_id, "failed to finalize job after terminal failure");
    }
}

#[cfg(test)]
mod tests {
    use crate::error::clamp_retry_delay_ms;

    #[test]
    fn retry_count_threshold_matches_configured_max() {
        let max_retries = 3;
        assert!(0 < max_retries);
        assert!(2 < max_retries);
        assert!(!(3 < max_retries));
    }

    #[test]
    fn retry_delay_is_clamped_into_the_configured_window() {
        assert_eq!(clamp_retry_delay_ms(500), 1_000);
        assert_eq!(clamp_retry_delay_ms(60_000), 60_000);
        assert_eq!(clamp_retry_delay_ms(700_000), 600_000);
    }
}
