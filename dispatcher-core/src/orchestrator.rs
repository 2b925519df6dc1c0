//! Orchestrator client: fetches the connected-session roster (cached) and
//! hands a task off to the orchestrator, either over HTTP or by pushing
//! directly onto its Redis outbox.

use crate::error::DispatcherError;
use crate::kv::KvClient;
use crate::models::{SessionDescriptor, SessionStatus, Task};
use dispatcher_config::orchestrator::{OrchestratorConfig, SendMode};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

#[derive(Debug, Deserialize)]
struct RosterResponse {
    #[allow(dead_code)]
    status: String,
    #[serde(default)]
    sessions: Vec<SessionDescriptor>,
}

#[derive(Debug, Serialize)]
struct EnqueueRequest<'a> {
    #[serde(rename = "messageId")]
    message_id: &'a str,
    to: &'a str,
    mode: crate::models::JobMode,
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaRef")]
    media_ref: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaPath")]
    media_path: Option<&'a str>,
    #[serde(rename = "jobId")]
    job_id: &'a str,
    #[serde(rename = "taskId")]
    task_id: &'a str,
}

/// Outcome of a handoff attempt.
#[derive(Debug)]
pub struct SendOutcome {
    pub success: bool,
    pub message_id: Option<String>,
    pub error: Option<String>,
}

struct CachedRoster {
    sessions: Vec<SessionDescriptor>,
    fetched_at: Instant,
}

/// HTTP + Redis client for the downstream orchestrator.
pub struct OrchestratorClient {
    config: OrchestratorConfig,
    http: reqwest::Client,
    kv: KvClient,
    cache: Mutex<Option<CachedRoster>>,
}

const ROSTER_CACHE_TTL: Duration = Duration::from_millis(5000);

impl OrchestratorClient {
    pub fn new(config: OrchestratorConfig, kv: KvClient) -> Result<Arc<Self>, DispatcherError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(DispatcherError::Http)?;
        Ok(Arc::new(Self {
            config,
            http,
            kv,
            cache: Mutex::new(None),
        }))
    }

    /// Fetch connected sessions from the roster endpoint. On any error,
    /// returns an empty list rather than failing the caller.
    pub async fn get_sessions(&self) -> Vec<SessionDescriptor> {
        match self.fetch_roster().await {
            Ok(sessions) => sessions
                .into_iter()
                .filter(|s| s.status == SessionStatus::Connected)
                .collect(),
            Err(e) => {
                warn!(error = %e, "failed to fetch session roster");
                Vec::new()
            }
        }
    }

    /// Cached variant of `get_sessions`, memoizing the last successful
    /// result for `ttl` (spec default 5000 ms).
    pub async fn get_sessions_cached(&self) -> Vec<SessionDescriptor> {
        {
            let cache = self.cache.lock().await;
            if let Some(c) = cache.as_ref() {
                if c.fetched_at.elapsed() < ROSTER_CACHE_TTL {
                    return c.sessions.clone();
                }
            }
        }

        let sessions = self.get_sessions().await;
        if !sessions.is_empty() {
            let mut cache = self.cache.lock().await;
            *cache = Some(CachedRoster {
                sessions: sessions.clone(),
                fetched_at: Instant::now(),
            });
        }
        sessions
    }

    async fn fetch_roster(&self) -> Result<Vec<SessionDescriptor>, DispatcherError> {
        let url = format!("{}/api/dashboard/sessions", self.config.base_url);
        let resp: RosterResponse = self
            .http
            .get(url)
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await
            .map_err(DispatcherError::Http)?
            .error_for_status()
            .map_err(DispatcherError::Http)?
            .json()
            .await
            .map_err(DispatcherError::Http)?;
        Ok(resp.sessions)
    }

    /// Hand a task off to the orchestrator, via HTTP enqueue or a direct
    /// Redis push, depending on configured send mode.
    pub async fn send_via_orchestrator(&self, session_id: &str, task: &Task) -> SendOutcome {
        match self.config.send_mode {
            SendMode::Api => self.send_via_api(session_id, task).await,
            SendMode::Redis => self.send_via_redis(session_id, task).await,
        }
    }

    async fn send_via_api(&self, session_id: &str, task: &Task) -> SendOutcome {
        let url = format!(
            "{}/api/sessions/{}/outbox/enqueue",
            self.config.base_url, session_id
        );
        let body = EnqueueRequest {
            message_id: &task.task_id,
            to: &task.to,
            mode: task.mode,
            text: task.text.as_deref(),
            media_ref: task.media_ref.as_deref(),
            media_path: task.media_path.as_deref(),
            job_id: &task.job_id,
            task_id: &task.task_id,
        };

        let result = self
            .http
            .post(url)
            .header("X-API-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await;

        match result {
            Ok(resp) if resp.status().is_success() => SendOutcome {
                success: true,
                message_id: Some(task.task_id.clone()),
                error: None,
            },
            Ok(resp) => SendOutcome {
                success: false,
                message_id: None,
                error: Some(format!("orchestrator returned {}", resp.status())),
            },
            Err(e) => SendOutcome {
                success: false,
                message_id: None,
                error: Some(e.to_string()),
            },
        }
    }

    async fn send_via_redis(&self, session_id: &str, task: &Task) -> SendOutcome {
        let key = format!("session:outbox:{}", session_id);
        let payload = match serde_json::to_string(task) {
            Ok(p) => p,
            Err(e) => {
                return SendOutcome { success: false, message_id: None, error: Some(e.to_string()) }
            }
        };

        match self.kv.lpush(&key, &payload).await {
            Ok(_) => {
                let _ = self.kv.expire(&key, 3600).await;
                SendOutcome {
                    success: true,
                    message_id: Some(task.task_id.clone()),
                    error: None,
                }
            }
            Err(e) => SendOutcome { success: false, message_id: None, error: Some(e.to_string()) },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enqueue_request_serializes_camel_case() {
        let task = Task {
            task_id: "job1:0".to_string(),
            job_id: "job1".to_string(),
            mode: crate::models::JobMode::Message,
            to: "972500000001".to_string(),
            name: None,
            text: Some("hi".to_string()),
            media_ref: None,
            media_path: None,
            created_at: 0,
            retry_count: 0,
        };
        let req = EnqueueRequest {
            message_id: &task.task_id,
            to: &task.to,
            mode: task.mode,
            text: task.text.as_deref(),
            media_ref: None,
            media_path: None,
            job_id: &task.job_id,
            task_id: &task.task_id,
        };
        let json = serde_json::to_string(&req).unwrap();
        assert!(json.contains("\"messageId\""));
        assert!(json.contains("\"jobId\""));
        assert!(!json.contains("mediaRef"));
    }
}
