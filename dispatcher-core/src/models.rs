//! Domain types shared across intake, routing and session consumers.

use serde::{Deserialize, Serialize};

/// One recipient of a job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contact {
    pub name: Option<String>,
    pub phone: String,
}

/// The payload mode of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobMode {
    Message,
    Image,
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobStatus {
    #[serde(rename = "QUEUED")]
    Queued,
    #[serde(rename = "ROUTING")]
    Routing,
    #[serde(rename = "ROUTED")]
    Routed,
    #[serde(rename = "DONE")]
    Done,
    #[serde(rename = "DONE_WITH_ERRORS")]
    DoneWithErrors,
    #[serde(rename = "FAILED")]
    Failed,
}

/// A job record as stored at `job:<jobId>`. Unknown fields are preserved via
/// `extra` so a rewrite never drops data the Gateway wrote.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    /// Raw mode string as the Gateway wrote it. Kept as a string rather than
    /// `JobMode` so a value outside `{"message", "image"}` deserializes
    /// successfully and is rejected by intake validation as `INVALID_MODE`,
    /// instead of failing the whole job record's JSON parse.
    pub mode: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaRef")]
    pub media_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaPath")]
    pub media_path: Option<String>,
    pub contacts: Vec<Contact>,
    pub status: JobStatus,
    #[serde(skip_serializing_if = "Option::is_none", rename = "routedAt")]
    pub routed_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "doneAt")]
    pub done_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "lastError")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "routedCount")]
    pub routed_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "sentCount")]
    pub sent_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "failedCount")]
    pub failed_count: Option<u32>,
    /// Fields not modeled above, round-tripped unchanged.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Job {
    /// Parse `mode` into the closed `JobMode` enum, or `None` if it's
    /// anything other than `"message"`/`"image"`.
    pub fn parsed_mode(&self) -> Option<JobMode> {
        match self.mode.as_str() {
            "message" => Some(JobMode::Message),
            "image" => Some(JobMode::Image),
            _ => None,
        }
    }
}

/// Validation failure codes recorded as `job.lastError` on intake.
pub mod invalid {
    pub const CONTACTS: &str = "INVALID_CONTACTS";
    pub const MODE: &str = "INVALID_MODE";
    pub const MESSAGE: &str = "INVALID_MESSAGE";
    pub const MEDIA_REF: &str = "INVALID_MEDIA_REF";
}

pub const NO_SESSIONS_AVAILABLE: &str = "NO_SESSIONS_AVAILABLE";

/// A routed unit of work, the payload pushed onto `queue:session:<phone>`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    #[serde(rename = "taskId")]
    pub task_id: String,
    #[serde(rename = "jobId")]
    pub job_id: String,
    pub mode: JobMode,
    pub to: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaRef")]
    pub media_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none", rename = "mediaPath")]
    pub media_path: Option<String>,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(rename = "retryCount")]
    pub retry_count: u32,
}

/// Connection status of a session as reported by the orchestrator roster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SessionStatus {
    Connected,
    Disconnected,
    Connecting,
}

/// A session descriptor, as returned by the orchestrator's session roster.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDescriptor {
    #[serde(rename = "sessionId")]
    pub session_id: String,
    pub phone: String,
    pub status: SessionStatus,
    #[serde(rename = "createdAt")]
    pub created_at: i64,
    #[serde(default, rename = "messageCount")]
    pub message_count: Option<u64>,
    #[serde(default, rename = "recentErrors")]
    pub recent_errors: Option<u32>,
    #[serde(default, rename = "lastPing")]
    pub last_ping: Option<i64>,
    #[serde(default)]
    pub banned: Option<bool>,
    #[serde(default, rename = "rateLimited")]
    pub rate_limited: Option<bool>,
}

impl SessionDescriptor {
    pub fn is_healthy(&self) -> bool {
        self.status == SessionStatus::Connected
            && !self.banned.unwrap_or(false)
            && !self.rate_limited.unwrap_or(false)
    }
}

/// Preferred-session routing hints carried on the originating job, if any.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RoutingHints {
    #[serde(rename = "preferredSession")]
    pub preferred_session: Option<String>,
    #[serde(rename = "fromNumber")]
    pub from_number: Option<String>,
}
