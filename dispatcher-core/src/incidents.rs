//! Incident log and best-effort Brain event sink. Both are fire-and-forget:
//! a failure to write telemetry must never stall dispatch.

use crate::kv::KvClient;
use serde_json::{json, Value};
use tracing::debug;

const INCIDENTS_KEY: &str = "antiban:incidents";
const INCIDENTS_CAP: isize = 200;
const INCIDENTS_TTL_SECONDS: i64 = 7 * 24 * 60 * 60;

const JOBS_EVENTS_KEY: &str = "jobs:events";
const JOBS_EVENTS_CAP: isize = 2000;

/// Append-only capped incident log plus an optional forward to Brain.
pub struct IncidentSink {
    kv: KvClient,
    http: reqwest::Client,
    brain_url: Option<String>,
}

impl IncidentSink {
    pub fn new(kv: KvClient, brain_url: Option<String>) -> Self {
        Self {
            kv,
            http: reqwest::Client::new(),
            brain_url,
        }
    }

    /// Prepend an incident onto `antiban:incidents`, trimmed to 200 entries
    /// with a refreshed 7-day TTL. Errors are swallowed.
    pub async fn push_incident(&self, kind: &str, mut fields: Value) {
        if let Value::Object(ref mut map) = fields {
            map.insert("type".to_string(), json!(kind));
            map.insert("ts".to_string(), json!(chrono::Utc::now().timestamp_millis()));
        }

        let Ok(payload) = serde_json::to_string(&fields) else {
            return;
        };

        if let Err(e) = self
            .kv
            .push_capped(INCIDENTS_KEY, &payload, INCIDENTS_CAP, INCIDENTS_TTL_SECONDS)
            .await
        {
            debug!(error = %e, "failed to write incident (swallowed)");
        }
    }

    /// Append a `JOB_ACCEPTED` / `JOB_DONE` / `JOB_DONE_WITH_ERRORS` style
    /// event onto `jobs:events`. Errors are swallowed.
    pub async fn push_job_event(&self, event: Value) {
        let Ok(payload) = serde_json::to_string(&event) else {
            return;
        };
        if let Err(e) = self
            .kv
            .push_capped(JOBS_EVENTS_KEY, &payload, JOBS_EVENTS_CAP, INCIDENTS_TTL_SECONDS)
            .await
        {
            debug!(error = %e, "failed to write job event (swallowed)");
        }
    }

    /// Best-effort POST to the Brain analytics sink, if configured.
    pub async fn send_brain_event(&self, event: Value) {
        let Some(base) = &self.brain_url else {
            return;
        };
        let url = format!("{}/event", base);
        if let Err(e) = self.http.post(url).json(&event).send().await {
            debug!(error = %e, "Brain event post failed (swallowed)");
        }
    }

    /// Read the most recent `limit` incidents for the control API.
    pub async fn recent_incidents(&self, limit: isize) -> Vec<Value> {
        match self.kv.lrange(INCIDENTS_KEY, limit).await {
            Ok(raw) => raw.into_iter().filter_map(|s| serde_json::from_str(&s).ok()).collect(),
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incident_payload_carries_type_and_timestamp() {
        let mut fields = json!({"sessionId": "s1"});
        if let Value::Object(ref mut map) = fields {
            map.insert("type".to_string(), json!("SEND_FAILED"));
            map.insert("ts".to_string(), json!(1234));
        }
        assert_eq!(fields["type"], "SEND_FAILED");
        assert_eq!(fields["sessionId"], "s1");
    }
}
