//! Control API: a thin axum surface for inspection and live control. Every
//! handler is idempotent and returns `{status:"ok", ...}` or
//! `{status:"error", reason}`.

use crate::incidents::IncidentSink;
use crate::intake::IntakeStats;
use crate::kv::KvClient;
use crate::pacer::PacerConfig;
use crate::session::SessionRuntime;
use crate::smartguard::SmartGuard;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Allowed explicit RPM values for `POST /sessions/:sessionId/rpm`.
const ALLOWED_RPMS: [u32; 6] = [2, 3, 5, 10, 15, 20];

#[derive(Clone)]
pub struct AppState {
    pub kv: KvClient,
    pub queues: dispatcher_config::queues::QueueConfig,
    pub incidents: Arc<IncidentSink>,
    pub smartguard: Arc<SmartGuard>,
    pub smartguard_tick_ms: u64,
    pub sessions: Arc<SessionRuntime>,
    pub intake_stats: Arc<IntakeStats>,
    pub running: Arc<AtomicBool>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/healthz", get(health))
        .route("/ready", get(ready))
        .route("/start", post(start))
        .route("/stop", post(stop))
        .route("/queue/status", get(queue_status))
        .route("/pacers", get(list_pacers))
        .route("/pacers/{sessionId}", post(update_pacer))
        .route("/sessions/{sessionId}/rpm", post(set_session_rpm))
        .route("/sessions/metrics", get(session_metrics))
        .route("/smartguard/status", get(smartguard_status))
        .route("/smartguard/enable", post(smartguard_enable))
        .route("/incidents", get(incidents))
        .route("/metrics", get(prometheus_metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn ok(body: Value) -> Json<Value> {
    let mut map = match body {
        Value::Object(m) => m,
        _ => serde_json::Map::new(),
    };
    map.insert("status".to_string(), json!("ok"));
    Json(Value::Object(map))
}

fn err(status: StatusCode, reason: impl Into<String>) -> Response {
    (status, Json(json!({ "status": "error", "reason": reason.into() }))).into_response()
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    ok(json!({
        "running": state.running.load(Ordering::SeqCst),
        "stats": {
            "processed": state.intake_stats.processed.load(Ordering::Relaxed),
            "routed": state.intake_stats.routed.load(Ordering::Relaxed),
            "failed": state.intake_stats.failed.load(Ordering::Relaxed),
            "activePacers": state.sessions.active_session_ids().await.len(),
        }
    }))
}

async fn ready(State(state): State<AppState>) -> Response {
    match state.kv.ping().await {
        Ok(()) => ok(json!({ "checks": { "redis": "ok" } })).into_response(),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "status": "not_ready", "checks": { "redis": e.to_string() } })),
        )
            .into_response(),
    }
}

async fn start(State(state): State<AppState>) -> Json<Value> {
    state.running.store(true, Ordering::SeqCst);
    ok(json!({}))
}

async fn stop(State(state): State<AppState>) -> Json<Value> {
    state.running.store(false, Ordering::SeqCst);
    ok(json!({}))
}

async fn queue_status(State(state): State<AppState>) -> Response {
    let gateway = state.kv.llen(&state.queues.gateway_queue_key).await;
    let priority = state.kv.llen(&state.queues.priority_queue_key).await;
    let retry = state.kv.zcard("queue:retry").await;
    let session_retry = state.kv.zcard("queue:retry:session").await;

    match (gateway, priority, retry, session_retry) {
        (Ok(gateway), Ok(priority), Ok(retry), Ok(session_retry)) => ok(json!({
            "gateway": gateway,
            "priority": priority,
            "retry": retry,
            "sessionRetry": session_retry,
            "total": gateway + priority + retry + session_retry,
        }))
        .into_response(),
        _ => err(StatusCode::INTERNAL_SERVER_ERROR, "failed to read queue lengths"),
    }
}

async fn list_pacers(State(state): State<AppState>) -> Json<Value> {
    let stats = state.sessions.all_pacer_stats().await;
    let entries: Vec<Value> = stats
        .into_iter()
        .map(|(session_id, s)| json!({ "sessionId": session_id, "pacer": s }))
        .collect();
    ok(json!({ "pacers": entries }))
}

#[derive(Debug, Deserialize, Default)]
struct PacerUpdateBody {
    #[serde(rename = "minDelayMs")]
    min_delay_ms: Option<u64>,
    #[serde(rename = "maxDelayMs")]
    max_delay_ms: Option<u64>,
    #[serde(rename = "burstLimit")]
    burst_limit: Option<u32>,
    #[serde(rename = "burstCooldownMs")]
    burst_cooldown_ms: Option<u64>,
    rpm: Option<f64>,
}

async fn update_pacer(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<PacerUpdateBody>,
) -> Response {
    let Some(pacer) = state.sessions.pacer_for(&session_id).await else {
        return err(StatusCode::NOT_FOUND, "no active consumer for session");
    };

    let mut guard = pacer.lock().await;
    let current = guard.stats();
    guard.update_config(PacerConfig {
        min_delay_ms: body.min_delay_ms.unwrap_or(current.min_delay_ms),
        max_delay_ms: body.max_delay_ms.unwrap_or(current.max_delay_ms),
        rpm: body.rpm.or(current.rpm),
        burst_limit: body.burst_limit.unwrap_or(current.burst_limit),
        burst_cooldown_ms: body.burst_cooldown_ms.unwrap_or(current.burst_cooldown_ms),
    });
    let updated = guard.stats();
    drop(guard);

    ok(json!({ "pacer": updated })).into_response()
}

#[derive(Debug, Deserialize)]
struct RpmBody {
    rpm: Option<f64>,
}

async fn set_session_rpm(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Json(body): Json<RpmBody>,
) -> Response {
    if let Some(rpm) = body.rpm {
        let is_allowed = rpm.fract() == 0.0 && ALLOWED_RPMS.contains(&(rpm as u32));
        if !is_allowed {
            return err(StatusCode::BAD_REQUEST, "rpm must be one of 2, 3, 5, 10, 15, 20, or null");
        }
    }

    let key = format!("config:session:{}:rpm", session_id);
    let write = match body.rpm {
        Some(rpm) => state.kv.set(&key, &rpm.to_string()).await,
        None => state.kv.del(&key).await,
    };
    if let Err(e) = write {
        return err(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    if let Some(pacer) = state.sessions.pacer_for(&session_id).await {
        if let Err(e) = pacer.lock().await.set_rpm(body.rpm) {
            return err(StatusCode::BAD_REQUEST, e.to_string());
        }
    }

    ok(json!({ "sessionId": session_id, "rpm": body.rpm })).into_response()
}

async fn session_metrics(State(state): State<AppState>) -> Json<Value> {
    let mut entries = Vec::new();
    for session_id in state.sessions.active_session_ids().await {
        let queue_len = state.kv.llen(&format!("queue:session:{}", session_id)).await.unwrap_or(0);
        let sent = read_counter(&state.kv, &format!("metrics:session:{}:sent60s", session_id)).await;
        let routed = read_counter(&state.kv, &format!("metrics:session:{}:routed60s", session_id)).await;
        let failed = read_counter(&state.kv, &format!("metrics:session:{}:failed60s", session_id)).await;
        let rpm_override: Option<f64> = state
            .kv
            .get(&format!("config:session:{}:rpm", session_id))
            .await
            .ok()
            .flatten()
            .and_then(|v| v.parse().ok());
        let pacer_stats = match state.sessions.pacer_for(&session_id).await {
            Some(p) => Some(p.lock().await.stats()),
            None => None,
        };
        let trust_level = state.sessions.trust_level_for(&session_id).await;

        entries.push(json!({
            "sessionId": session_id,
            "queueLen": queue_len,
            "sentLast60s": sent,
            "routedLast60s": routed,
            "failedLast60s": failed,
            "rpmOverride": rpm_override,
            "rpmDefault": pacer_stats.as_ref().and_then(|s| s.rpm),
            "trustLevel": trust_level.map(|t| json!({
                "level": t.level,
                "rpm": t.rpm,
                "minDelayMs": t.min_delay_ms,
                "maxDelayMs": t.max_delay_ms,
            })),
        }));
    }
    ok(json!({ "sessions": entries }))
}

async fn read_counter(kv: &KvClient, key: &str) -> i64 {
    kv.get(key).await.ok().flatten().and_then(|v| v.parse().ok()).unwrap_or(0)
}

async fn smartguard_status(State(state): State<AppState>) -> Json<Value> {
    let enabled = state.smartguard.is_enabled().await;
    let last_tick = state.kv.get("smartguard:lastTick").await.ok().flatten();
    let last_action_at = state.kv.get("smartguard:lastActionAt").await.ok().flatten();
    ok(json!({
        "enabled": enabled,
        "tickMs": state.smartguard_tick_ms,
        "lastTick": last_tick,
        "lastActionAt": last_action_at,
    }))
}

#[derive(Debug, Deserialize)]
struct SmartGuardEnableBody {
    enabled: bool,
}

async fn smartguard_enable(
    State(state): State<AppState>,
    Json(body): Json<SmartGuardEnableBody>,
) -> Json<Value> {
    state.smartguard.set_enabled(body.enabled).await;
    ok(json!({ "enabled": body.enabled }))
}

#[derive(Debug, Deserialize)]
struct IncidentsQuery {
    limit: Option<isize>,
}

async fn incidents(State(state): State<AppState>, Query(q): Query<IncidentsQuery>) -> Json<Value> {
    let limit = q.limit.unwrap_or(50).clamp(1, 200);
    let entries = state.incidents.recent_incidents(limit).await;
    ok(json!({ "incidents": entries }))
}

async fn prometheus_metrics() -> Response {
    match crate::metrics::get_metrics_handle() {
        Some(handle) => handle.render().into_response(),
        None => err(StatusCode::SERVICE_UNAVAILABLE, "metrics not yet initialized"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allowed_rpms_match_trust_policy_rungs() {
        assert_eq!(ALLOWED_RPMS, [2, 3, 5, 10, 15, 20]);
    }

    #[test]
    fn ok_envelope_always_carries_status() {
        let body = ok(json!({ "a": 1 }));
        assert_eq!(body.0["status"], "ok");
        assert_eq!(body.0["a"], 1);
    }
}
