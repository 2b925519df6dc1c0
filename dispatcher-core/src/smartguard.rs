//! SmartGuard: the periodic auto-tuner that narrows a session's RPM under
//! failure and widens it under stability, never exceeding the session's
//! trust baseline.

use crate::incidents::IncidentSink;
use crate::kv::KvClient;
use crate::models::SessionDescriptor;
use crate::orchestrator::OrchestratorClient;
use crate::trust;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

const RUNGS: [u32; 4] = [5, 10, 15, 20];

fn nearest_rung(rpm: f64) -> u32 {
    RUNGS
        .iter()
        .copied()
        .min_by(|a, b| {
            (*a as f64 - rpm).abs().partial_cmp(&(*b as f64 - rpm).abs()).unwrap()
        })
        .unwrap_or(RUNGS[0])
}

fn lower_rung(current: u32) -> u32 {
    RUNGS.iter().rev().copied().find(|&r| r < current).unwrap_or(current)
}

fn raise_rung(current: u32) -> u32 {
    RUNGS.iter().copied().find(|&r| r > current).unwrap_or(current)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Lower,
    Raise,
    Hold,
}

struct SessionTickMetrics {
    qlen: i64,
    sent60s: i64,
    routed60s: i64,
    failed60s: i64,
}

/// SmartGuard's periodic control loop. A re-entrancy flag prevents
/// overlapping ticks if a tick runs long.
pub struct SmartGuard {
    kv: KvClient,
    orchestrator: Arc<OrchestratorClient>,
    incidents: Arc<IncidentSink>,
    ticking: AtomicBool,
}

impl SmartGuard {
    pub fn new(kv: KvClient, orchestrator: Arc<OrchestratorClient>, incidents: Arc<IncidentSink>) -> Self {
        Self { kv, orchestrator, incidents, ticking: AtomicBool::new(false) }
    }

    pub async fn is_enabled(&self) -> bool {
        match self.kv.get("config:smartguard:enabled").await {
            Ok(Some(v)) => v == "true",
            _ => true,
        }
    }

    /// Seed `config:smartguard:enabled` from the startup config if the key
    /// is not already present, so `SMART_GUARD_ENABLED=false` actually takes
    /// effect on a fresh deployment instead of `is_enabled()` defaulting to
    /// `true` on an absent key.
    pub async fn seed_enabled_if_absent(&self, enabled: bool) -> Result<(), crate::error::DispatcherError> {
        self.kv
            .set_nx("config:smartguard:enabled", if enabled { "true" } else { "false" })
            .await?;
        Ok(())
    }

    pub async fn set_enabled(&self, enabled: bool) {
        let _ = self.kv.set("config:smartguard:enabled", if enabled { "true" } else { "false" }).await;
        self.incidents
            .push_incident("SMART_GUARD_TOGGLE", json!({ "enabled": enabled }))
            .await;
    }

    /// Run one tick: inspect each connected session and adjust its RPM
    /// override. Skips if already ticking or if disabled.
    pub async fn tick(&self) {
        if !self.is_enabled().await {
            return;
        }
        if self.ticking.swap(true, Ordering::SeqCst) {
            debug!("SmartGuard tick already in progress, skipping");
            return;
        }

        let now = chrono::Utc::now().timestamp_millis();
        let _ = self.kv.set("smartguard:lastTick", &now.to_string()).await;

        let sessions = self.orchestrator.get_sessions_cached().await;
        for session in &sessions {
            if let Err(e) = self.tick_session(session).await {
                error!(error = %e, session_id = %session.session_id, "SmartGuard tick failed for session");
                self.incidents
                    .push_incident(
                        "SMART_GUARD_ERROR",
                        json!({ "sessionId": session.session_id, "error": e.to_string() }),
                    )
                    .await;
            }
        }

        self.ticking.store(false, Ordering::SeqCst);
    }

    async fn tick_session(&self, session: &SessionDescriptor) -> Result<(), crate::error::DispatcherError> {
        let metrics = self.read_metrics(session).await?;
        let base = trust::level_for_created_at(session.created_at, chrono::Utc::now().timestamp_millis());

        let override_rpm: Option<f64> = self
            .kv
            .get(&format!("config:session:{}:rpm", session.session_id))
            .await?
            .and_then(|v| v.parse().ok());

        let current_rpm = override_rpm.unwrap_or(base.rpm as f64);
        let current_rung = nearest_rung(current_rpm);

        let decision = if metrics.failed60s >= 3 {
            Decision::Lower
        } else if metrics.failed60s == 0 && metrics.qlen <= 2 && metrics.sent60s > 0 {
            Decision::Raise
        } else {
            Decision::Hold
        };

        let proposed = match decision {
            Decision::Lower => lower_rung(current_rung),
            Decision::Raise => raise_rung(current_rung).min(base.rpm),
            Decision::Hold => current_rung,
        };

        if proposed == current_rung {
            return Ok(());
        }

        self.kv
            .set(&format!("config:session:{}:rpm", session.session_id), &proposed.to_string())
            .await?;
        let now = chrono::Utc::now().timestamp_millis();
        self.kv.set("smartguard:lastActionAt", &now.to_string()).await?;

        let reason = if decision == Decision::Lower { "FAILED_SPIKE" } else { "STABLE" };
        self.incidents
            .push_incident(
                "SMART_GUARD_RPM_CHANGE",
                json!({
                    "sessionId": session.session_id,
                    "from": current_rung,
                    "to": proposed,
                    "metrics": {
                        "qlen": metrics.qlen,
                        "sent60s": metrics.sent60s,
                        "routed60s": metrics.routed60s,
                        "failed60s": metrics.failed60s,
                    },
                    "base": base.rpm,
                    "reason": reason,
                }),
            )
            .await;
        crate::metrics::set_smartguard_rpm(&session.session_id, proposed as f64);

        Ok(())
    }

    async fn read_metrics(
        &self,
        session: &SessionDescriptor,
    ) -> Result<SessionTickMetrics, crate::error::DispatcherError> {
        let qlen = self.kv.llen(&format!("queue:session:{}", session.phone)).await?;
        crate::metrics::set_session_queue_depth(&session.session_id, qlen as f64);
        let sent60s = self
            .kv
            .get(&format!("metrics:session:{}:sent60s", session.session_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let routed60s = self
            .kv
            .get(&format!("metrics:session:{}:routed60s", session.session_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);
        let failed60s = self
            .kv
            .get(&format!("metrics:session:{}:failed60s", session.session_id))
            .await?
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        Ok(SessionTickMetrics { qlen, sent60s, routed60s, failed60s })
    }
}

/// Spawn SmartGuard's periodic ticker. Ticks at `tick_ms` (already floored
/// to the minimum by config) for as long as the process lives, skipping
/// ticks while `running` is cleared.
pub fn spawn_ticker(
    guard: Arc<SmartGuard>,
    tick_ms: u64,
    running: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_millis(tick_ms));
        loop {
            interval.tick().await;
            if running.load(Ordering::SeqCst) {
                guard.tick().await;
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nearest_rung_snaps_correctly() {
        assert_eq!(nearest_rung(18.0), 20);
        assert_eq!(nearest_rung(12.0), 10);
        assert_eq!(nearest_rung(7.0), 5);
    }

    #[test]
    fn lower_rung_steps_down() {
        assert_eq!(lower_rung(20), 15);
        assert_eq!(lower_rung(5), 5);
    }

    #[test]
    fn raise_rung_steps_up() {
        assert_eq!(raise_rung(5), 10);
        assert_eq!(raise_rung(20), 20);
    }

    #[test]
    fn raise_never_exceeds_base() {
        let proposed = raise_rung(15).min(15);
        assert_eq!(proposed, 15);
    }
}
