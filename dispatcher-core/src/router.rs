//! Session routing: sticky, least-loaded, health-based, round-robin and
//! random strategies over a filtered set of healthy session descriptors.

use crate::models::{RoutingHints, SessionDescriptor};
use rand::seq::IndexedRandom;
use rand::Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RouterError {
    #[error("no sessions available")]
    NoSessionsAvailable,
}

/// The five strategies the router supports. Closed set, per the design notes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoutingStrategy {
    Sticky,
    HealthBased,
    LeastLoaded,
    RoundRobin,
    Random,
}

struct StickyEntry {
    session_id: String,
    expires_at: Instant,
}

const STICKY_TTL: Duration = Duration::from_secs(24 * 60 * 60);
const SWEEP_INTERVAL: Duration = Duration::from_secs(60 * 60);

/// Sticky recipient→session map plus round-robin cursor. The only
/// in-process shared state in routing; mutated and read only by the
/// routing loop.
pub struct Router {
    sticky: Mutex<HashMap<String, StickyEntry>>,
    last_sweep: Mutex<Instant>,
    round_robin_cursor: AtomicUsize,
}

impl Default for Router {
    fn default() -> Self {
        Self::new()
    }
}

impl Router {
    pub fn new() -> Self {
        Self {
            sticky: Mutex::new(HashMap::new()),
            last_sweep: Mutex::new(Instant::now()),
            round_robin_cursor: AtomicUsize::new(0),
        }
    }

    /// Select a session for a recipient. Filters to healthy candidates
    /// first, falls back to any connected session, then fails.
    pub fn select<'a>(
        &self,
        sessions: &'a [SessionDescriptor],
        recipient_phone: &str,
        hints: &RoutingHints,
        strategy: RoutingStrategy,
    ) -> Result<&'a SessionDescriptor, RouterError> {
        self.sweep_if_due();

        let healthy: Vec<&SessionDescriptor> =
            sessions.iter().filter(|s| s.is_healthy()).collect();
        let candidates: Vec<&SessionDescriptor> = if !healthy.is_empty() {
            healthy
        } else {
            sessions
                .iter()
                .filter(|s| matches!(s.status, crate::models::SessionStatus::Connected))
                .collect()
        };

        if candidates.is_empty() {
            return Err(RouterError::NoSessionsAvailable);
        }

        if let Some(preferred) = &hints.preferred_session {
            if let Some(s) = candidates.iter().find(|s| &s.session_id == preferred) {
                return Ok(s);
            }
        }
        if let Some(from) = &hints.from_number {
            if let Some(s) = candidates.iter().find(|s| &s.phone == from) {
                return Ok(s);
            }
        }

        let chosen = match strategy {
            RoutingStrategy::Sticky => self.select_sticky(&candidates, recipient_phone),
            RoutingStrategy::HealthBased => self.select_health_based(&candidates, recipient_phone),
            RoutingStrategy::LeastLoaded => Self::select_least_loaded(&candidates),
            RoutingStrategy::RoundRobin => self.select_round_robin(&candidates),
            RoutingStrategy::Random => Self::select_random(&candidates),
        };

        Ok(chosen)
    }

    fn select_sticky<'a>(
        &self,
        candidates: &[&'a SessionDescriptor],
        recipient_phone: &str,
    ) -> &'a SessionDescriptor {
        let cached_id = {
            let map = self.sticky.lock().unwrap();
            map.get(recipient_phone).and_then(|entry| {
                if entry.expires_at > Instant::now() {
                    Some(entry.session_id.clone())
                } else {
                    None
                }
            })
        };

        if let Some(id) = cached_id {
            if let Some(s) = candidates.iter().find(|s| s.session_id == id) {
                return s;
            }
        }

        let chosen = Self::select_least_loaded(candidates);
        self.refresh_sticky(recipient_phone, &chosen.session_id);
        chosen
    }

    fn select_health_based<'a>(
        &self,
        candidates: &[&'a SessionDescriptor],
        recipient_phone: &str,
    ) -> &'a SessionDescriptor {
        let sticky_id = {
            let map = self.sticky.lock().unwrap();
            map.get(recipient_phone)
                .filter(|e| e.expires_at > Instant::now())
                .map(|e| e.session_id.clone())
        };

        let now_ms = chrono::Utc::now().timestamp_millis();
        let mut rng = rand::rng();
        let winner = candidates
            .iter()
            .map(|s| {
                let msg_penalty = (s.message_count.unwrap_or(0) as f64 / 10.0).min(30.0);
                let error_penalty = 10.0 * s.recent_errors.unwrap_or(0) as f64;
                let ping_penalty = match s.last_ping {
                    Some(ping) if now_ms - ping > 120_000 => 20.0,
                    _ => 0.0,
                };
                let sticky_bonus = if sticky_id.as_deref() == Some(s.session_id.as_str()) {
                    20.0
                } else {
                    0.0
                };
                let jitter = rng.random_range(0.0..=10.0);
                let score =
                    100.0 - msg_penalty - error_penalty - ping_penalty + sticky_bonus + jitter;
                (score, *s)
            })
            .max_by(|a, b| a.0.partial_cmp(&b.0).unwrap())
            .map(|(_, s)| s)
            .expect("candidates non-empty");

        self.refresh_sticky(recipient_phone, &winner.session_id);
        winner
    }

    fn select_least_loaded<'a>(candidates: &[&'a SessionDescriptor]) -> &'a SessionDescriptor {
        candidates
            .iter()
            .min_by_key(|s| s.message_count.unwrap_or(0))
            .copied()
            .expect("candidates non-empty")
    }

    fn select_round_robin<'a>(&self, candidates: &[&'a SessionDescriptor]) -> &'a SessionDescriptor {
        let idx = self.round_robin_cursor.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates[idx]
    }

    fn select_random<'a>(candidates: &[&'a SessionDescriptor]) -> &'a SessionDescriptor {
        candidates.choose(&mut rand::rng()).copied().expect("candidates non-empty")
    }

    fn refresh_sticky(&self, recipient_phone: &str, session_id: &str) {
        let mut map = self.sticky.lock().unwrap();
        map.insert(
            recipient_phone.to_string(),
            StickyEntry {
                session_id: session_id.to_string(),
                expires_at: Instant::now() + STICKY_TTL,
            },
        );
    }

    /// Sweep expired sticky entries once an hour.
    fn sweep_if_due(&self) {
        let mut last = self.last_sweep.lock().unwrap();
        if last.elapsed() < SWEEP_INTERVAL {
            return;
        }
        *last = Instant::now();
        let now = Instant::now();
        self.sticky.lock().unwrap().retain(|_, v| v.expires_at > now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SessionStatus;

    fn session(id: &str, phone: &str, msg_count: u64) -> SessionDescriptor {
        SessionDescriptor {
            session_id: id.to_string(),
            phone: phone.to_string(),
            status: SessionStatus::Connected,
            created_at: 0,
            message_count: Some(msg_count),
            recent_errors: Some(0),
            last_ping: None,
            banned: Some(false),
            rate_limited: Some(false),
        }
    }

    #[test]
    fn no_sessions_fails() {
        let router = Router::new();
        let err = router
            .select(&[], "972500000001", &RoutingHints::default(), RoutingStrategy::Sticky)
            .unwrap_err();
        assert!(matches!(err, RouterError::NoSessionsAvailable));
    }

    #[test]
    fn sticky_reuses_cached_session() {
        let router = Router::new();
        let sessions = vec![session("s1", "p1", 0), session("s2", "p2", 0)];
        let hints = RoutingHints::default();

        let first = router
            .select(&sessions, "972500000099", &hints, RoutingStrategy::Sticky)
            .unwrap()
            .session_id
            .clone();
        let second = router
            .select(&sessions, "972500000099", &hints, RoutingStrategy::Sticky)
            .unwrap()
            .session_id
            .clone();

        assert_eq!(first, second);
    }

    #[test]
    fn preferred_session_wins_over_strategy() {
        let router = Router::new();
        let sessions = vec![session("s1", "p1", 0), session("s2", "p2", 100)];
        let hints = RoutingHints { preferred_session: Some("s2".to_string()), from_number: None };
        let chosen = router
            .select(&sessions, "972500000099", &hints, RoutingStrategy::LeastLoaded)
            .unwrap();
        assert_eq!(chosen.session_id, "s2");
    }

    #[test]
    fn least_loaded_picks_minimum_message_count() {
        let router = Router::new();
        let sessions = vec![session("s1", "p1", 50), session("s2", "p2", 3)];
        let chosen = router
            .select(
                &sessions,
                "972500000099",
                &RoutingHints::default(),
                RoutingStrategy::LeastLoaded,
            )
            .unwrap();
        assert_eq!(chosen.session_id, "s2");
    }

    #[test]
    fn unhealthy_only_session_is_excluded_unless_no_alternative() {
        let router = Router::new();
        let mut banned = session("s1", "p1", 0);
        banned.banned = Some(true);
        let sessions = vec![banned];
        // falls back to any CONNECTED session, even if flagged
        let chosen = router
            .select(&sessions, "p1", &RoutingHints::default(), RoutingStrategy::Sticky)
            .unwrap();
        assert_eq!(chosen.session_id, "s1");
    }
}
