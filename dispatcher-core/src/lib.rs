//! Dispatcher Core - Anti-ban Dispatch Engine
//!
//! The engine that turns job records in Redis into paced, routed handoffs to
//! a downstream orchestrator, without tripping the per-session rate limits
//! that get WhatsApp sessions banned:
//! - Sticky per-recipient session routing with health/least-loaded/round-robin
//!   and random fallback strategies
//! - Per-session pacing (delay-mode or RPM-mode) with jitter and a burst guard
//! - Exactly-once task accounting via set-if-absent finalization
//! - SmartGuard, a periodic auto-tuner that narrows or widens a session's RPM
//!   within its trust-policy ceiling
//! - A capped incident log plus a best-effort Brain event sink
//! - A control HTTP API for inspection and live tuning
//!
//! # Architecture
//!
//! ```text
//! Gateway → gateway:jobs / queue:priority
//!            ↓ (intake::IntakeLoop)
//! queue:session:<phone>
//!            ↓ (session::spawn_consumer, one per connected session)
//! Orchestrator outbox
//! ```
//!
//! SmartGuard (`smartguard::SmartGuard`) ticks independently, reading rolling
//! metrics and writing RPM overrides that session consumers pick up on their
//! next loop iteration.

pub mod api;
pub mod error;
pub mod incidents;
pub mod intake;
pub mod kv;
pub mod metrics;
pub mod models;
pub mod orchestrator;
pub mod pacer;
pub mod router;
pub mod session;
pub mod smartguard;
pub mod trust;

pub use error::DispatcherError;

/// Result type alias for dispatcher operations.
pub type DispatcherResult<T> = Result<T, DispatcherError>;
