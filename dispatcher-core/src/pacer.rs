//! Per-session pacing: delay-mode and RPM-mode cadence, jitter, and the
//! burst cooldown guard. One `Pacer` instance per session; each is
//! single-writer (only that session's consumer touches it), so no
//! cross-session lock is required.

use rand::Rng;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::time::sleep;

#[derive(Debug, Error)]
pub enum PacerError {
    #[error("rpm must be a finite, positive number")]
    InvalidRpm,
}

/// Live, mutable pacing parameters for one session.
#[derive(Debug, Clone)]
pub struct PacerConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
    pub rpm: Option<f64>,
    pub burst_limit: u32,
    pub burst_cooldown_ms: u64,
}

impl PacerConfig {
    pub fn rate_bounds(min_rate: f64, max_rate: f64) -> (f64, f64) {
        (min_rate, max_rate)
    }
}

/// Per-session pacer. Tracks cadence state and applies the configured delay
/// before a send, independent of whether that send ultimately succeeds.
pub struct Pacer {
    config: PacerConfig,
    rate_multiplier: f64,
    last_send_time: Option<Instant>,
    send_count: u32,
    burst_start_time: Option<Instant>,
    in_burst_cooldown: bool,
    pub total_sends: u64,
}

const MIN_RATE_MULTIPLIER: f64 = 0.5;
const MAX_RATE_MULTIPLIER: f64 = 5.0;

impl Pacer {
    pub fn new(config: PacerConfig) -> Self {
        Self {
            config,
            rate_multiplier: 1.0,
            last_send_time: None,
            send_count: 0,
            burst_start_time: None,
            in_burst_cooldown: false,
            total_sends: 0,
        }
    }

    /// Sleep the minimum amount needed before the next send is allowed to
    /// go out, honoring the burst guard first. Returns the delay actually
    /// slept, in milliseconds.
    pub async fn wait_for_slot(&mut self) -> u64 {
        if self.send_count >= self.config.burst_limit {
            let jitter_ms = rand::rng().random_range(1000..=3000);
            let cooldown = self.config.burst_cooldown_ms + jitter_ms;
            sleep(Duration::from_millis(cooldown)).await;
            self.send_count = 0;
            self.in_burst_cooldown = false;
            self.burst_start_time = None;
            return cooldown;
        }

        let (min_delay_ms, max_delay_ms) = self.effective_delay_window();

        let target_ms = if max_delay_ms > min_delay_ms {
            rand::rng().random_range(min_delay_ms..=max_delay_ms)
        } else {
            min_delay_ms
        } as f64
            * self.rate_multiplier;

        let target_ms = apply_jitter(target_ms.round() as u64);

        let elapsed_ms = self
            .last_send_time
            .map(|t| t.elapsed().as_millis() as u64)
            .unwrap_or(u64::MAX);

        if elapsed_ms >= target_ms {
            return 0;
        }

        let remaining = target_ms - elapsed_ms;
        sleep(Duration::from_millis(remaining)).await;
        remaining
    }

    /// Delay window after applying RPM mode, if set.
    fn effective_delay_window(&self) -> (u64, u64) {
        match self.config.rpm {
            Some(rpm) if rpm > 0.0 => {
                let base_interval = 60_000.0 / rpm;
                let min_delay_ms = (base_interval * 0.8).floor() as u64;
                let max_delay_ms = ((base_interval * 1.2).floor() as u64).max(min_delay_ms);
                (min_delay_ms, max_delay_ms)
            }
            _ => (self.config.min_delay_ms, self.config.max_delay_ms),
        }
    }

    /// Record that a send was attempted, regardless of outcome. Must be
    /// called after every handoff attempt so cadence reflects attempts, not
    /// just successes.
    pub fn record_send(&mut self) {
        self.last_send_time = Some(Instant::now());
        self.send_count += 1;
        self.total_sends += 1;
        if self.burst_start_time.is_none() {
            self.burst_start_time = Some(Instant::now());
        }
    }

    pub fn update_config(&mut self, config: PacerConfig) {
        self.config = config;
    }

    pub fn set_rpm(&mut self, rpm: Option<f64>) -> Result<(), PacerError> {
        if let Some(r) = rpm {
            if !r.is_finite() || r <= 0.0 {
                return Err(PacerError::InvalidRpm);
            }
        }
        self.config.rpm = rpm;
        Ok(())
    }

    pub fn slow_down(&mut self, factor: f64) {
        self.rate_multiplier = (self.rate_multiplier * factor.max(0.0))
            .clamp(MIN_RATE_MULTIPLIER, MAX_RATE_MULTIPLIER);
    }

    pub fn speed_up(&mut self, factor: f64) {
        self.rate_multiplier = (self.rate_multiplier / factor.max(f64::EPSILON))
            .clamp(MIN_RATE_MULTIPLIER, MAX_RATE_MULTIPLIER);
    }

    pub fn reset_rate(&mut self) {
        self.rate_multiplier = 1.0;
    }

    pub fn rpm(&self) -> Option<f64> {
        self.config.rpm
    }

    pub fn send_count(&self) -> u32 {
        self.send_count
    }

    pub fn stats(&self) -> PacerStats {
        PacerStats {
            min_delay_ms: self.config.min_delay_ms,
            max_delay_ms: self.config.max_delay_ms,
            rpm: self.config.rpm,
            burst_limit: self.config.burst_limit,
            burst_cooldown_ms: self.config.burst_cooldown_ms,
            rate_multiplier: self.rate_multiplier,
            send_count: self.send_count,
            total_sends: self.total_sends,
            in_burst_cooldown: self.in_burst_cooldown,
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct PacerStats {
    #[serde(rename = "minDelayMs")]
    pub min_delay_ms: u64,
    #[serde(rename = "maxDelayMs")]
    pub max_delay_ms: u64,
    pub rpm: Option<f64>,
    #[serde(rename = "burstLimit")]
    pub burst_limit: u32,
    #[serde(rename = "burstCooldownMs")]
    pub burst_cooldown_ms: u64,
    #[serde(rename = "rateMultiplier")]
    pub rate_multiplier: f64,
    #[serde(rename = "sendCount")]
    pub send_count: u32,
    #[serde(rename = "totalSends")]
    pub total_sends: u64,
    #[serde(rename = "inBurstCooldown")]
    pub in_burst_cooldown: bool,
}

/// Apply ±20% jitter to a delay, per the pacer contract.
fn apply_jitter(delay_ms: u64) -> u64 {
    let range = (delay_ms as f64 * 0.2) as i64;
    if range == 0 {
        return delay_ms;
    }
    let offset = rand::rng().random_range(-range..=range);
    (delay_ms as i64 + offset).max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> PacerConfig {
        PacerConfig {
            min_delay_ms: 2000,
            max_delay_ms: 5000,
            rpm: None,
            burst_limit: 5,
            burst_cooldown_ms: 30_000,
        }
    }

    #[tokio::test]
    async fn first_wait_is_immediate() {
        let mut pacer = Pacer::new(config());
        let delay = pacer.wait_for_slot().await;
        assert_eq!(delay, 0);
    }

    #[test]
    fn rpm_mode_derives_delay_window() {
        let mut cfg = config();
        cfg.rpm = Some(20.0);
        let pacer = Pacer::new(cfg);
        let (min_delay, max_delay) = pacer.effective_delay_window();
        // base interval = 3000ms; min = 2400, max = 3600
        assert_eq!(min_delay, 2400);
        assert_eq!(max_delay, 3600);
    }

    #[test]
    fn set_rpm_rejects_non_positive() {
        let mut pacer = Pacer::new(config());
        assert!(pacer.set_rpm(Some(0.0)).is_err());
        assert!(pacer.set_rpm(Some(f64::NAN)).is_err());
        assert!(pacer.set_rpm(Some(10.0)).is_ok());
        assert!(pacer.set_rpm(None).is_ok());
    }

    #[test]
    fn slow_down_and_speed_up_clamp() {
        let mut pacer = Pacer::new(config());
        for _ in 0..10 {
            pacer.slow_down(2.0);
        }
        assert!(pacer.rate_multiplier <= MAX_RATE_MULTIPLIER);
        pacer.reset_rate();
        for _ in 0..10 {
            pacer.speed_up(2.0);
        }
        assert!(pacer.rate_multiplier >= MIN_RATE_MULTIPLIER);
    }

    #[test]
    fn record_send_increments_counters() {
        let mut pacer = Pacer::new(config());
        pacer.record_send();
        pacer.record_send();
        assert_eq!(pacer.send_count(), 2);
        assert_eq!(pacer.total_sends, 2);
    }

    #[tokio::test]
    async fn burst_guard_triggers_cooldown() {
        let mut cfg = config();
        cfg.burst_limit = 1;
        cfg.burst_cooldown_ms = 10;
        let mut pacer = Pacer::new(cfg);
        pacer.record_send();
        let delay = pacer.wait_for_slot().await;
        assert!(delay >= 10);
        assert_eq!(pacer.send_count(), 0);
    }
}
