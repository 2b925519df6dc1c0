use crate::orchestrator::OrchestratorConfig;
use crate::pacer::PacerDefaults;
use crate::queues::QueueConfig;
use crate::redis::RedisConfig;
use crate::server::ServerConfig;
use crate::smartguard::SmartGuardConfig;
use crate::{env_bool_or_default, env_parsed_or_default, ConfigError, FromEnv};

/// Top-level configuration for the dispatcher process, composed from the
/// sub-configs above. Loaded once at startup; a missing required variable or
/// an unparseable numeric value fails the process before anything connects.
#[derive(Clone, Debug)]
pub struct DispatcherConfig {
    pub server: ServerConfig,
    pub redis: RedisConfig,
    pub orchestrator: OrchestratorConfig,
    pub queues: QueueConfig,
    pub pacer: PacerDefaults,
    pub smartguard: SmartGuardConfig,
    pub poll_interval_ms: u64,
    pub job_stats_ttl_seconds: u64,
    pub auto_start: bool,
    /// Accepted for forward compatibility; the intake loop is a single poll
    /// and does not use this value (see the dispatcher's open questions).
    pub max_concurrent_jobs: u32,
}

impl FromEnv for DispatcherConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            server: ServerConfig::from_env()?,
            redis: RedisConfig::from_env()?,
            orchestrator: OrchestratorConfig::from_env()?,
            queues: QueueConfig::from_env()?,
            pacer: PacerDefaults::from_env()?,
            smartguard: SmartGuardConfig::from_env()?,
            poll_interval_ms: env_parsed_or_default("POLL_INTERVAL_MS", 1000)?,
            job_stats_ttl_seconds: env_parsed_or_default("JOB_STATS_TTL_SECONDS", 86_400)?,
            auto_start: env_bool_or_default("AUTO_START", true)?,
            max_concurrent_jobs: env_parsed_or_default("MAX_CONCURRENT_JOBS", 1)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatcher_config_from_env() {
        temp_env::with_vars(
            [
                ("REDIS_URL", Some("redis://localhost:6379")),
                ("ORCHESTRATOR_URL", Some("http://orch:9000")),
            ],
            || {
                let config = DispatcherConfig::from_env().unwrap();
                assert_eq!(config.server.port, 4001);
                assert_eq!(config.poll_interval_ms, 1000);
                assert!(config.auto_start);
                assert_eq!(config.max_concurrent_jobs, 1);
            },
        );
    }

    #[test]
    fn test_dispatcher_config_missing_redis() {
        temp_env::with_vars(
            [
                ("REDIS_URL", None::<&str>),
                ("ORCHESTRATOR_URL", Some("http://orch:9000")),
            ],
            || {
                assert!(DispatcherConfig::from_env().is_err());
            },
        );
    }
}
