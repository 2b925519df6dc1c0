use crate::{env_optional, env_or_default, env_required, ConfigError, FromEnv};

/// How a task handoff is delivered to the Orchestrator.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendMode {
    /// POST to the Orchestrator's HTTP enqueue endpoint.
    Api,
    /// LPUSH the task directly onto the session's Redis outbox list.
    Redis,
}

impl std::str::FromStr for SendMode {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "api" => Ok(SendMode::Api),
            "redis" => Ok(SendMode::Redis),
            other => Err(ConfigError::ParseError {
                key: "SEND_MODE".to_string(),
                details: format!("expected 'api' or 'redis', got '{}'", other),
            }),
        }
    }
}

/// Orchestrator client configuration.
#[derive(Clone, Debug)]
pub struct OrchestratorConfig {
    pub base_url: String,
    pub api_key: String,
    pub send_mode: SendMode,
    /// Best-effort analytics sink. Absent means Brain events are dropped silently.
    pub brain_url: Option<String>,
}

impl FromEnv for OrchestratorConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let send_mode_raw = env_or_default("SEND_MODE", "api");
        let send_mode: SendMode = send_mode_raw.parse()?;

        Ok(Self {
            base_url: env_required("ORCHESTRATOR_URL")?,
            api_key: env_or_default("ORCHESTRATOR_API_KEY", ""),
            send_mode,
            brain_url: env_optional("SESSION_BRAIN_URL"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_orchestrator_config_defaults() {
        temp_env::with_vars(
            [
                ("ORCHESTRATOR_URL", Some("http://orch:9000")),
                ("ORCHESTRATOR_API_KEY", None::<&str>),
                ("SEND_MODE", None::<&str>),
                ("SESSION_BRAIN_URL", None::<&str>),
            ],
            || {
                let config = OrchestratorConfig::from_env().unwrap();
                assert_eq!(config.base_url, "http://orch:9000");
                assert_eq!(config.api_key, "");
                assert_eq!(config.send_mode, SendMode::Api);
                assert_eq!(config.brain_url, None);
            },
        );
    }

    #[test]
    fn test_orchestrator_config_redis_mode() {
        temp_env::with_vars(
            [
                ("ORCHESTRATOR_URL", Some("http://orch:9000")),
                ("SEND_MODE", Some("redis")),
            ],
            || {
                let config = OrchestratorConfig::from_env().unwrap();
                assert_eq!(config.send_mode, SendMode::Redis);
            },
        );
    }

    #[test]
    fn test_orchestrator_config_missing_url() {
        temp_env::with_var_unset("ORCHESTRATOR_URL", || {
            assert!(OrchestratorConfig::from_env().is_err());
        });
    }

    #[test]
    fn test_orchestrator_config_invalid_send_mode() {
        temp_env::with_vars(
            [
                ("ORCHESTRATOR_URL", Some("http://orch:9000")),
                ("SEND_MODE", Some("carrier-pigeon")),
            ],
            || {
                assert!(OrchestratorConfig::from_env().is_err());
            },
        );
    }
}
