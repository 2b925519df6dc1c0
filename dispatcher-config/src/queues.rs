use crate::{env_or_default, ConfigError, FromEnv};

/// Key names for the gateway-facing queues and the per-session queue prefix.
#[derive(Clone, Debug)]
pub struct QueueConfig {
    pub gateway_queue_key: String,
    pub priority_queue_key: String,
    pub session_queue_prefix: String,
}

impl QueueConfig {
    /// Key for a specific session's task queue: `<prefix><phone>`.
    pub fn session_queue_key(&self, phone: &str) -> String {
        format!("{}{}", self.session_queue_prefix, phone)
    }
}

impl FromEnv for QueueConfig {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            gateway_queue_key: env_or_default("GATEWAY_QUEUE_KEY", "gateway:jobs"),
            priority_queue_key: env_or_default("PRIORITY_QUEUE_KEY", "queue:priority"),
            session_queue_prefix: env_or_default("SESSION_QUEUE_PREFIX", "queue:session:"),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_config_defaults() {
        temp_env::with_vars(
            [
                ("GATEWAY_QUEUE_KEY", None::<&str>),
                ("PRIORITY_QUEUE_KEY", None::<&str>),
                ("SESSION_QUEUE_PREFIX", None::<&str>),
            ],
            || {
                let config = QueueConfig::from_env().unwrap();
                assert_eq!(config.gateway_queue_key, "gateway:jobs");
                assert_eq!(config.priority_queue_key, "queue:priority");
                assert_eq!(
                    config.session_queue_key("972500000001"),
                    "queue:session:972500000001"
                );
            },
        );
    }
}
