use crate::{env_parsed_or_default, ConfigError, FromEnv};

/// Default pacing and retry parameters applied before a trust-policy level or
/// an RPM override takes over.
#[derive(Clone, Debug)]
pub struct PacerDefaults {
    pub default_min_delay_ms: u64,
    pub default_max_delay_ms: u64,
    pub burst_limit: u32,
    pub burst_cooldown_ms: u64,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
}

impl FromEnv for PacerDefaults {
    fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            default_min_delay_ms: env_parsed_or_default("DEFAULT_MIN_DELAY_MS", 2000)?,
            default_max_delay_ms: env_parsed_or_default("DEFAULT_MAX_DELAY_MS", 5000)?,
            burst_limit: env_parsed_or_default("BURST_LIMIT", 5)?,
            burst_cooldown_ms: env_parsed_or_default("BURST_COOLDOWN_MS", 30_000)?,
            max_retries: env_parsed_or_default("MAX_RETRIES", 3)?,
            retry_delay_ms: env_parsed_or_default("RETRY_DELAY_MS", 60_000)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pacer_defaults_from_env() {
        temp_env::with_vars(
            [
                ("DEFAULT_MIN_DELAY_MS", None::<&str>),
                ("DEFAULT_MAX_DELAY_MS", None::<&str>),
                ("BURST_LIMIT", None::<&str>),
                ("BURST_COOLDOWN_MS", None::<&str>),
                ("MAX_RETRIES", None::<&str>),
                ("RETRY_DELAY_MS", None::<&str>),
            ],
            || {
                let d = PacerDefaults::from_env().unwrap();
                assert_eq!(d.default_min_delay_ms, 2000);
                assert_eq!(d.default_max_delay_ms, 5000);
                assert_eq!(d.burst_limit, 5);
                assert_eq!(d.burst_cooldown_ms, 30_000);
                assert_eq!(d.max_retries, 3);
                assert_eq!(d.retry_delay_ms, 60_000);
            },
        );
    }

    #[test]
    fn test_pacer_defaults_override() {
        temp_env::with_var("BURST_LIMIT", Some("10"), || {
            let d = PacerDefaults::from_env().unwrap();
            assert_eq!(d.burst_limit, 10);
        });
    }
}
