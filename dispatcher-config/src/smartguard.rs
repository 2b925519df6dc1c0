use crate::{env_bool_or_default, env_parsed_or_default, ConfigError, FromEnv};

/// SmartGuard auto-tuner configuration. `enabled` here is only the startup
/// default: the live value lives in `config:smartguard:enabled` and can be
/// toggled at runtime via the control API.
#[derive(Clone, Debug)]
pub struct SmartGuardConfig {
    pub enabled: bool,
    pub tick_ms: u64,
}

/// SmartGuard never ticks faster than this, regardless of configuration.
pub const MIN_TICK_MS: u64 = 2000;

impl FromEnv for SmartGuardConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let enabled = env_bool_or_default("SMART_GUARD_ENABLED", true)?;
        let tick_ms = env_parsed_or_default("SMART_GUARD_TICK_MS", 10_000)?;

        Ok(Self {
            enabled,
            tick_ms: tick_ms.max(MIN_TICK_MS),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_smartguard_config_defaults() {
        temp_env::with_vars(
            [
                ("SMART_GUARD_ENABLED", None::<&str>),
                ("SMART_GUARD_TICK_MS", None::<&str>),
            ],
            || {
                let c = SmartGuardConfig::from_env().unwrap();
                assert!(c.enabled);
                assert_eq!(c.tick_ms, 10_000);
            },
        );
    }

    #[test]
    fn test_smartguard_config_tick_floor() {
        temp_env::with_var("SMART_GUARD_TICK_MS", Some("500"), || {
            let c = SmartGuardConfig::from_env().unwrap();
            assert_eq!(c.tick_ms, MIN_TICK_MS);
        });
    }

    #[test]
    fn test_smartguard_config_disabled() {
        temp_env::with_var("SMART_GUARD_ENABLED", Some("false"), || {
            let c = SmartGuardConfig::from_env().unwrap();
            assert!(!c.enabled);
        });
    }
}
