pub mod dispatcher;
pub mod orchestrator;
pub mod pacer;
pub mod queues;
pub mod redis;
pub mod server;
pub mod smartguard;
pub mod tracing;

use std::env;
use std::str::FromStr;
use thiserror::Error;

/// Configuration error type
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Environment variable '{0}' is required but not set")]
    MissingEnvVar(String),

    #[error("Failed to parse environment variable '{key}': {details}")]
    ParseError { key: String, details: String },
}

/// Application environment (dev = local, prod = deployed)
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Environment {
    Development,
    Production,
}

impl Environment {
    pub fn from_env() -> Self {
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if app_env.eq_ignore_ascii_case("production") {
            Environment::Production
        } else {
            Environment::Development
        }
    }

    pub fn is_production(&self) -> bool {
        matches!(self, Environment::Production)
    }

    pub fn is_development(&self) -> bool {
        matches!(self, Environment::Development)
    }
}

/// Trait for configuration that can be loaded from environment variables
pub trait FromEnv: Sized {
    fn from_env() -> Result<Self, ConfigError>;
}

/// Helper to load and parse environment variable with a default value
pub fn env_or_default(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

/// Helper to load and parse environment variable or return error
pub fn env_required(key: &str) -> Result<String, ConfigError> {
    env::var(key).map_err(|_| ConfigError::MissingEnvVar(key.to_string()))
}

/// Helper to load an optional environment variable (no default, no error)
pub fn env_optional(key: &str) -> Option<String> {
    env::var(key).ok()
}

/// Parse an environment variable with a default, producing a typed `ConfigError` on bad input.
pub fn env_parsed_or_default<T>(key: &str, default: T) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw.parse().map_err(|e| ConfigError::ParseError {
            key: key.to_string(),
            details: format!("{}", e),
        }),
        Err(_) => Ok(default),
    }
}

/// Parse a boolean environment variable ("true"/"false", case-insensitive) with a default.
pub fn env_bool_or_default(key: &str, default: bool) -> Result<bool, ConfigError> {
    match env::var(key) {
        Ok(raw) => match raw.to_ascii_lowercase().as_str() {
            "true" | "1" | "yes" => Ok(true),
            "false" | "0" | "no" => Ok(false),
            other => Err(ConfigError::ParseError {
                key: key.to_string(),
                details: format!("expected a boolean, got '{}'", other),
            }),
        },
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_defaults_to_development() {
        temp_env::with_var_unset("APP_ENV", || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Development);
            assert!(env.is_development());
            assert!(!env.is_production());
        });
    }

    #[test]
    fn test_environment_production() {
        temp_env::with_var("APP_ENV", Some("production"), || {
            let env = Environment::from_env();
            assert_eq!(env, Environment::Production);
            assert!(env.is_production());
        });
    }

    #[test]
    fn test_environment_production_case_insensitive() {
        temp_env::with_var("APP_ENV", Some("PRODUCTION"), || {
            assert_eq!(Environment::from_env(), Environment::Production);
        });
    }

    #[test]
    fn test_env_or_default_with_value() {
        temp_env::with_var("TEST_VAR_CONFIG", Some("test_value"), || {
            assert_eq!(env_or_default("TEST_VAR_CONFIG", "default"), "test_value");
        });
    }

    #[test]
    fn test_env_or_default_without_value() {
        temp_env::with_var_unset("MISSING_VAR_CONFIG", || {
            assert_eq!(
                env_or_default("MISSING_VAR_CONFIG", "default_value"),
                "default_value"
            );
        });
    }

    #[test]
    fn test_env_required_missing() {
        temp_env::with_var_unset("MISSING_REQUIRED_CONFIG", || {
            let result = env_required("MISSING_REQUIRED_CONFIG");
            assert!(result.is_err());
            assert!(result.unwrap_err().to_string().contains("required"));
        });
    }

    #[test]
    fn test_env_parsed_or_default_uses_default() {
        temp_env::with_var_unset("POLL_MS_TEST", || {
            let v: u64 = env_parsed_or_default("POLL_MS_TEST", 1000).unwrap();
            assert_eq!(v, 1000);
        });
    }

    #[test]
    fn test_env_parsed_or_default_parses_value() {
        temp_env::with_var("POLL_MS_TEST2", Some("2500"), || {
            let v: u64 = env_parsed_or_default("POLL_MS_TEST2", 1000).unwrap();
            assert_eq!(v, 2500);
        });
    }

    #[test]
    fn test_env_parsed_or_default_invalid() {
        temp_env::with_var("POLL_MS_TEST3", Some("not_a_number"), || {
            let result: Result<u64, _> = env_parsed_or_default("POLL_MS_TEST3", 1000);
            assert!(result.is_err());
        });
    }

    #[test]
    fn test_env_bool_or_default() {
        temp_env::with_var_unset("FLAG_TEST", || {
            assert!(env_bool_or_default("FLAG_TEST", true).unwrap());
        });
        temp_env::with_var("FLAG_TEST", Some("false"), || {
            assert!(!env_bool_or_default("FLAG_TEST", true).unwrap());
        });
        temp_env::with_var("FLAG_TEST", Some("garbage"), || {
            assert!(env_bool_or_default("FLAG_TEST", true).is_err());
        });
    }
}
