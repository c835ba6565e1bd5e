//! Engine configuration
//!
//! Layered with figment: built-in defaults, then an optional YAML file, then
//! `CLINDOC_*` environment variables (`__` separates nested keys, e.g.
//! `CLINDOC_LOGGING__LOG_LEVEL=debug`).

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use logger_redacted::LoggerConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::SyncResult;

pub const ENV_PREFIX: &str = "CLINDOC_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Base URL of the record API, without the collection segment
    pub server_url: String,
    pub auth_token: Option<String>,
    /// Per-request timeout, in seconds
    #[serde(with = "duration_secs")]
    pub request_timeout: Duration,
    /// Quiet period before an edited draft is saved, in seconds
    #[serde(with = "duration_secs")]
    pub autosave_debounce: Duration,
    pub autosave_enabled: bool,
    /// Directory of the file-backed cache; in-memory when unset
    pub cache_dir: Option<PathBuf>,
    pub logging: LoggerConfig,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080/api/v1".to_string(),
            auth_token: None,
            request_timeout: Duration::from_secs(30),
            autosave_debounce: Duration::from_secs(30),
            autosave_enabled: true,
            cache_dir: None,
            logging: LoggerConfig::default(),
        }
    }
}

impl SyncConfig {
    /// Defaults, overlaid by `path` (if given) and the environment.
    ///
    /// # Errors
    ///
    /// `Config` if the file cannot be parsed or a value has the wrong type.
    pub fn load(path: Option<&Path>) -> SyncResult<Self> {
        let mut figment = Figment::from(Serialized::defaults(SyncConfig::default()));
        if let Some(path) = path {
            figment = figment.merge(Yaml::file(path));
        }
        let config = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()?;
        Ok(config)
    }
}

// Serialize Duration as seconds
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use figment::Jail;
    use logger_redacted::LogFormat;

    #[test]
    fn test_defaults_without_sources() {
        Jail::expect_with(|_jail| {
            let config = SyncConfig::load(None).map_err(|e| e.to_string())?;
            assert_eq!(config, SyncConfig::default());
            assert_eq!(config.autosave_debounce, Duration::from_secs(30));
            Ok(())
        });
    }

    #[test]
    fn test_file_then_environment() {
        Jail::expect_with(|jail| {
            jail.create_file(
                "clindoc.yaml",
                r#"
server_url: "https://records.example.org/api"
autosave_debounce: 10
cache_dir: "/var/lib/clindoc"
logging:
  log_level: debug
  format: json
"#,
            )?;
            jail.set_env("CLINDOC_AUTOSAVE_DEBOUNCE", "5");
            jail.set_env("CLINDOC_LOGGING__LOG_LEVEL", "warn");

            let config = SyncConfig::load(Some(Path::new("clindoc.yaml"))).map_err(|e| e.to_string())?;
            assert_eq!(config.server_url, "https://records.example.org/api");
            assert_eq!(config.autosave_debounce, Duration::from_secs(5));
            assert_eq!(config.request_timeout, Duration::from_secs(30));
            assert_eq!(config.cache_dir, Some(PathBuf::from("/var/lib/clindoc")));
            assert_eq!(config.logging.format, LogFormat::Json);
            assert_eq!(config.logging.log_level, "warn");
            Ok(())
        });
    }

    #[test]
    fn test_bad_value_is_a_config_error() {
        Jail::expect_with(|jail| {
            jail.create_file("clindoc.yaml", "request_timeout: soon")?;
            let result = SyncConfig::load(Some(Path::new("clindoc.yaml")));
            assert!(matches!(result, Err(crate::error::SyncError::Config(_))));
            Ok(())
        });
    }
}
