//! Configuration loading with guard rails.
//!
//! Resolution order: explicit path, then `TASKLOOM_CONFIG`, then
//! `taskloom.toml` in the working directory. A missing discoverable file
//! falls back to defaults; an explicitly named file must exist.

use std::{
    env, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::error::TaskloomError;

const DEFAULT_CONFIG_PATH: &str = "taskloom.toml";
const CONFIG_PATH_ENV: &str = "TASKLOOM_CONFIG";

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    #[serde(default)]
    pub security: SecurityConfig,
    #[serde(default)]
    pub validation: ValidationConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OrchestratorConfig {
    /// Bus history ring size.
    #[serde(default = "OrchestratorConfig::default_max_event_history")]
    pub max_event_history: usize,
    /// Enable the durable bus and queue backends.
    #[serde(default)]
    pub distributed: bool,
    /// Backpressure threshold on the pending task list.
    #[serde(default = "OrchestratorConfig::default_max_queue_size")]
    pub max_queue_size: usize,
    /// Per-graph credit budget in distributed mode.
    #[serde(default = "OrchestratorConfig::default_max_credits")]
    pub max_credits: f64,
}

impl OrchestratorConfig {
    const fn default_max_event_history() -> usize {
        10_000
    }

    const fn default_max_queue_size() -> usize {
        100
    }

    const fn default_max_credits() -> f64 {
        1_000.0
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            max_event_history: Self::default_max_event_history(),
            distributed: false,
            max_queue_size: Self::default_max_queue_size(),
            max_credits: Self::default_max_credits(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "SecurityConfig::default_max_requests_per_hour")]
    pub max_requests_per_hour: u32,
    #[serde(default = "SecurityConfig::default_threat_threshold")]
    pub threat_threshold: f64,
    /// Session TTL in seconds.
    #[serde(default = "SecurityConfig::default_session_timeout")]
    pub session_timeout: u64,
}

impl SecurityConfig {
    const fn default_max_requests_per_hour() -> u32 {
        100
    }

    const fn default_threat_threshold() -> f64 {
        0.8
    }

    const fn default_session_timeout() -> u64 {
        3_600
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            max_requests_per_hour: Self::default_max_requests_per_hour(),
            threat_threshold: Self::default_threat_threshold(),
            session_timeout: Self::default_session_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ValidationConfig {
    #[serde(default = "ValidationConfig::default_auto_fix")]
    pub auto_fix_enabled: bool,
}

impl ValidationConfig {
    const fn default_auto_fix() -> bool {
        true
    }
}

impl Default for ValidationConfig {
    fn default() -> Self {
        Self {
            auto_fix_enabled: Self::default_auto_fix(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "MemoryConfig::default_similarity_threshold")]
    pub similarity_threshold: f32,
}

impl MemoryConfig {
    const fn default_similarity_threshold() -> f32 {
        0.85
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: Self::default_similarity_threshold(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "LoggingConfig::default_level")]
    pub level: String,
}

impl LoggingConfig {
    fn default_level() -> String {
        "info".to_string()
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: Self::default_level(),
        }
    }
}

pub struct ConfigLoader;

impl ConfigLoader {
    pub fn load(path: Option<PathBuf>) -> Result<Config, TaskloomError> {
        let explicit = path.is_some();
        let candidate = resolve_path(path);

        if !candidate.exists() {
            if explicit {
                return Err(TaskloomError::InvalidConfiguration(format!(
                    "config file not found: {}",
                    candidate.display()
                )));
            }
            return Ok(Config::default());
        }

        let raw = fs::read_to_string(&candidate)
            .map_err(|err| TaskloomError::config_io(candidate.clone(), err))?;
        let config: Config = toml::from_str(&raw)
            .map_err(|err| TaskloomError::InvalidConfiguration(err.to_string()))?;

        Self::validate(&config)?;
        Ok(config)
    }

    fn validate(config: &Config) -> Result<(), TaskloomError> {
        if config.orchestrator.max_credits <= 0.0 {
            return Err(TaskloomError::InvalidConfiguration(
                "orchestrator.max_credits must be positive".into(),
            ));
        }
        if config.security.max_requests_per_hour == 0 {
            return Err(TaskloomError::InvalidConfiguration(
                "security.max_requests_per_hour must be at least 1".into(),
            ));
        }
        if !(0.0..=1.0).contains(&(config.memory.similarity_threshold as f64)) {
            return Err(TaskloomError::InvalidConfiguration(
                "memory.similarity_threshold must be within [0, 1]".into(),
            ));
        }
        Ok(())
    }
}

fn resolve_path(path: Option<PathBuf>) -> PathBuf {
    if let Some(path) = path {
        return path;
    }
    if let Ok(from_env) = env::var(CONFIG_PATH_ENV) {
        if !from_env.trim().is_empty() {
            return PathBuf::from(from_env);
        }
    }
    Path::new(DEFAULT_CONFIG_PATH).to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_match_contract() {
        let config = Config::default();
        assert_eq!(config.orchestrator.max_event_history, 10_000);
        assert!(!config.orchestrator.distributed);
        assert_eq!(config.orchestrator.max_queue_size, 100);
        assert_eq!(config.orchestrator.max_credits, 1_000.0);
        assert_eq!(config.security.max_requests_per_hour, 100);
        assert_eq!(config.security.threat_threshold, 0.8);
        assert_eq!(config.security.session_timeout, 3_600);
        assert!(config.validation.auto_fix_enabled);
        assert_eq!(config.memory.similarity_threshold, 0.85);
    }

    #[test]
    fn loads_partial_toml_with_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "[security]\nmax_requests_per_hour = 42\n\n[orchestrator]\ndistributed = true"
        )
        .unwrap();

        let config = ConfigLoader::load(Some(file.path().to_path_buf())).unwrap();
        assert_eq!(config.security.max_requests_per_hour, 42);
        assert!(config.orchestrator.distributed);
        assert_eq!(config.orchestrator.max_queue_size, 100);
    }

    #[test]
    fn explicit_missing_path_is_an_error() {
        let result = ConfigLoader::load(Some(PathBuf::from("/nonexistent/taskloom.toml")));
        assert!(matches!(
            result,
            Err(TaskloomError::InvalidConfiguration(_))
        ));
    }

    #[test]
    fn rejects_invalid_values() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "[orchestrator]\nmax_credits = -5.0").unwrap();
        assert!(ConfigLoader::load(Some(file.path().to_path_buf())).is_err());
    }
}
