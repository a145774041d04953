//! Run configuration.
//!
//! A `RunConfig` is loaded once from YAML (or built in code) and passed by value
//! into the supervisor and engine. Every field has a default so partial files
//! parse; unknown fields are ignored for forward compatibility.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Idle timeouts below this are accepted but flagged.
const MIN_RECOMMENDED_IDLE_SECS: u64 = 30;

/// How much privilege the container is granted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Default isolation; no access to a container runtime inside.
    #[default]
    Relaxed,
    /// Elevated container, required for nested container workloads.
    Privileged,
}

/// Top-level configuration for one run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunConfig {
    /// Container image reference.
    #[serde(default)]
    pub image: String,

    /// Workspace root on the controlling host, mounted into the container.
    #[serde(default = "default_workspace")]
    pub workspace: PathBuf,

    #[serde(default)]
    pub mode: ExecutionMode,

    /// Run-level liveness window: the run is cancelled after this many
    /// seconds without any output.
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Time between graceful stop and forced kill during teardown.
    #[serde(default = "default_stop_grace")]
    pub stop_grace_secs: u64,

    /// Environment forwarded verbatim into the container. Credentials live
    /// here and are never inspected.
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default)]
    pub agent: AgentConfig,

    /// Model override for single-prompt runs.
    #[serde(default)]
    pub model: Option<String>,

    #[serde(default)]
    pub verbose: bool,
}

fn default_workspace() -> PathBuf {
    PathBuf::from(".")
}

fn default_idle_timeout() -> u64 {
    600 // 10 minutes
}

fn default_stop_grace() -> u64 {
    10
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            image: String::new(),
            workspace: default_workspace(),
            mode: ExecutionMode::default(),
            idle_timeout_secs: default_idle_timeout(),
            stop_grace_secs: default_stop_grace(),
            env: BTreeMap::new(),
            agent: AgentConfig::default(),
            model: None,
            verbose: false,
        }
    }
}

/// Agent CLI invoked inside the container.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_command")]
    pub command: String,

    /// Arguments placed before the prompt.
    #[serde(default = "default_agent_args")]
    pub args: Vec<String>,
}

fn default_agent_command() -> String {
    "claude".to_string()
}

fn default_agent_args() -> Vec<String> {
    [
        "--output-format",
        "stream-json",
        "--verbose",
        "--dangerously-skip-permissions",
    ]
    .iter()
    .map(|s| (*s).to_string())
    .collect()
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            command: default_agent_command(),
            args: default_agent_args(),
        }
    }
}

impl RunConfig {
    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path_ref = path.as_ref();
        debug!(path = %path_ref.display(), "Loading run configuration");
        let content = std::fs::read_to_string(path_ref)?;
        let config: Self = serde_yaml::from_str(&content)?;
        debug!(
            image = %config.image,
            mode = ?config.mode,
            idle_timeout_secs = config.idle_timeout_secs,
            "Run configuration loaded"
        );
        Ok(config)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_secs(self.stop_grace_secs)
    }

    /// Validates the configuration, returning non-fatal warnings.
    ///
    /// Missing required settings are fatal and reported before any container
    /// work begins.
    pub fn validate(&self) -> Result<Vec<ConfigWarning>, ConfigError> {
        if self.image.trim().is_empty() {
            return Err(ConfigError::MissingField("image".to_string()));
        }
        if self.agent.command.trim().is_empty() {
            return Err(ConfigError::MissingField("agent.command".to_string()));
        }
        if self.idle_timeout_secs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "idle_timeout_secs".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let mut warnings = Vec::new();
        if self.idle_timeout_secs < MIN_RECOMMENDED_IDLE_SECS {
            warnings.push(ConfigWarning::ShortIdleTimeout {
                secs: self.idle_timeout_secs,
            });
        }
        if self.mode == ExecutionMode::Privileged {
            warnings.push(ConfigWarning::PrivilegedMode);
        }
        Ok(warnings)
    }
}

/// Configuration warnings emitted during validation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigWarning {
    /// Idle timeout so short that slow tool calls may trip it.
    ShortIdleTimeout { secs: u64 },
    /// The container will run with elevated privileges.
    PrivilegedMode,
}

impl std::fmt::Display for ConfigWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigWarning::ShortIdleTimeout { secs } => write!(
                f,
                "Warning [idle_timeout_secs]: {}s is shorter than the recommended {}s",
                secs, MIN_RECOMMENDED_IDLE_SECS
            ),
            ConfigWarning::PrivilegedMode => {
                write!(f, "Warning [mode]: container will run privileged")
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Missing required setting '{0}'")]
    MissingField(String),

    #[error("Invalid value for '{field}': {message}")]
    InvalidValue { field: String, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RunConfig::default();
        assert_eq!(config.mode, ExecutionMode::Relaxed);
        assert_eq!(config.idle_timeout(), Duration::from_secs(600));
        assert_eq!(config.agent.command, "claude");
        assert!(config.agent.args.contains(&"stream-json".to_string()));
    }

    #[test]
    fn test_parse_yaml() {
        let yaml = r#"
image: "ghcr.io/acme/agent:latest"
workspace: "/src/project"
mode: privileged
idle_timeout_secs: 120
env:
  ANTHROPIC_API_KEY: "secret"
agent:
  command: "claude"
"#;
        let config: RunConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.image, "ghcr.io/acme/agent:latest");
        assert_eq!(config.mode, ExecutionMode::Privileged);
        assert_eq!(config.idle_timeout_secs, 120);
        assert_eq!(config.env["ANTHROPIC_API_KEY"], "secret");
        // Unspecified agent args fall back to defaults
        assert!(!config.agent.args.is_empty());
    }

    #[test]
    fn test_missing_image_is_fatal() {
        let config = RunConfig::default();
        let err = config.validate().unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(ref f) if f == "image"));
    }

    #[test]
    fn test_zero_idle_timeout_is_fatal() {
        let config = RunConfig {
            image: "agent".to_string(),
            idle_timeout_secs: 0,
            ..RunConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_warnings() {
        let config = RunConfig {
            image: "agent".to_string(),
            idle_timeout_secs: 5,
            mode: ExecutionMode::Privileged,
            ..RunConfig::default()
        };
        let warnings = config.validate().unwrap();
        assert_eq!(warnings.len(), 2);
        assert!(warnings.contains(&ConfigWarning::ShortIdleTimeout { secs: 5 }));
        assert!(warnings.contains(&ConfigWarning::PrivilegedMode));
    }

    #[test]
    fn test_unknown_fields_ignored() {
        let yaml = r#"
image: agent
future_feature: true
"#;
        let result: Result<RunConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_ok());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("boxrun.yml");
        std::fs::write(&path, "image: agent\nidle_timeout_secs: 45\n").unwrap();

        let config = RunConfig::from_file(&path).unwrap();
        assert_eq!(config.idle_timeout_secs, 45);
        assert!(config.validate().unwrap().is_empty());
    }
}
