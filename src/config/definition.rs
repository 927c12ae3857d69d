use std::collections::HashMap;
use std::fmt::{Display, Formatter};
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::ConfigError;

const DEFAULT_MAX_RESTARTS: u32 = 3;
const DEFAULT_RESTART_WINDOW_SECONDS: u64 = 60;

/// Stable handle of a declared process, unique per node.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(try_from = "String")]
pub struct ProcessId(String);

impl ProcessId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for ProcessId {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        if value.trim().is_empty() {
            return Err("process id must not be empty".to_string());
        }
        Ok(ProcessId(value))
    }
}

impl Display for ProcessId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Target platform a definition is pinned to. A mismatching definition is
/// loadable but not startable.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Platform {
    Win32,
    Darwin,
    Linux,
}

impl Platform {
    pub fn current() -> Option<Platform> {
        match std::env::consts::OS {
            "windows" => Some(Platform::Win32),
            "macos" => Some(Platform::Darwin),
            "linux" => Some(Platform::Linux),
            _ => None,
        }
    }

    pub fn matches_current(&self) -> bool {
        Platform::current().is_some_and(|current| current == *self)
    }
}

impl Display for Platform {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Platform::Win32 => "win32",
            Platform::Darwin => "darwin",
            Platform::Linux => "linux",
        };
        write!(f, "{}", name)
    }
}

/// Health-check settings consumed by the health-client collaborator. The
/// supervision core carries them through untouched.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub url: String,
    #[serde(default = "HealthCheck::default_interval")]
    pub interval_seconds: u64,
    #[serde(default = "HealthCheck::default_timeout")]
    pub timeout_seconds: u64,
}

impl HealthCheck {
    fn default_interval() -> u64 {
        30
    }

    fn default_timeout() -> u64 {
        5
    }
}

/// A declared process, immutable after load.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: ProcessId,
    pub name: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: HashMap<String, String>,
    #[serde(default)]
    pub auto_restart: bool,
    #[serde(default = "default_max_restarts")]
    pub max_restarts: u32,
    #[serde(default = "default_restart_window", alias = "restart_window")]
    pub restart_window_seconds: u64,
    #[serde(default)]
    pub platform: Option<Platform>,
    #[serde(default)]
    pub stop_command: Option<String>,
    #[serde(default)]
    pub stop_args: Vec<String>,
    #[serde(default)]
    pub health_check: Option<HealthCheck>,
}

fn default_max_restarts() -> u32 {
    DEFAULT_MAX_RESTARTS
}

fn default_restart_window() -> u64 {
    DEFAULT_RESTART_WINDOW_SECONDS
}

impl ProcessDefinition {
    /// Checks invariants serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.command.trim().is_empty() {
            return Err(ConfigError::InvalidDefinition {
                id: self.id.to_string(),
                reason: "command must not be empty".to_string(),
            });
        }
        if let Some(cwd) = &self.cwd {
            if !cwd.is_absolute() {
                return Err(ConfigError::InvalidDefinition {
                    id: self.id.to_string(),
                    reason: format!("cwd `{}` must be an absolute path", cwd.display()),
                });
            }
        }
        Ok(())
    }

    pub fn startable_on_current_platform(&self) -> bool {
        self.platform.map_or(true, |p| p.matches_current())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use rstest::rstest;

    pub(crate) fn sleep_definition(id: &str) -> ProcessDefinition {
        ProcessDefinition {
            id: id.to_string().try_into().unwrap(),
            name: format!("{} (sleep)", id),
            command: "sleep".to_string(),
            args: vec!["60".to_string()],
            cwd: None,
            env: HashMap::default(),
            auto_restart: false,
            max_restarts: DEFAULT_MAX_RESTARTS,
            restart_window_seconds: DEFAULT_RESTART_WINDOW_SECONDS,
            platform: None,
            stop_command: None,
            stop_args: Vec::default(),
            health_check: None,
        }
    }

    #[test]
    fn deserialize_applies_defaults() {
        let raw = r#"{"id":"worker","name":"Background Worker","command":"python"}"#;
        let def: ProcessDefinition = serde_json::from_str(raw).unwrap();

        assert_eq!(def.max_restarts, 3);
        assert_eq!(def.restart_window_seconds, 60);
        assert!(!def.auto_restart);
        assert!(def.args.is_empty());
        assert!(def.platform.is_none());
    }

    #[test]
    fn deserialize_accepts_restart_window_alias() {
        let raw = r#"{"id":"worker","name":"w","command":"python","restart_window":120}"#;
        let def: ProcessDefinition = serde_json::from_str(raw).unwrap();
        assert_eq!(def.restart_window_seconds, 120);
    }

    #[test]
    fn deserialize_rejects_empty_id() {
        let raw = r#"{"id":"  ","name":"w","command":"python"}"#;
        let result: Result<ProcessDefinition, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[test]
    fn deserialize_rejects_unknown_platform() {
        let raw = r#"{"id":"w","name":"w","command":"python","platform":"beos"}"#;
        let result: Result<ProcessDefinition, _> = serde_json::from_str(raw);
        assert!(result.is_err());
    }

    #[rstest]
    #[case::empty_command("", true)]
    #[case::valid_command("python", false)]
    fn validate_command(#[case] command: &str, #[case] expect_err: bool) {
        let mut def = sleep_definition("w");
        def.command = command.to_string();
        assert_eq!(def.validate().is_err(), expect_err);
    }

    #[test]
    fn validate_rejects_relative_cwd() {
        let mut def = sleep_definition("w");
        def.cwd = Some(PathBuf::from("relative/dir"));
        assert_matches!(def.validate(), Err(ConfigError::InvalidDefinition { .. }));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn platform_gate_on_linux() {
        let mut def = sleep_definition("w");
        assert!(def.startable_on_current_platform());

        def.platform = Some(Platform::Linux);
        assert!(def.startable_on_current_platform());

        def.platform = Some(Platform::Win32);
        assert!(!def.startable_on_current_platform());
    }
}
