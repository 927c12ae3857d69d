use std::collections::HashSet;
use std::path::{Path, PathBuf};

use tracing::debug;

use super::definition::ProcessDefinition;
use super::ConfigError;

pub const CONFIG_FILE_ENV: &str = "NURVUS_CONFIG_FILE";
const DEFAULT_CONFIG_DIR: &str = ".nurvus";
const DEFAULT_CONFIG_FILE: &str = "processes.json";

/// Resolves the process definition file path: `NURVUS_CONFIG_FILE` wins,
/// otherwise `~/.nurvus/processes.json`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
        if !path.trim().is_empty() {
            return PathBuf::from(path);
        }
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(DEFAULT_CONFIG_DIR)
        .join(DEFAULT_CONFIG_FILE)
}

/// Loads and validates the declared process table from a JSON array file.
pub fn load_definitions(path: &Path) -> Result<Vec<ProcessDefinition>, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::FileRead {
        path: path.display().to_string(),
        source,
    })?;

    let definitions: Vec<ProcessDefinition> = serde_json::from_str(&content)?;

    let mut seen = HashSet::new();
    for def in &definitions {
        def.validate()?;
        if !seen.insert(def.id.clone()) {
            return Err(ConfigError::DuplicateId(def.id.to_string()));
        }
    }

    debug!(
        count = definitions.len(),
        path = %path.display(),
        "loaded process definitions"
    );
    Ok(definitions)
}
