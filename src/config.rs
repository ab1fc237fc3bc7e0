use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::model::ModeFlags;

/// Client-side defaults read from `harness.toml` at the project root
/// (§6a). Purely a convenience for the CLI: the daemon only ever
/// receives a fully resolved `AgentConfig` over the socket, never a
/// config file path.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct HarnessConfig {
    #[serde(default)]
    pub defaults: Defaults,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Defaults {
    #[serde(default = "default_target_branch")]
    pub target_branch: String,
    #[serde(default)]
    pub mode_flags: ModeFlags,
    /// The AI subprocess command line, e.g. `["claude", "--print"]`.
    #[serde(default)]
    pub command: Option<Vec<String>>,
}

impl Default for Defaults {
    fn default() -> Self {
        Defaults {
            target_branch: default_target_branch(),
            mode_flags: ModeFlags::default(),
            command: None,
        }
    }
}

fn default_target_branch() -> String {
    "main".to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read harness.toml: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse harness.toml: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("failed to serialize harness.toml: {0}")]
    Serialize(#[from] toml::ser::Error),
}

impl HarnessConfig {
    pub fn load(project_dir: &Path) -> Result<Self, ConfigError> {
        let path = project_dir.join("harness.toml");
        let content = std::fs::read_to_string(&path)?;
        let config: HarnessConfig = toml::from_str(&content)?;
        Ok(config)
    }

    /// Same as `load`, but falls back to defaults when the file is
    /// simply absent (CLI flags are still authoritative on top of this).
    pub fn load_or_default(project_dir: &Path) -> Self {
        match Self::load(project_dir) {
            Ok(config) => config,
            Err(ConfigError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                tracing::warn!(error = %e, "ignoring malformed harness.toml, using defaults");
                Self::default()
            }
        }
    }

    pub fn save(&self, project_dir: &Path) -> Result<(), ConfigError> {
        let path = project_dir.join("harness.toml");
        let content = toml::to_string_pretty(self)?;
        std::fs::write(&path, content)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn load_or_default_falls_back_when_missing() {
        let dir = tempfile::tempdir().unwrap();
        let config = HarnessConfig::load_or_default(dir.path());
        assert_eq!(config.defaults.target_branch, "main");
    }

    #[test]
    fn save_then_load_roundtrips() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = HarnessConfig::default();
        config.defaults.target_branch = "develop".into();
        config.defaults.command = Some(vec!["codex".into(), "exec".into()]);
        config.save(dir.path()).unwrap();

        let loaded = HarnessConfig::load(dir.path()).unwrap();
        assert_eq!(loaded, config);
    }
}
