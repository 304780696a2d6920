//! Server configuration loaded from TOML.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use forge_sandbox::SandboxConfig;
use serde::{Deserialize, Serialize};

fn data_dir() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("forge")
}

/// Default location of the config file.
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("forge")
        .join("config.toml")
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerSection,
    pub sandbox: SandboxConfig,
    pub model: ModelSection,
    pub persistence: PersistenceSection,
    pub projects: ProjectsSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerSection {
    pub bind: String,
    /// Capacity of each turn's envelope channel.
    pub turn_buffer: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: "0.0.0.0:8000".to_string(),
            turn_buffer: 64,
        }
    }
}

/// External process that streams edit partials.
///
/// `command` is required; the server refuses to start without it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSection {
    pub command: Option<String>,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSection {
    pub store: StoreKind,
    pub database_path: PathBuf,
    /// Messages restored into a session's history.
    pub history_limit: usize,
}

impl Default for PersistenceSection {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            database_path: data_dir().join("sessions.db"),
            history_limit: 100,
        }
    }
}

impl PersistenceSection {
    /// SQLite connection URL, creating the file if missing.
    #[must_use]
    pub fn database_url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.database_path.display())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProjectsSection {
    pub root: PathBuf,
}

impl Default for ProjectsSection {
    fn default() -> Self {
        Self {
            root: data_dir().join("projects"),
        }
    }
}

impl Config {
    /// Read a config file.
    ///
    /// # Errors
    /// Returns error if the file cannot be read or parsed.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config {}", path.display()))?;
        toml::from_str(&content).with_context(|| format!("Invalid config {}", path.display()))
    }

    /// Load from `path`, or from the default location when present.
    ///
    /// # Errors
    /// Returns error if an explicitly given file cannot be loaded.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = default_config_path();
        if default_path.exists() {
            Self::load(&default_path).or_else(|e| {
                tracing::warn!("Ignoring {}: {e:#}", default_path.display());
                Ok(Self::default())
            })
        } else {
            tracing::info!("Using default configuration");
            Ok(Self::default())
        }
    }
}

#[cfg(test)]
mod tests {
    use forge_sandbox::BackendKind;

    use super::*;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config: Config = toml::from_str(
            r#"
            [server]
            bind = "127.0.0.1:9000"

            [sandbox]
            backend = "docker"
            port_range_start = 4000

            [model]
            command = "python3 -m edit_model"
            args = ["--stream"]

            [persistence]
            store = "sqlite"
            database_path = "/tmp/forge.db"
            "#,
        )
        .unwrap();

        assert_eq!(config.server.bind, "127.0.0.1:9000");
        assert_eq!(config.server.turn_buffer, 64);
        assert_eq!(config.sandbox.backend, BackendKind::Docker);
        assert_eq!(config.sandbox.port_range_start, 4000);
        assert_eq!(config.sandbox.working_dir, "/app");
        assert_eq!(config.model.args, ["--stream"]);
        assert_eq!(config.persistence.store, StoreKind::Sqlite);
        assert_eq!(
            config.persistence.database_url(),
            "sqlite:///tmp/forge.db?mode=rwc"
        );
        assert_eq!(config.persistence.history_limit, 100);
    }

    #[test]
    fn test_load_reports_bad_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[server]\nbind = 42\n").unwrap();
        assert!(Config::load(&path).is_err());
        assert!(Config::resolve(Some(&dir.path().join("missing.toml"))).is_err());

        std::fs::write(&path, "").unwrap();
        let config = Config::resolve(Some(&path)).unwrap();
        assert_eq!(config.server.bind, "0.0.0.0:8000");
    }
}
