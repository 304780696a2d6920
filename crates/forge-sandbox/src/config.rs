//! Sandbox configuration.

use std::{fmt, path::PathBuf, str::FromStr};

use serde::{Deserialize, Serialize};

/// Which backend provisions sandboxes.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    Memory,
    #[default]
    Local,
    Docker,
}

impl BackendKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Local => "local",
            Self::Docker => "docker",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackendKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "local" => Ok(Self::Local),
            "docker" => Ok(Self::Docker),
            other => Err(format!("unknown sandbox backend: {other}")),
        }
    }
}

/// Sandbox orchestration settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    pub backend: BackendKind,
    /// Container image (Docker backend).
    pub image: String,
    /// Project root inside the sandbox.
    pub working_dir: String,
    /// Port the preview server listens on inside a container.
    pub container_port: u16,
    /// Host used to build preview URLs.
    pub public_host: String,
    /// First host port handed out.
    pub port_range_start: u16,
    /// Last host port handed out, inclusive.
    pub port_range_end: u16,
    /// Skip ports the OS refuses to bind.
    pub probe_ports: bool,
    /// Preview server command. `{port}` is replaced with the listening port.
    pub preview_command: Option<String>,
    /// Root directory of local sandboxes.
    pub local_root: PathBuf,
    /// Project template copied into new local sandboxes.
    pub template_dir: Option<PathBuf>,
    /// Attempts at removing a stale resource before provisioning.
    pub removal_retries: u32,
    /// Delay between removal attempts.
    pub removal_backoff_ms: u64,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            image: "forge-sandbox:latest".to_string(),
            working_dir: "/app".to_string(),
            container_port: 3000,
            public_host: "localhost".to_string(),
            port_range_start: 3100,
            port_range_end: 3999,
            probe_ports: true,
            preview_command: Some("npm run dev -- --host 0.0.0.0 --port {port}".to_string()),
            local_root: default_local_root(),
            template_dir: None,
            removal_retries: 3,
            removal_backoff_ms: 2000,
        }
    }
}

impl SandboxConfig {
    /// Directory holding editable sources.
    #[must_use]
    pub fn source_root(&self) -> String {
        format!("{}/src", self.working_dir.trim_end_matches('/'))
    }

    /// Path of the package manifest.
    #[must_use]
    pub fn manifest_path(&self) -> String {
        format!("{}/package.json", self.working_dir.trim_end_matches('/'))
    }

    /// Absolute sandbox path for a client-supplied path.
    ///
    /// Relative paths are taken relative to the working directory.
    #[must_use]
    pub fn resolve_path(&self, path: &str) -> String {
        if path.starts_with('/') {
            path.to_string()
        } else {
            format!(
                "{}/{}",
                self.working_dir.trim_end_matches('/'),
                path.trim_start_matches("./")
            )
        }
    }

    /// Preview URL for a host port.
    #[must_use]
    pub fn preview_url(&self, port: u16) -> String {
        format!("http://{}:{port}", self.public_host)
    }
}

fn default_local_root() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("forge")
        .join("sandboxes")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = SandboxConfig::default();
        assert_eq!(config.port_range_start, 3100);
        assert_eq!(config.container_port, 3000);
        assert_eq!(config.source_root(), "/app/src");
        assert_eq!(config.manifest_path(), "/app/package.json");
        assert_eq!(config.preview_url(3101), "http://localhost:3101");
    }

    #[test]
    fn test_resolve_path() {
        let config = SandboxConfig::default();
        assert_eq!(config.resolve_path("App.tsx"), "/app/App.tsx");
        assert_eq!(config.resolve_path("./src/a.ts"), "/app/src/a.ts");
        assert_eq!(config.resolve_path("/app/src/a.ts"), "/app/src/a.ts");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SandboxConfig =
            serde_json::from_str(r#"{"backend":"docker","port_range_start":4000}"#).unwrap();
        assert_eq!(config.backend, BackendKind::Docker);
        assert_eq!(config.port_range_start, 4000);
        assert_eq!(config.removal_retries, 3);
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("Docker".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert!("k8s".parse::<BackendKind>().is_err());
    }
}
