//! Sandbox lifecycle: creation, reconnection, file transfer and cleanup.

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard},
    time::Duration,
};

use chrono::{DateTime, Utc};
use forge_core::{BindingStatus, FileMap, SandboxBinding};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    backend::{ExecOutput, ProvisionSpec, SandboxBackend},
    config::SandboxConfig,
    error::SandboxError,
    ports::PortPool,
};

/// Orchestrator bookkeeping for one live sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SandboxRecord {
    pub sandbox_id: String,
    pub name: String,
    pub session_id: String,
    pub port: u16,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
}

/// Derive the backend resource name for a session.
///
/// Characters a container runtime would reject are replaced with `-`.
#[must_use]
pub fn sandbox_name(session_id: &str, timestamp: i64) -> String {
    let safe: String = session_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
                c
            } else {
                '-'
            }
        })
        .collect();
    format!("sandbox-{safe}-{timestamp}")
}

/// Provisions and tracks sandboxes on a backend.
pub struct SandboxOrchestrator {
    backend: Arc<dyn SandboxBackend>,
    config: SandboxConfig,
    ports: PortPool,
    sandboxes: RwLock<HashMap<String, SandboxRecord>>,
}

impl SandboxOrchestrator {
    #[must_use]
    pub fn new(backend: Arc<dyn SandboxBackend>, config: SandboxConfig) -> Self {
        let ports = PortPool::new(
            config.port_range_start,
            config.port_range_end,
            config.probe_ports,
        );
        Self {
            backend,
            config,
            ports,
            sandboxes: RwLock::new(HashMap::new()),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &SandboxConfig {
        &self.config
    }

    #[must_use]
    pub fn backend(&self) -> &Arc<dyn SandboxBackend> {
        &self.backend
    }

    fn records(&self) -> RwLockReadGuard<'_, HashMap<String, SandboxRecord>> {
        self.sandboxes.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn records_mut(&self) -> RwLockWriteGuard<'_, HashMap<String, SandboxRecord>> {
        self.sandboxes.write().unwrap_or_else(PoisonError::into_inner)
    }

    fn binding(&self, record: &SandboxRecord) -> SandboxBinding {
        SandboxBinding {
            sandbox_id: record.sandbox_id.clone(),
            url: self.config.preview_url(record.port),
            port: record.port,
            status: BindingStatus::Active,
        }
    }

    /// Name that no live sandbox of this orchestrator already carries.
    fn unique_name(&self, session_id: &str, created_at: DateTime<Utc>) -> String {
        let base = sandbox_name(session_id, created_at.timestamp());
        let records = self.records();
        let taken = |name: &str| records.values().any(|r| r.name == name);
        if !taken(&base) {
            return base;
        }
        (1u32..)
            .map(|n| format!("{base}-{n}"))
            .find(|name| !taken(name))
            .unwrap_or(base)
    }

    /// Remove any leftover resource with this name, retrying with backoff.
    async fn remove_stale(&self, name: &str) {
        let attempts = self.config.removal_retries.max(1);
        let backoff = Duration::from_millis(self.config.removal_backoff_ms);

        for attempt in 1..=attempts {
            match self.backend.remove(name).await {
                Ok(true) => {
                    info!(%name, "Removed stale sandbox");
                    tokio::time::sleep(backoff / 2).await;
                    return;
                }
                Ok(false) => return,
                Err(e) => {
                    warn!(%name, attempt, error = %e, "Failed to remove stale sandbox");
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }
    }

    /// Provision a fresh sandbox for a session.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::CreationFailed` if no port is free or the
    /// backend fails to provision. The port is released in either case.
    pub async fn create(&self, session_id: &str) -> Result<SandboxBinding, SandboxError> {
        let created_at = Utc::now();
        let name = self.unique_name(session_id, created_at);
        self.remove_stale(&name).await;

        let port = self
            .ports
            .allocate()
            .map_err(|e| SandboxError::CreationFailed {
                session_id: session_id.to_string(),
                reason: e.to_string(),
            })?;

        let spec = ProvisionSpec {
            name: name.clone(),
            session_id: session_id.to_string(),
            host_port: port,
            image: self.config.image.clone(),
            working_dir: self.config.working_dir.clone(),
            container_port: self.config.container_port,
            preview_command: self.config.preview_command.clone(),
        };

        let sandbox_id = match self.backend.provision(&spec).await {
            Ok(id) => id,
            Err(e) => {
                error!(%session_id, %name, port, error = %e, "Failed to provision sandbox");
                if let Err(cleanup) = self.backend.remove(&name).await {
                    warn!(%name, error = %cleanup, "Cleanup after failed provision failed");
                }
                self.ports.release(port);
                return Err(SandboxError::CreationFailed {
                    session_id: session_id.to_string(),
                    reason: e.to_string(),
                });
            }
        };

        let record = SandboxRecord {
            sandbox_id: sandbox_id.clone(),
            name,
            session_id: session_id.to_string(),
            port,
            created_at,
            last_used: created_at,
        };
        let binding = self.binding(&record);
        self.records_mut().insert(sandbox_id.clone(), record);

        info!(
            %session_id,
            %sandbox_id,
            port,
            backend = %self.backend.kind(),
            "Created sandbox"
        );
        Ok(binding)
    }

    /// Rebind to a sandbox this orchestrator created.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` if the sandbox is unknown or gone.
    pub async fn connect(&self, sandbox_id: &str) -> Result<SandboxBinding, SandboxError> {
        let record = self
            .records()
            .get(sandbox_id)
            .cloned()
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))?;

        if !self.backend.exists(sandbox_id).await? {
            warn!(%sandbox_id, "Sandbox disappeared, dropping record");
            self.forget(sandbox_id);
            return Err(SandboxError::NotFound(sandbox_id.to_string()));
        }

        self.touch(sandbox_id).await;
        info!(%sandbox_id, session_id = %record.session_id, "Connected to sandbox");
        Ok(self.binding(&record))
    }

    /// Write files into the sandbox, creating parent directories.
    ///
    /// Files written before a failure stay written.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::UploadFailed` naming the failed path and the
    /// paths already written.
    pub async fn upload(&self, sandbox_id: &str, files: &FileMap) -> Result<(), SandboxError> {
        let mut written = Vec::with_capacity(files.len());
        for (path, content) in files {
            let target = self.config.resolve_path(path);
            if let Err(e) = self
                .backend
                .write_file(sandbox_id, &target, content.as_bytes())
                .await
            {
                error!(%sandbox_id, %path, error = %e, "Upload failed");
                return Err(SandboxError::UploadFailed {
                    sandbox_id: sandbox_id.to_string(),
                    path: path.clone(),
                    written,
                    reason: e.to_string(),
                });
            }
            debug!(%sandbox_id, %path, bytes = content.len(), "Uploaded file");
            written.push(path.clone());
        }

        self.touch(sandbox_id).await;
        Ok(())
    }

    /// Read files from the sandbox. Paths that cannot be read are omitted.
    pub async fn download(&self, sandbox_id: &str, paths: &[String]) -> BTreeMap<String, Vec<u8>> {
        let mut out = BTreeMap::new();
        for path in paths {
            let target = self.config.resolve_path(path);
            match self.backend.read_file(sandbox_id, &target).await {
                Ok(bytes) => {
                    out.insert(path.clone(), bytes);
                }
                Err(e) => debug!(%sandbox_id, %path, error = %e, "Skipping unreadable file"),
            }
        }
        self.touch(sandbox_id).await;
        out
    }

    /// Run a shell command in the sandbox.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::ExecFailed` if the command cannot be started.
    pub async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, SandboxError> {
        self.backend
            .exec(sandbox_id, command)
            .await
            .map_err(|e| SandboxError::ExecFailed {
                sandbox_id: sandbox_id.to_string(),
                reason: e.to_string(),
            })
    }

    /// Preview URL of a live sandbox.
    ///
    /// # Errors
    ///
    /// Returns `SandboxError::NotFound` for unknown sandboxes.
    pub fn url(&self, sandbox_id: &str) -> Result<String, SandboxError> {
        self.records()
            .get(sandbox_id)
            .map(|r| self.config.preview_url(r.port))
            .ok_or_else(|| SandboxError::NotFound(sandbox_id.to_string()))
    }

    /// Remove a sandbox and release its port.
    ///
    /// Returns whether anything was removed; removing twice is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the backend fails to remove an existing sandbox.
    pub async fn cleanup(&self, sandbox_id: &str) -> Result<bool, SandboxError> {
        let removed = self.backend.remove(sandbox_id).await?;
        let known = self.forget(sandbox_id);
        if removed || known {
            info!(%sandbox_id, "Cleaned up sandbox");
        }
        Ok(removed || known)
    }

    /// Snapshot of every tracked sandbox.
    #[must_use]
    pub fn live_sandboxes(&self) -> Vec<SandboxRecord> {
        let mut records: Vec<_> = self.records().values().cloned().collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    /// Bookkeeping record of one sandbox.
    #[must_use]
    pub fn record(&self, sandbox_id: &str) -> Option<SandboxRecord> {
        self.records().get(sandbox_id).cloned()
    }

    fn forget(&self, sandbox_id: &str) -> bool {
        let removed = self.records_mut().remove(sandbox_id);
        if let Some(record) = &removed {
            self.ports.release(record.port);
        }
        removed.is_some()
    }

    async fn touch(&self, sandbox_id: &str) {
        if let Some(record) = self.records_mut().get_mut(sandbox_id) {
            record.last_used = Utc::now();
        }
        if let Err(e) = self.backend.keep_alive(sandbox_id).await {
            debug!(%sandbox_id, error = %e, "Keep-alive failed");
        }
    }
}
