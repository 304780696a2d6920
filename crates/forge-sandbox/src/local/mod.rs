//! Host-directory sandbox backend.
//!
//! Each sandbox is a directory under a root; sandbox paths map below it, so
//! `/app/src/App.tsx` lives at `<root>/<name>/app/src/App.tsx`. The preview
//! server runs as a child process of this service.

pub mod shell;

use std::{
    collections::HashMap,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::{process::Command, sync::Mutex};
use tracing::{debug, info, warn};

use crate::{
    backend::{ExecOutput, ProvisionSpec, SandboxBackend, path_components},
    config::BackendKind,
    error::BackendError,
};

pub use shell::{get_shell_command, resolve_executable_path};

struct LocalSandbox {
    working_dir: PathBuf,
    preview: Option<tokio::process::Child>,
}

/// Sandbox backend backed by host directories.
pub struct LocalBackend {
    root: PathBuf,
    template: Option<PathBuf>,
    sandboxes: Mutex<HashMap<String, LocalSandbox>>,
}

impl LocalBackend {
    #[must_use]
    pub fn new(root: PathBuf, template: Option<PathBuf>) -> Self {
        Self {
            root,
            template,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    fn sandbox_dir(&self, sandbox_id: &str) -> Result<PathBuf, BackendError> {
        if sandbox_id.is_empty()
            || sandbox_id.starts_with('.')
            || sandbox_id.contains(['/', '\\'])
        {
            return Err(BackendError::InvalidPath(sandbox_id.to_string()));
        }
        Ok(self.root.join(sandbox_id))
    }

    fn host_path(&self, sandbox_id: &str, path: &str) -> Result<PathBuf, BackendError> {
        let mut host = self.sandbox_dir(sandbox_id)?;
        for part in path_components(path)? {
            host.push(part);
        }
        Ok(host)
    }

    async fn require(&self, sandbox_id: &str) -> Result<PathBuf, BackendError> {
        let dir = self.sandbox_dir(sandbox_id)?;
        if tokio::fs::try_exists(&dir).await? {
            Ok(dir)
        } else {
            Err(BackendError::NotFound(sandbox_id.to_string()))
        }
    }

    async fn start_preview(
        command_line: &str,
        working_dir: &Path,
    ) -> Option<tokio::process::Child> {
        let program = shell::program_of(command_line)?;
        if resolve_executable_path(&program).await.is_none() {
            warn!(%program, "Preview program not found, skipping preview server");
            return None;
        }

        let (shell_cmd, shell_arg) = get_shell_command();
        let spawned = Command::new(shell_cmd)
            .arg(shell_arg)
            .arg(command_line)
            .current_dir(working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn();

        match spawned {
            Ok(child) => Some(child),
            Err(e) => {
                warn!(error = %e, "Failed to start preview server");
                None
            }
        }
    }
}

async fn copy_tree(from: &Path, to: &Path) -> std::io::Result<()> {
    let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
    while let Some((src, dst)) = pending.pop() {
        tokio::fs::create_dir_all(&dst).await?;
        let mut entries = tokio::fs::read_dir(&src).await?;
        while let Some(entry) = entries.next_entry().await? {
            let target = dst.join(entry.file_name());
            if entry.file_type().await?.is_dir() {
                if entry.file_name() != "node_modules" {
                    pending.push((entry.path(), target));
                }
            } else {
                tokio::fs::copy(entry.path(), target).await?;
            }
        }
    }
    Ok(())
}

async fn walk_files(dir: &Path) -> std::io::Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        let mut entries = tokio::fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }
    files.sort();
    Ok(files)
}

#[async_trait]
impl SandboxBackend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<String, BackendError> {
        let dir = self.sandbox_dir(&spec.name)?;
        if tokio::fs::try_exists(&dir).await? {
            return Err(BackendError::Other(format!(
                "sandbox directory already exists: {}",
                dir.display()
            )));
        }

        let working_dir = self.host_path(&spec.name, &spec.working_dir)?;
        tokio::fs::create_dir_all(&working_dir).await?;
        if let Some(template) = &self.template {
            copy_tree(template, &working_dir).await?;
        }

        let preview = match &spec.preview_command {
            Some(command) => {
                let command = command.replace("{port}", &spec.host_port.to_string());
                Self::start_preview(&command, &working_dir).await
            }
            None => None,
        };

        info!(
            sandbox = %spec.name,
            dir = %dir.display(),
            preview = preview.is_some(),
            "Provisioned local sandbox"
        );

        self.sandboxes.lock().await.insert(
            spec.name.clone(),
            LocalSandbox {
                working_dir,
                preview,
            },
        );
        Ok(spec.name.clone())
    }

    async fn remove(&self, name_or_id: &str) -> Result<bool, BackendError> {
        let dir = self.sandbox_dir(name_or_id)?;
        if let Some(mut sandbox) = self.sandboxes.lock().await.remove(name_or_id) {
            if let Some(child) = sandbox.preview.as_mut() {
                if let Err(e) = child.kill().await {
                    debug!(error = %e, "Preview server already exited");
                }
            }
        }

        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, sandbox_id: &str) -> Result<bool, BackendError> {
        let dir = self.sandbox_dir(sandbox_id)?;
        Ok(tokio::fs::try_exists(dir).await?)
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), BackendError> {
        self.require(sandbox_id).await?;
        let target = self.host_path(sandbox_id, path)?;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, BackendError> {
        let target = self.host_path(sandbox_id, path)?;
        match tokio::fs::read(&target).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(BackendError::NotFound(path.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>, BackendError> {
        let base = self.require(sandbox_id).await?;
        let dir = self.host_path(sandbox_id, root)?;
        if !tokio::fs::try_exists(&dir).await? {
            return Ok(Vec::new());
        }

        let files = walk_files(&dir).await?;
        Ok(files
            .iter()
            .filter_map(|file| file.strip_prefix(&base).ok())
            .map(|rel| {
                let parts: Vec<_> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                format!("/{}", parts.join("/"))
            })
            .collect())
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, BackendError> {
        let base = self.require(sandbox_id).await?;
        let working_dir = self
            .sandboxes
            .lock()
            .await
            .get(sandbox_id)
            .map_or(base, |s| s.working_dir.clone());

        let (shell_cmd, shell_arg) = get_shell_command();
        let output = Command::new(shell_cmd)
            .arg(shell_arg)
            .arg(command)
            .current_dir(&working_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output()
            .await?;

        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            exit_code: output.status.code().map_or(-1, i64::from),
        })
    }
}
