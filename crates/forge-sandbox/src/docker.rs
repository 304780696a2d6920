//! Docker sandbox backend.
//!
//! Containers run `tail -f /dev/null` to stay alive; the preview server is
//! started with a detached exec. Files cross the boundary as tar archives.

use std::{collections::HashMap, io::Read};

use async_trait::async_trait;
use bollard::{
    Docker,
    container::{
        Config, CreateContainerOptions, DownloadFromContainerOptions, InspectContainerOptions,
        LogOutput, RemoveContainerOptions, StartContainerOptions, UploadToContainerOptions,
    },
    exec::{CreateExecOptions, StartExecOptions, StartExecResults},
    models::{ContainerInspectResponse, HostConfig, PortBinding},
};
use futures::StreamExt;
use tracing::{debug, info, warn};

use crate::{
    backend::{ExecOutput, ProvisionSpec, SandboxBackend, path_components},
    config::BackendKind,
    error::BackendError,
};

const LABEL_PREFIX: &str = "forge.sandbox";
/// Reported when the daemon does not know an exec's exit code.
const UNKNOWN_EXIT_CODE: i64 = -1;

/// Sandbox backend that runs one container per sandbox.
pub struct DockerBackend {
    client: Docker,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    ///
    /// # Errors
    ///
    /// Returns an error if the daemon socket cannot be configured.
    pub fn connect() -> Result<Self, BackendError> {
        let client = Docker::connect_with_local_defaults()?;
        Ok(Self { client })
    }

    #[must_use]
    pub const fn with_client(client: Docker) -> Self {
        Self { client }
    }

    async fn start_preview(&self, container_id: &str, spec: &ProvisionSpec) {
        let Some(command) = &spec.preview_command else {
            return;
        };
        let command = command.replace("{port}", &spec.container_port.to_string());
        let exec = CreateExecOptions {
            cmd: Some(vec!["sh".to_string(), "-c".to_string(), command]),
            working_dir: Some(spec.working_dir.clone()),
            attach_stdout: Some(false),
            attach_stderr: Some(false),
            ..Default::default()
        };

        let started = async {
            let exec = self.client.create_exec(container_id, exec).await?;
            self.client
                .start_exec(
                    &exec.id,
                    Some(StartExecOptions {
                        detach: true,
                        ..Default::default()
                    }),
                )
                .await
        }
        .await;

        if let Err(e) = started {
            warn!(container = %container_id, error = %e, "Failed to start preview server");
        }
    }
}

fn is_not_found(error: &bollard::errors::Error) -> bool {
    matches!(
        error,
        bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            ..
        }
    )
}

/// Container configuration for a sandbox.
pub(crate) fn container_config(spec: &ProvisionSpec) -> Config<String> {
    let labels = HashMap::from([
        (format!("{LABEL_PREFIX}.managed"), "true".to_string()),
        (format!("{LABEL_PREFIX}.session"), spec.session_id.clone()),
    ]);

    let container_port = format!("{}/tcp", spec.container_port);
    let binding = vec![PortBinding {
        host_ip: Some("0.0.0.0".to_string()),
        host_port: Some(spec.host_port.to_string()),
    }];

    Config {
        image: Some(spec.image.clone()),
        cmd: Some(vec![
            "tail".to_string(),
            "-f".to_string(),
            "/dev/null".to_string(),
        ]),
        working_dir: Some(spec.working_dir.clone()),
        labels: Some(labels),
        exposed_ports: Some(HashMap::from([(container_port.clone(), HashMap::new())])),
        host_config: Some(HostConfig {
            port_bindings: Some(HashMap::from([(container_port, Some(binding))])),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Tar archive holding one file plus its ancestor directories, rooted at `/`.
pub(crate) fn pack_file(path: &str, content: &[u8]) -> Result<Vec<u8>, BackendError> {
    let parts = path_components(path)?;
    let Some((_, dirs)) = parts.split_last() else {
        return Err(BackendError::InvalidPath(path.to_string()));
    };

    let mut archive = tar::Builder::new(Vec::new());
    for depth in 1..=dirs.len() {
        let mut header = tar::Header::new_gnu();
        header.set_entry_type(tar::EntryType::Directory);
        header.set_mode(0o755);
        header.set_size(0);
        archive.append_data(&mut header, dirs[..depth].join("/"), std::io::empty())?;
    }

    let mut header = tar::Header::new_gnu();
    header.set_mode(0o644);
    header.set_size(content.len() as u64);
    archive.append_data(&mut header, parts.join("/"), content)?;

    archive.into_inner().map_err(BackendError::from)
}

/// Contents of the first regular file in a tar archive.
pub(crate) fn unpack_file(data: &[u8]) -> Result<Vec<u8>, BackendError> {
    let mut archive = tar::Archive::new(data);
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(BackendError::Other("archive holds no file".into()))
}

#[async_trait]
impl SandboxBackend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<String, BackendError> {
        let options = CreateContainerOptions {
            name: spec.name.clone(),
            platform: None,
        };
        let created = self
            .client
            .create_container(Some(options), container_config(spec))
            .await?;

        if let Err(e) = self
            .client
            .start_container(&created.id, None::<StartContainerOptions<String>>)
            .await
        {
            if let Err(cleanup) = self.remove(&created.id).await {
                warn!(container = %created.id, error = %cleanup, "Cleanup after failed start failed");
            }
            return Err(e.into());
        }

        self.start_preview(&created.id, spec).await;
        info!(
            container = %created.id,
            name = %spec.name,
            port = spec.host_port,
            "Started sandbox container"
        );
        Ok(created.id)
    }

    async fn remove(&self, name_or_id: &str) -> Result<bool, BackendError> {
        let options = RemoveContainerOptions {
            force: true,
            v: true,
            ..Default::default()
        };
        match self.client.remove_container(name_or_id, Some(options)).await {
            Ok(()) => Ok(true),
            Err(e) if is_not_found(&e) => {
                debug!(container = %name_or_id, "Container already removed");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, sandbox_id: &str) -> Result<bool, BackendError> {
        match self
            .client
            .inspect_container(sandbox_id, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => {
                let running = is_running(&inspect);
                if !running {
                    debug!(container = %sandbox_id, "Container exists but is not running");
                }
                Ok(running)
            }
            Err(e) if is_not_found(&e) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), BackendError> {
        let archive = pack_file(path, content)?;
        let options = UploadToContainerOptions {
            path: "/".to_string(),
            ..Default::default()
        };
        self.client
            .upload_to_container(sandbox_id, Some(options), archive.into())
            .await?;
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, BackendError> {
        path_components(path)?;
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self
            .client
            .download_from_container(sandbox_id, Some(options));

        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            match chunk {
                Ok(bytes) => data.extend_from_slice(&bytes),
                Err(e) if is_not_found(&e) => return Err(BackendError::NotFound(path.to_string())),
                Err(e) => return Err(e.into()),
            }
        }
        unpack_file(&data)
    }

    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>, BackendError> {
        path_components(root)?;
        let quoted = shlex::try_quote(root)
            .map_err(|_| BackendError::InvalidPath(root.to_string()))?;
        let output = self
            .exec(sandbox_id, &format!("find {quoted} -type f 2>/dev/null"))
            .await?;

        let mut files: Vec<String> = output
            .stdout
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(ToString::to_string)
            .collect();
        files.sort();
        Ok(files)
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, BackendError> {
        let exec = CreateExecOptions {
            cmd: Some(vec![
                "sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ]),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let exec = self.client.create_exec(sandbox_id, exec).await?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        match self.client.start_exec(&exec.id, None).await? {
            StartExecResults::Attached { mut output, .. } => {
                while let Some(msg) = output.next().await {
                    match msg? {
                        LogOutput::StdOut { message } | LogOutput::Console { message } => {
                            stdout.extend_from_slice(&message);
                        }
                        LogOutput::StdErr { message } => stderr.extend_from_slice(&message),
                        LogOutput::StdIn { .. } => {}
                    }
                }
            }
            StartExecResults::Detached => {
                return Err(BackendError::Other("exec was detached unexpectedly".into()));
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await?;
        Ok(ExecOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: exit_code_or_unknown(sandbox_id, inspect.exit_code),
        })
    }
}

fn exit_code_or_unknown(sandbox_id: &str, code: Option<i64>) -> i64 {
    code.unwrap_or_else(|| {
        warn!(container = %sandbox_id, "Exec exit code unavailable");
        UNKNOWN_EXIT_CODE
    })
}

/// Only a running container can serve a preview.
fn is_running(inspect: &ContainerInspectResponse) -> bool {
    inspect
        .state
        .as_ref()
        .and_then(|state| state.running)
        .unwrap_or(false)
}
