//! In-process sandbox backend.

use std::{
    collections::{BTreeMap, HashMap, HashSet},
    sync::{Mutex, MutexGuard, PoisonError},
};

use async_trait::async_trait;
use uuid::Uuid;

use crate::{
    backend::{ExecOutput, ProvisionSpec, SandboxBackend, path_components},
    config::BackendKind,
    error::BackendError,
};

#[derive(Debug, Default)]
struct MemorySandbox {
    name: String,
    files: BTreeMap<String, Vec<u8>>,
    commands: Vec<String>,
    touches: usize,
}

#[derive(Debug, Default)]
struct MemoryState {
    sandboxes: HashMap<String, MemorySandbox>,
    fail_provisions: usize,
    fail_removals: usize,
    failing_writes: HashSet<String>,
    provisions: Vec<ProvisionSpec>,
}

/// Sandbox backend that keeps file trees in memory.
///
/// Supports failure injection so orchestration paths can be exercised.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<MemoryState>,
}

impl MemoryBackend {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Fail the next `count` provision calls.
    pub fn fail_provisions(&self, count: usize) {
        self.state().fail_provisions = count;
    }

    /// Fail the next `count` remove calls.
    pub fn fail_removals(&self, count: usize) {
        self.state().fail_removals = count;
    }

    /// Fail every write to `path`.
    pub fn fail_writes_to(&self, path: impl Into<String>) {
        self.state().failing_writes.insert(path.into());
    }

    /// Drop a sandbox behind the orchestrator's back.
    pub fn destroy(&self, sandbox_id: &str) -> bool {
        self.state().sandboxes.remove(sandbox_id).is_some()
    }

    /// Seed a pre-existing resource with the given name.
    pub fn seed(&self, name: impl Into<String>) -> String {
        let id = format!("mem-{}", Uuid::new_v4());
        self.state().sandboxes.insert(
            id.clone(),
            MemorySandbox {
                name: name.into(),
                ..MemorySandbox::default()
            },
        );
        id
    }

    /// Number of live sandboxes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state().sandboxes.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every provision request seen so far.
    #[must_use]
    pub fn provisions(&self) -> Vec<ProvisionSpec> {
        self.state().provisions.clone()
    }

    /// Commands executed in a sandbox.
    #[must_use]
    pub fn commands(&self, sandbox_id: &str) -> Vec<String> {
        self.state()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.commands.clone())
            .unwrap_or_default()
    }

    /// How many times a sandbox was kept alive.
    #[must_use]
    pub fn touches(&self, sandbox_id: &str) -> usize {
        self.state()
            .sandboxes
            .get(sandbox_id)
            .map_or(0, |s| s.touches)
    }

    /// Snapshot of a sandbox's files.
    #[must_use]
    pub fn files(&self, sandbox_id: &str) -> BTreeMap<String, Vec<u8>> {
        self.state()
            .sandboxes
            .get(sandbox_id)
            .map(|s| s.files.clone())
            .unwrap_or_default()
    }
}

fn normalize(path: &str) -> Result<String, BackendError> {
    Ok(format!("/{}", path_components(path)?.join("/")))
}

#[async_trait]
impl SandboxBackend for MemoryBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Memory
    }

    async fn provision(&self, spec: &ProvisionSpec) -> Result<String, BackendError> {
        let mut state = self.state();
        state.provisions.push(spec.clone());
        if state.fail_provisions > 0 {
            state.fail_provisions -= 1;
            return Err(BackendError::Other("provision failure injected".into()));
        }
        if state.sandboxes.values().any(|s| s.name == spec.name) {
            return Err(BackendError::Other(format!(
                "name already in use: {}",
                spec.name
            )));
        }

        let id = format!("mem-{}", Uuid::new_v4());
        let mut sandbox = MemorySandbox {
            name: spec.name.clone(),
            ..MemorySandbox::default()
        };
        if let Some(command) = &spec.preview_command {
            sandbox
                .commands
                .push(command.replace("{port}", &spec.container_port.to_string()));
        }
        state.sandboxes.insert(id.clone(), sandbox);
        Ok(id)
    }

    async fn remove(&self, name_or_id: &str) -> Result<bool, BackendError> {
        let mut state = self.state();
        if state.fail_removals > 0 {
            state.fail_removals -= 1;
            return Err(BackendError::Other("removal failure injected".into()));
        }
        let before = state.sandboxes.len();
        state
            .sandboxes
            .retain(|id, sandbox| id != name_or_id && sandbox.name != name_or_id);
        Ok(state.sandboxes.len() != before)
    }

    async fn exists(&self, sandbox_id: &str) -> Result<bool, BackendError> {
        Ok(self.state().sandboxes.contains_key(sandbox_id))
    }

    async fn write_file(
        &self,
        sandbox_id: &str,
        path: &str,
        content: &[u8],
    ) -> Result<(), BackendError> {
        let path = normalize(path)?;
        let mut state = self.state();
        if state.failing_writes.contains(&path) {
            return Err(BackendError::Other(format!("write failure injected: {path}")));
        }
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))?;
        sandbox.files.insert(path, content.to_vec());
        Ok(())
    }

    async fn read_file(&self, sandbox_id: &str, path: &str) -> Result<Vec<u8>, BackendError> {
        let path = normalize(path)?;
        let state = self.state();
        let sandbox = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))?;
        sandbox
            .files
            .get(&path)
            .cloned()
            .ok_or(BackendError::NotFound(path))
    }

    async fn list_files(&self, sandbox_id: &str, root: &str) -> Result<Vec<String>, BackendError> {
        let root = normalize(root)?;
        let prefix = format!("{}/", root.trim_end_matches('/'));
        let state = self.state();
        let sandbox = state
            .sandboxes
            .get(sandbox_id)
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))?;
        Ok(sandbox
            .files
            .keys()
            .filter(|path| path.starts_with(&prefix))
            .cloned()
            .collect())
    }

    async fn exec(&self, sandbox_id: &str, command: &str) -> Result<ExecOutput, BackendError> {
        let mut state = self.state();
        let sandbox = state
            .sandboxes
            .get_mut(sandbox_id)
            .ok_or_else(|| BackendError::NotFound(sandbox_id.to_string()))?;
        sandbox.commands.push(command.to_string());
        Ok(ExecOutput::default())
    }

    async fn keep_alive(&self, sandbox_id: &str) -> Result<(), BackendError> {
        if let Some(sandbox) = self.state().sandboxes.get_mut(sandbox_id) {
            sandbox.touches += 1;
        }
        Ok(())
    }
}
