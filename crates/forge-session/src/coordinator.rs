//! Streaming edit coordinator.
//!
//! A feedback turn reads the sandbox code, streams cumulative partials from
//! the edit model, relays progress to the client, and commits the resulting
//! files in one upload once the stream is exhausted.
//!
//! Envelope order for a successful turn:
//! `update_in_progress, agent_partial*, agent_final, update_file*, update_completed`.
//! A failed turn ends with one `agent_final` carrying `{"error"}` and commits
//! nothing.

use std::{
    collections::HashSet,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use forge_core::{
    EditModel, EditRequest, FileMap, MessageType, ProjectSnapshot, ProtocolEnvelope,
    StreamError, envelope::correlation_id,
};
use forge_sandbox::SandboxError;
use futures::{Stream, StreamExt};
use serde_json::{Value, json};
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, error, info, warn};

use crate::registry::{RegistryError, SessionRegistry};

/// Coordinator error.
#[derive(Debug, thiserror::Error)]
pub enum CoordinatorError {
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Stream(#[from] StreamError),
}

/// Consumer side of one feedback turn.
///
/// Dropping it detaches the client; the turn still runs to completion.
pub struct TurnStream {
    rx: mpsc::Receiver<ProtocolEnvelope>,
    task: JoinHandle<()>,
}

impl TurnStream {
    /// Cancel the turn. Nothing is committed after this returns.
    pub fn abort(&self) {
        self.task.abort();
    }

    /// Whether the producer has finished.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Stream for TurnStream {
    type Item = ProtocolEnvelope;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

/// Sends a turn's envelopes; a detached client is not an error.
struct Emitter {
    tx: mpsc::Sender<ProtocolEnvelope>,
    session_id: String,
}

impl Emitter {
    async fn send(&self, envelope: ProtocolEnvelope) {
        if self.tx.send(envelope).await.is_err() {
            debug!(session_id = %self.session_id, "Client detached, dropping event");
        }
    }

    async fn emit(&self, kind: MessageType, data: Value) {
        self.send(ProtocolEnvelope::new(kind, data, &self.session_id))
            .await;
    }

    async fn emit_with_id(&self, id: &str, kind: MessageType, data: Value) {
        self.send(ProtocolEnvelope::with_id(id, kind, data, &self.session_id))
            .await;
    }

    async fn fail(&self, plan_id: &str, reason: impl std::fmt::Display) {
        error!(session_id = %self.session_id, error = %reason, "Turn failed");
        self.send(ProtocolEnvelope::error(plan_id, reason, &self.session_id))
            .await;
    }
}

/// Drives feedback turns and direct edits for every session.
#[derive(Clone)]
pub struct EditCoordinator {
    registry: Arc<SessionRegistry>,
    model: Arc<dyn EditModel>,
    buffer: usize,
}

impl EditCoordinator {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, model: Arc<dyn EditModel>) -> Self {
        Self {
            registry,
            model,
            buffer: 64,
        }
    }

    /// Capacity of each turn's envelope channel.
    #[must_use]
    pub fn with_buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity.max(1);
        self
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start a feedback turn and return its envelope stream.
    #[must_use]
    pub fn submit_feedback(&self, session_id: &str, feedback: &str) -> TurnStream {
        let (tx, rx) = mpsc::channel(self.buffer);
        let emitter = Emitter {
            tx,
            session_id: session_id.to_string(),
        };
        let this = self.clone();
        let feedback = feedback.to_string();
        let task = tokio::spawn(async move { this.run_turn(&emitter, &feedback).await });
        TurnStream { rx, task }
    }

    async fn run_turn(&self, out: &Emitter, feedback: &str) {
        let session_id = out.session_id.as_str();
        let guard = self.registry.turn_guard(session_id).await;
        out.emit(MessageType::UpdateInProgress, json!({})).await;

        let plan_id = correlation_id();
        let file_id = correlation_id();
        let _guard = match guard {
            Ok(guard) => guard,
            Err(e) => return out.fail(&plan_id, e).await,
        };
        info!(%session_id, "Turn started");

        let binding = match self.registry.resolve(session_id).await {
            Ok(binding) => binding,
            Err(e) => return out.fail(&plan_id, e).await,
        };
        let sandbox_id = binding.sandbox_id.as_str();

        let snapshot = match self.registry.orchestrator().load_code(sandbox_id).await {
            Ok(snapshot) => snapshot,
            Err(e) => return out.fail(&plan_id, e).await,
        };
        let history = self.registry.history(session_id).await;
        let request = EditRequest::new(history, feedback.to_string(), snapshot);

        let mut partials = match self.model.stream_edit(request).await {
            Ok(stream) => stream,
            Err(e) => return out.fail(&plan_id, e).await,
        };

        let mut plan: Option<String> = None;
        let mut files = FileMap::new();
        let mut seen = HashSet::new();
        let mut held: Vec<String> = Vec::new();

        while let Some(item) = partials.next().await {
            let partial = match item {
                Ok(partial) => partial,
                Err(e) => return out.fail(&plan_id, e).await,
            };

            if plan.is_none() {
                if partial.is_plan_complete() {
                    let text = partial.plan.value;
                    out.emit_with_id(&plan_id, MessageType::AgentFinal, json!({ "text": text }))
                        .await;
                    if let Err(e) = self.registry.append_exchange(session_id, feedback, &text).await
                    {
                        warn!(%session_id, error = %e, "Failed to record exchange");
                    }
                    for path in held.drain(..) {
                        emit_file_notice(out, &file_id, &path).await;
                    }
                    plan = Some(text);
                } else {
                    out.emit_with_id(
                        &plan_id,
                        MessageType::AgentPartial,
                        json!({ "text": partial.plan.value }),
                    )
                    .await;
                }
            }

            for file in partial.files {
                if seen.insert(file.path.clone()) {
                    if plan.is_some() {
                        emit_file_notice(out, &file_id, &file.path).await;
                    } else {
                        held.push(file.path.clone());
                    }
                }
                files.insert(file.path, file.content);
            }
        }

        if plan.is_none() {
            return out.fail(&plan_id, StreamError::Incomplete).await;
        }

        if !files.is_empty() {
            if let Err(e) = self.registry.orchestrator().upload(sandbox_id, &files).await {
                return out.fail(&plan_id, e).await;
            }
            self.save_versions(session_id, &files).await;
        }

        info!(%session_id, %sandbox_id, files = files.len(), "Turn committed");
        out.emit(MessageType::UpdateCompleted, json!({})).await;
    }

    async fn save_versions(&self, session_id: &str, files: &FileMap) {
        for (path, content) in files {
            match self
                .registry
                .store()
                .save_file_version(session_id, path, content)
                .await
            {
                Ok(version) => debug!(%session_id, %path, version, "Saved file version"),
                Err(e) => warn!(%session_id, %path, error = %e, "Failed to save file version"),
            }
        }
    }

    /// Current code of a session's sandbox.
    ///
    /// # Errors
    /// Returns error if the session is not bound or the code cannot be read.
    pub async fn load_code(&self, session_id: &str) -> Result<ProjectSnapshot, CoordinatorError> {
        let _guard = self.registry.turn_guard(session_id).await?;
        let binding = self.registry.resolve(session_id).await?;
        Ok(self
            .registry
            .orchestrator()
            .load_code(&binding.sandbox_id)
            .await?)
    }

    /// Commit client-supplied files directly.
    ///
    /// # Errors
    /// Returns error if the session is not bound or the upload fails.
    pub async fn edit_code(&self, session_id: &str, files: &FileMap) -> Result<(), CoordinatorError> {
        let _guard = self.registry.turn_guard(session_id).await?;
        let binding = self.registry.resolve(session_id).await?;
        self.registry
            .orchestrator()
            .upload(&binding.sandbox_id, files)
            .await?;
        self.save_versions(session_id, files).await;
        info!(%session_id, files = files.len(), "Applied direct edit");
        Ok(())
    }
}

async fn emit_file_notice(out: &Emitter, file_id: &str, path: &str) {
    out.emit_with_id(
        file_id,
        MessageType::UpdateFile,
        json!({ "text": format!("Working on {path}"), "path": path }),
    )
    .await;
}

#[cfg(all(test, feature = "memory"))]
mod tests {
    use std::time::Duration;

    use forge_core::{EditPartial, SessionStore};
    use forge_llm::{Script, ScriptedEditModel};
    use forge_sandbox::{MemoryBackend, SandboxConfig, SandboxOrchestrator};

    use super::*;
    use crate::storage::MemoryStore;

    struct Fixture {
        backend: Arc<MemoryBackend>,
        store: Arc<MemoryStore>,
        model: Arc<ScriptedEditModel>,
        coordinator: EditCoordinator,
    }

    fn fixture(model: ScriptedEditModel) -> Fixture {
        let backend = Arc::new(MemoryBackend::new());
        let config = SandboxConfig {
            probe_ports: false,
            removal_backoff_ms: 1,
            ..SandboxConfig::default()
        };
        let orchestrator = Arc::new(SandboxOrchestrator::new(backend.clone(), config));
        let store = Arc::new(MemoryStore::new());
        let registry = Arc::new(SessionRegistry::new(orchestrator, store.clone()));
        let model = Arc::new(model);
        let coordinator = EditCoordinator::new(registry, model.clone());
        Fixture {
            backend,
            store,
            model,
            coordinator,
        }
    }

    impl Fixture {
        async fn init(&self, files: &[(&str, &str)]) -> String {
            let binding = self.coordinator.registry().init("s1").await.unwrap().binding;
            let files: FileMap = files
                .iter()
                .map(|(p, c)| ((*p).to_string(), (*c).to_string()))
                .collect();
            self.coordinator
                .registry()
                .orchestrator()
                .upload(&binding.sandbox_id, &files)
                .await
                .unwrap();
            binding.sandbox_id
        }

        async fn read(&self, sandbox_id: &str, path: &str) -> Option<String> {
            self.coordinator
                .registry()
                .orchestrator()
                .download(sandbox_id, &[path.to_string()])
                .await
                .remove(path)
                .map(|b| String::from_utf8(b).unwrap())
        }
    }

    fn kinds(envelopes: &[ProtocolEnvelope]) -> Vec<MessageType> {
        envelopes.iter().map(|e| e.kind).collect()
    }

    #[tokio::test]
    async fn test_add_a_header_end_to_end() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::planning("Adding"),
            EditPartial::complete("Added a header")
                .with_file("/app/src/App.tsx", "<header/><empty/>"),
        ])]));
        let sandbox_id = f.init(&[("/app/src/App.tsx", "<empty/>")]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "add a header").collect().await;
        assert_eq!(
            kinds(&envelopes),
            [
                MessageType::UpdateInProgress,
                MessageType::AgentPartial,
                MessageType::AgentFinal,
                MessageType::UpdateFile,
                MessageType::UpdateCompleted,
            ]
        );
        assert_eq!(envelopes[2].text(), Some("Added a header"));
        assert_eq!(envelopes[3].text(), Some("Working on /app/src/App.tsx"));
        assert_eq!(envelopes[3].data["path"], "/app/src/App.tsx");
        assert!(envelopes.iter().all(|e| e.session_id == "s1"));

        assert_eq!(
            f.read(&sandbox_id, "/app/src/App.tsx").await.as_deref(),
            Some("<header/><empty/>")
        );

        let request = &f.model.requests()[0];
        assert_eq!(request.feedback, "add a header");
        assert_eq!(request.files[0].path, "/app/src/App.tsx");
        assert_eq!(request.files[0].content, "<empty/>");

        let history = f.coordinator.registry().history("s1").await;
        assert_eq!(history.len(), 2);
        assert_eq!(history[1].content, "Added a header");
        assert_eq!(
            f.store.file_versions("s1", "/app/src/App.tsx").unwrap(),
            ["<header/><empty/>"]
        );
    }

    #[tokio::test]
    async fn test_correlation_ids() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::planning("A"),
            EditPartial::planning("Ad"),
            EditPartial::complete("Add").with_file("a.ts", "1"),
            EditPartial::complete("Add")
                .with_file("a.ts", "1")
                .with_file("b.ts", "2"),
        ])]));
        f.init(&[]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        let ids = |kind: MessageType| -> Vec<&str> {
            envelopes
                .iter()
                .filter(|e| e.kind == kind)
                .map(|e| e.id.as_str())
                .collect()
        };

        let plan_ids: Vec<_> = ids(MessageType::AgentPartial)
            .into_iter()
            .chain(ids(MessageType::AgentFinal))
            .collect();
        let file_ids = ids(MessageType::UpdateFile);
        assert_eq!(plan_ids.len(), 3);
        assert_eq!(file_ids.len(), 2);
        assert!(plan_ids.iter().all(|id| *id == plan_ids[0]));
        assert!(file_ids.iter().all(|id| *id == file_ids[0]));
        assert_ne!(plan_ids[0], file_ids[0]);
        assert!(envelopes.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    }

    #[tokio::test]
    async fn test_last_write_wins_with_single_notice() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::complete("Edit").with_file("P.tsx", "v1"),
            EditPartial::complete("Edit").with_file("P.tsx", "v2"),
            EditPartial::complete("Edit").with_file("P.tsx", "v3"),
        ])]));
        let sandbox_id = f.init(&[]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        let notices = envelopes
            .iter()
            .filter(|e| e.kind == MessageType::UpdateFile)
            .count();
        assert_eq!(notices, 1);
        assert_eq!(f.read(&sandbox_id, "P.tsx").await.as_deref(), Some("v3"));
    }

    #[tokio::test]
    async fn test_early_file_notices_follow_final() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::planning("Work").with_file("a.ts", "1"),
            EditPartial::complete("Done").with_file("a.ts", "2"),
        ])]));
        f.init(&[]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        assert_eq!(
            kinds(&envelopes),
            [
                MessageType::UpdateInProgress,
                MessageType::AgentPartial,
                MessageType::AgentFinal,
                MessageType::UpdateFile,
                MessageType::UpdateCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_edit_still_completes() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::complete("Nothing to change"),
        ])]));
        f.init(&[]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "noop").collect().await;
        assert_eq!(
            kinds(&envelopes),
            [
                MessageType::UpdateInProgress,
                MessageType::AgentFinal,
                MessageType::UpdateCompleted,
            ]
        );
    }

    #[tokio::test]
    async fn test_stream_failure_discards_edits() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::planning("Adding").with_file("App.tsx", "<broken"),
        ])
        .then_fail("connection reset")]));
        let sandbox_id = f.init(&[("App.tsx", "<empty/>")]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        assert_eq!(
            kinds(&envelopes),
            [
                MessageType::UpdateInProgress,
                MessageType::AgentPartial,
                MessageType::AgentFinal,
            ]
        );
        let last = envelopes.last().unwrap();
        assert!(last.error_message().unwrap().contains("connection reset"));
        assert_eq!(last.id, envelopes[1].id);
        assert_eq!(f.read(&sandbox_id, "App.tsx").await.as_deref(), Some("<empty/>"));
        assert!(f.coordinator.registry().history("s1").await.is_empty());
    }

    #[tokio::test]
    async fn test_stream_without_complete_plan_fails() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::planning("Half").with_file("a.ts", "x"),
        ])]));
        let sandbox_id = f.init(&[]).await;

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        let last = envelopes.last().unwrap();
        assert_eq!(last.kind, MessageType::AgentFinal);
        assert!(last.error_message().is_some());
        assert!(!envelopes.iter().any(|e| e.kind == MessageType::UpdateCompleted));
        assert!(f.read(&sandbox_id, "a.ts").await.is_none());
    }

    #[tokio::test]
    async fn test_unbound_session_gets_error() {
        let f = fixture(ScriptedEditModel::default());
        let envelopes: Vec<_> = f.coordinator.submit_feedback("ghost", "hi").collect().await;
        assert_eq!(
            kinds(&envelopes),
            [MessageType::UpdateInProgress, MessageType::AgentFinal]
        );
        assert!(envelopes[1].error_message().is_some());
    }

    #[tokio::test]
    async fn test_model_unavailable_keeps_binding() {
        let f = fixture(ScriptedEditModel::new([Script::Unavailable("quota".into())]));
        f.init(&[]).await;
        let before = f.coordinator.registry().resolve("s1").await.unwrap();

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        assert!(envelopes.last().unwrap().error_message().unwrap().contains("quota"));
        assert_eq!(f.coordinator.registry().resolve("s1").await.unwrap(), before);
    }

    #[tokio::test]
    async fn test_upload_failure_reports_error() {
        let f = fixture(ScriptedEditModel::new([Script::partials([
            EditPartial::complete("Edit")
                .with_file("a.ts", "1")
                .with_file("b.ts", "2"),
        ])]));
        f.init(&[]).await;
        f.backend.fail_writes_to("/app/b.ts");

        let envelopes: Vec<_> = f.coordinator.submit_feedback("s1", "go").collect().await;
        let last = envelopes.last().unwrap();
        assert_eq!(last.kind, MessageType::AgentFinal);
        assert!(last.error_message().unwrap().contains("b.ts"));
        assert!(!envelopes.iter().any(|e| e.kind == MessageType::UpdateCompleted));
        assert!(f.store.file_versions("s1", "a.ts").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_detached_client_does_not_cancel_turn() {
        let f = fixture(
            ScriptedEditModel::new([Script::partials([
                EditPartial::planning("Working"),
                EditPartial::complete("Done").with_file("a.ts", "committed"),
            ])])
            .with_delay(Duration::from_millis(10)),
        );
        let sandbox_id = f.init(&[]).await;

        drop(f.coordinator.submit_feedback("s1", "go"));

        let mut committed = None;
        for _ in 0..100 {
            committed = f.read(&sandbox_id, "a.ts").await;
            if committed.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(committed.as_deref(), Some("committed"));
    }

    #[tokio::test]
    async fn test_abort_prevents_commit() {
        let f = fixture(
            ScriptedEditModel::new([Script::partials([
                EditPartial::planning("Working"),
                EditPartial::complete("Done").with_file("a.ts", "never"),
            ])])
            .with_delay(Duration::from_millis(50)),
        );
        let sandbox_id = f.init(&[]).await;

        let mut turn = f.coordinator.submit_feedback("s1", "go");
        assert_eq!(turn.next().await.unwrap().kind, MessageType::UpdateInProgress);
        turn.abort();
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(turn.is_finished());
        assert!(f.read(&sandbox_id, "a.ts").await.is_none());
    }

    #[tokio::test]
    async fn test_turns_for_one_session_are_serialized() {
        let f = fixture(
            ScriptedEditModel::new([
                Script::partials([EditPartial::complete("first").with_file("a.ts", "1")]),
                Script::partials([EditPartial::complete("second").with_file("a.ts", "2")]),
            ])
            .with_delay(Duration::from_millis(20)),
        );
        f.init(&[]).await;

        let first = f.coordinator.submit_feedback("s1", "one");
        tokio::time::sleep(Duration::from_millis(5)).await;
        let second = f.coordinator.submit_feedback("s1", "two");
        let (first, second): (Vec<_>, Vec<_>) = tokio::join!(first.collect(), second.collect());

        let first_done = first.last().unwrap();
        assert_eq!(first_done.kind, MessageType::UpdateCompleted);
        assert!(second[0].timestamp > first_done.timestamp);

        let history = f.coordinator.registry().history("s1").await;
        assert_eq!(history[0].content, "one");
        assert_eq!(history[2].content, "two");
        assert_eq!(f.model.requests()[1].history.len(), 2);
    }

    #[tokio::test]
    async fn test_forget_and_reinit_waits_for_running_turn() {
        let f = fixture(
            ScriptedEditModel::new([
                Script::partials([
                    EditPartial::planning("fir"),
                    EditPartial::complete("first").with_file("a.ts", "1"),
                ]),
                Script::partials([EditPartial::complete("second").with_file("a.ts", "2")]),
            ])
            .with_delay(Duration::from_millis(30)),
        );
        let sandbox_id = f.init(&[]).await;

        let mut first = f.coordinator.submit_feedback("s1", "one");
        let started = first.next().await.unwrap();
        assert_eq!(started.kind, MessageType::UpdateInProgress);
        assert_eq!(first.next().await.unwrap().kind, MessageType::AgentPartial);

        let registry = f.coordinator.registry();
        registry.forget("s1").await.unwrap();
        assert_eq!(registry.init("s1").await.unwrap().binding.sandbox_id, sandbox_id);
        let second = f.coordinator.submit_feedback("s1", "two");

        let (first, second): (Vec<_>, Vec<_>) = tokio::join!(first.collect(), second.collect());
        let first_done = first.last().unwrap();
        assert_eq!(first_done.kind, MessageType::UpdateCompleted);
        assert_eq!(second[0].kind, MessageType::UpdateInProgress);
        assert!(second[0].timestamp > first_done.timestamp);
        assert_eq!(second.last().unwrap().kind, MessageType::UpdateCompleted);
        assert_eq!(f.read(&sandbox_id, "a.ts").await.as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_load_and_edit_code() {
        let f = fixture(ScriptedEditModel::default());
        f.init(&[("/app/src/main.tsx", "main")]).await;

        let mut edits = FileMap::new();
        edits.insert("/app/src/App.tsx".into(), "<app/>".into());
        f.coordinator.edit_code("s1", &edits).await.unwrap();

        let snapshot = f.coordinator.load_code("s1").await.unwrap();
        assert_eq!(snapshot.files.len(), 2);
        assert_eq!(snapshot.files["/app/src/App.tsx"], "<app/>");
        assert_eq!(
            f.store
                .save_file_version("s1", "/app/src/App.tsx", "again")
                .await
                .unwrap(),
            2
        );

        assert!(matches!(
            f.coordinator.load_code("ghost").await,
            Err(CoordinatorError::Registry(RegistryError::NotBound(_)))
        ));
    }
}
