//! Session registry: session to sandbox bindings and conversation history.

use std::{collections::HashMap, sync::Arc};

use chrono::{DateTime, Utc};
use forge_core::{
    BindingStatus, ConversationTurn, Role, SandboxBinding,
    traits::{PersistenceError, RecordStatus, RecordUpdate, SessionId, SessionStore},
};
use forge_sandbox::{SandboxError, SandboxOrchestrator};
use serde::Serialize;
use serde_json::json;
use tokio::sync::{Mutex, OwnedMutexGuard, RwLock};
use tracing::{debug, error, info, warn};

/// Message type of persisted user feedback.
pub const USER_MESSAGE_TYPE: &str = "USER";
/// Message type of persisted final plans.
pub const AGENT_FINAL_MESSAGE_TYPE: &str = "AGENT_FINAL";

/// Registry error.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Session has no sandbox: {0}")]
    NotBound(SessionId),
    #[error("Session not found: {0}")]
    NotFound(SessionId),
    #[error(transparent)]
    Sandbox(#[from] SandboxError),
    #[error(transparent)]
    Persistence(#[from] PersistenceError),
}

/// Result of `SessionRegistry::init`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitOutcome {
    pub binding: SandboxBinding,
    /// Whether a usable sandbox existed before this call.
    pub preexisting: bool,
}

/// Point-in-time view of a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStatus {
    pub session_id: SessionId,
    pub has_sandbox: bool,
    pub status: BindingStatus,
    pub sandbox: Option<SandboxBinding>,
    pub history_length: usize,
    pub created_at: DateTime<Utc>,
}

struct SessionState {
    binding: Option<SandboxBinding>,
    status: BindingStatus,
    history: Vec<ConversationTurn>,
    created_at: DateTime<Utc>,
}

/// Per-session entry. `state` serializes initialization.
struct SessionSlot {
    state: Mutex<SessionState>,
}

/// Tracks which sandbox serves each session.
pub struct SessionRegistry {
    orchestrator: Arc<SandboxOrchestrator>,
    store: Arc<dyn SessionStore>,
    sessions: RwLock<HashMap<SessionId, Arc<SessionSlot>>>,
    /// Turn locks outlive their session entry while a turn holds them.
    turns: RwLock<HashMap<SessionId, Arc<Mutex<()>>>>,
    history_limit: usize,
}

impl SessionRegistry {
    /// Create a new registry.
    #[must_use]
    pub fn new(orchestrator: Arc<SandboxOrchestrator>, store: Arc<dyn SessionStore>) -> Self {
        Self {
            orchestrator,
            store,
            sessions: RwLock::new(HashMap::new()),
            turns: RwLock::new(HashMap::new()),
            history_limit: 100,
        }
    }

    /// Number of persisted messages restored into a new session entry.
    #[must_use]
    pub const fn with_history_limit(mut self, limit: usize) -> Self {
        self.history_limit = limit;
        self
    }

    #[must_use]
    pub fn orchestrator(&self) -> &Arc<SandboxOrchestrator> {
        &self.orchestrator
    }

    #[must_use]
    pub fn store(&self) -> &Arc<dyn SessionStore> {
        &self.store
    }

    async fn slot(&self, session_id: &str) -> Option<Arc<SessionSlot>> {
        self.sessions.read().await.get(session_id).cloned()
    }

    async fn restore_history(&self, session_id: &str) -> Vec<ConversationTurn> {
        match self.store.messages(session_id, self.history_limit).await {
            Ok(messages) => messages
                .into_iter()
                .map(|m| ConversationTurn {
                    role: m.role,
                    content: m.content,
                })
                .collect(),
            Err(e) => {
                warn!(%session_id, error = %e, "Failed to restore conversation history");
                Vec::new()
            }
        }
    }

    async fn slot_or_insert(&self, session_id: &str) -> Arc<SessionSlot> {
        if let Some(slot) = self.slot(session_id).await {
            return slot;
        }

        let history = self.restore_history(session_id).await;
        let mut sessions = self.sessions.write().await;
        Arc::clone(sessions.entry(session_id.to_string()).or_insert_with(|| {
            debug!(%session_id, restored = history.len(), "Registered session");
            Arc::new(SessionSlot {
                state: Mutex::new(SessionState {
                    binding: None,
                    status: BindingStatus::Absent,
                    history,
                    created_at: Utc::now(),
                }),
            })
        }))
    }

    /// Bind a session to a sandbox.
    ///
    /// Reuses an active binding, otherwise reconnects to the sandbox recorded
    /// in the store and falls back to creating a new one.
    ///
    /// # Errors
    /// Returns error if a new sandbox cannot be created.
    pub async fn init(&self, session_id: &str) -> Result<InitOutcome, RegistryError> {
        let slot = self.slot_or_insert(session_id).await;
        let mut state = slot.state.lock().await;

        if let Some(binding) = state.binding.as_ref().filter(|b| b.is_active()) {
            debug!(%session_id, "Session already bound");
            return Ok(InitOutcome {
                binding: binding.clone(),
                preexisting: true,
            });
        }

        state.status = BindingStatus::Creating;
        let record = match self.store.get_record(session_id).await {
            Ok(record) => record,
            Err(e) => {
                warn!(%session_id, error = %e, "Failed to read session record");
                None
            }
        };

        let reconnected = match record.as_ref().and_then(|r| r.sandbox_id.as_deref()) {
            Some(sandbox_id) => match self.orchestrator.connect(sandbox_id).await {
                Ok(binding) => {
                    info!(%session_id, %sandbox_id, "Reconnected to existing sandbox");
                    Some(binding)
                }
                Err(e) => {
                    warn!(
                        %session_id,
                        %sandbox_id,
                        error = %e,
                        "Failed to reconnect to existing sandbox, creating new one"
                    );
                    None
                }
            },
            None => None,
        };

        let preexisting = reconnected.is_some();
        let binding = match reconnected {
            Some(binding) => binding,
            None => match self.orchestrator.create(session_id).await {
                Ok(binding) => binding,
                Err(e) => {
                    error!(%session_id, error = %e, "Failed to create sandbox");
                    state.status = BindingStatus::Error;
                    self.persist_binding(session_id, record.is_some(), None).await;
                    return Err(e.into());
                }
            },
        };

        state.binding = Some(binding.clone());
        state.status = BindingStatus::Active;
        drop(state);

        self.persist_binding(session_id, record.is_some(), Some(&binding))
            .await;
        info!(
            %session_id,
            sandbox_id = %binding.sandbox_id,
            url = %binding.url,
            preexisting,
            "Session initialized"
        );
        Ok(InitOutcome {
            binding,
            preexisting,
        })
    }

    async fn persist_binding(
        &self,
        session_id: &str,
        has_record: bool,
        binding: Option<&SandboxBinding>,
    ) {
        if !has_record {
            let metadata = json!({ "initialized_at": Utc::now().to_rfc3339() });
            match self.store.create_record(session_id, metadata).await {
                Ok(_) | Err(PersistenceError::AlreadyExists(_)) => {}
                Err(e) => {
                    warn!(%session_id, error = %e, "Failed to create session record");
                    return;
                }
            }
        }

        let update = match binding {
            Some(binding) => RecordUpdate {
                sandbox_id: Some(binding.sandbox_id.clone()),
                sandbox_url: Some(binding.url.clone()),
                status: Some(RecordStatus::Active),
                metadata: None,
            },
            None => RecordUpdate {
                status: Some(RecordStatus::Error),
                ..RecordUpdate::default()
            },
        };
        if let Err(e) = self.store.update_record(session_id, update).await {
            warn!(%session_id, error = %e, "Failed to update session record");
        }
    }

    /// Active binding of a session.
    ///
    /// # Errors
    /// Returns `RegistryError::NotBound` unless `init` succeeded.
    pub async fn resolve(&self, session_id: &str) -> Result<SandboxBinding, RegistryError> {
        let slot = self
            .slot(session_id)
            .await
            .ok_or_else(|| RegistryError::NotBound(session_id.to_string()))?;
        let state = slot.state.lock().await;
        state
            .binding
            .clone()
            .filter(SandboxBinding::is_active)
            .ok_or_else(|| RegistryError::NotBound(session_id.to_string()))
    }

    /// Exclusive turn access for a session, held until the guard drops.
    ///
    /// # Errors
    /// Returns `RegistryError::NotBound` for unknown sessions.
    pub async fn turn_guard(&self, session_id: &str) -> Result<OwnedMutexGuard<()>, RegistryError> {
        if self.slot(session_id).await.is_none() {
            return Err(RegistryError::NotBound(session_id.to_string()));
        }
        let turn = Arc::clone(
            self.turns
                .write()
                .await
                .entry(session_id.to_string())
                .or_default(),
        );
        Ok(turn.lock_owned().await)
    }

    /// Drop the in-memory entry of a session. The sandbox is left running.
    ///
    /// Returns the binding the session had, if any.
    ///
    /// # Errors
    /// Returns `RegistryError::NotFound` for unknown sessions.
    pub async fn forget(&self, session_id: &str) -> Result<Option<SandboxBinding>, RegistryError> {
        let slot = self
            .sessions
            .write()
            .await
            .remove(session_id)
            .ok_or_else(|| RegistryError::NotFound(session_id.to_string()))?;
        {
            let mut turns = self.turns.write().await;
            if turns
                .get(session_id)
                .is_some_and(|turn| Arc::strong_count(turn) == 1)
            {
                turns.remove(session_id);
            }
        }
        let binding = slot.state.lock().await.binding.clone();
        info!(%session_id, "Forgot session");
        Ok(binding)
    }

    /// Snapshot of a session.
    pub async fn status(&self, session_id: &str) -> Option<SessionStatus> {
        let slot = self.slot(session_id).await?;
        let state = slot.state.lock().await;
        Some(SessionStatus {
            session_id: session_id.to_string(),
            has_sandbox: state.binding.as_ref().is_some_and(SandboxBinding::is_active),
            status: state.status,
            sandbox: state.binding.clone(),
            history_length: state.history.len(),
            created_at: state.created_at,
        })
    }

    /// Ids of every known session.
    pub async fn sessions(&self) -> Vec<SessionId> {
        let mut ids: Vec<_> = self.sessions.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Finalized conversation of a session, oldest first.
    pub async fn history(&self, session_id: &str) -> Vec<ConversationTurn> {
        match self.slot(session_id).await {
            Some(slot) => slot.state.lock().await.history.clone(),
            None => Vec::new(),
        }
    }

    /// Record one finalized exchange. Persistence failures are logged.
    ///
    /// # Errors
    /// Returns `RegistryError::NotBound` for unknown sessions.
    pub async fn append_exchange(
        &self,
        session_id: &str,
        feedback: &str,
        plan: &str,
    ) -> Result<(), RegistryError> {
        let slot = self
            .slot(session_id)
            .await
            .ok_or_else(|| RegistryError::NotBound(session_id.to_string()))?;
        {
            let mut state = slot.state.lock().await;
            state.history.push(ConversationTurn::user(feedback));
            state.history.push(ConversationTurn::assistant(plan));
        }

        let messages = [
            (Role::User, feedback, USER_MESSAGE_TYPE),
            (Role::Assistant, plan, AGENT_FINAL_MESSAGE_TYPE),
        ];
        for (role, content, message_type) in messages {
            if let Err(e) = self
                .store
                .append_message(session_id, role, content, message_type)
                .await
            {
                warn!(%session_id, error = %e, "Failed to persist conversation message");
            }
        }
        Ok(())
    }
}
