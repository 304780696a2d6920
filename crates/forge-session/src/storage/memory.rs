//! In-memory session store.

use std::{collections::HashMap, sync::RwLock};

use async_trait::async_trait;
use forge_core::{
    Role,
    traits::{
        PersistenceError, RecordStatus, RecordUpdate, SessionRecord, SessionStore, StoredMessage,
    },
};
use serde_json::Value;

use super::now;

/// In-memory store implementation.
///
/// Useful for development and single-process deployments.
/// Data is lost on restart.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<HashMap<String, SessionRecord>>,
    messages: RwLock<HashMap<String, Vec<StoredMessage>>>,
    versions: RwLock<HashMap<(String, String), Vec<String>>>,
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Every saved version of a file, oldest first.
    ///
    /// # Errors
    /// Returns error if the store lock is poisoned.
    pub fn file_versions(&self, session_id: &str, path: &str) -> Result<Vec<String>, PersistenceError> {
        Ok(self
            .versions
            .read()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .get(&(session_id.to_string(), path.to_string()))
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn create_record(
        &self,
        session_id: &str,
        metadata: Value,
    ) -> Result<SessionRecord, PersistenceError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?;
        if records.contains_key(session_id) {
            return Err(PersistenceError::AlreadyExists(session_id.to_string()));
        }

        let timestamp = now();
        let record = SessionRecord {
            session_id: session_id.to_string(),
            sandbox_id: None,
            sandbox_url: None,
            status: RecordStatus::Created,
            metadata,
            created_at: timestamp,
            updated_at: timestamp,
        };
        records.insert(session_id.to_string(), record.clone());
        Ok(record)
    }

    async fn get_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        Ok(self
            .records
            .read()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .get(session_id)
            .cloned())
    }

    async fn update_record(
        &self,
        session_id: &str,
        update: RecordUpdate,
    ) -> Result<SessionRecord, PersistenceError> {
        let mut records = self
            .records
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?;
        let record = records
            .get_mut(session_id)
            .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))?;

        if let Some(sandbox_id) = update.sandbox_id {
            record.sandbox_id = Some(sandbox_id);
        }
        if let Some(sandbox_url) = update.sandbox_url {
            record.sandbox_url = Some(sandbox_url);
        }
        if let Some(status) = update.status {
            record.status = status;
        }
        if let Some(metadata) = update.metadata {
            record.metadata = metadata;
        }
        record.updated_at = now();
        Ok(record.clone())
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        message_type: &str,
    ) -> Result<(), PersistenceError> {
        self.messages
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .entry(session_id.to_string())
            .or_default()
            .push(StoredMessage {
                session_id: session_id.to_string(),
                role,
                content: content.to_string(),
                message_type: message_type.to_string(),
                created_at: now(),
            });
        Ok(())
    }

    async fn messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let messages = self
            .messages
            .read()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?;
        let all = messages.get(session_id).map(Vec::as_slice).unwrap_or_default();
        let skip = all.len().saturating_sub(limit);
        Ok(all[skip..].to_vec())
    }

    async fn save_file_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<u32, PersistenceError> {
        let mut versions = self
            .versions
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?;
        let history = versions
            .entry((session_id.to_string(), path.to_string()))
            .or_default();
        history.push(content.to_string());
        u32::try_from(history.len()).map_err(|e| PersistenceError::Failed(e.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, PersistenceError> {
        let existed = self
            .records
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .remove(session_id)
            .is_some();
        self.messages
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .remove(session_id);
        self.versions
            .write()
            .map_err(|e| PersistenceError::Failed(e.to_string()))?
            .retain(|(session, _), _| session != session_id);
        Ok(existed)
    }
}
