//! SQLite session store (feature-gated).

use async_trait::async_trait;
use forge_core::{
    Role,
    traits::{
        PersistenceError, RecordStatus, RecordUpdate, SessionRecord, SessionStore, StoredMessage,
    },
};
use serde_json::Value;
use sqlx::{
    Row,
    sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow},
};
use tracing::debug;

use super::now;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS sessions (
        session_id TEXT PRIMARY KEY,
        sandbox_id TEXT,
        sandbox_url TEXT,
        status TEXT NOT NULL,
        metadata TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        session_id TEXT NOT NULL,
        role TEXT NOT NULL,
        content TEXT NOT NULL,
        message_type TEXT NOT NULL,
        created_at INTEGER NOT NULL
    )",
    "CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, id)",
    "CREATE TABLE IF NOT EXISTS file_versions (
        session_id TEXT NOT NULL,
        path TEXT NOT NULL,
        version INTEGER NOT NULL,
        content TEXT NOT NULL,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (session_id, path, version)
    )",
];

fn db_err(e: sqlx::Error) -> PersistenceError {
    PersistenceError::Failed(e.to_string())
}

/// SQLite store implementation.
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Connect and create the schema if missing.
    ///
    /// # Errors
    /// Returns error if database connection or schema creation fails.
    pub async fn new(database_url: &str) -> Result<Self, PersistenceError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await
            .map_err(db_err)?;
        Self::with_pool(pool).await
    }

    /// Use an existing pool.
    ///
    /// # Errors
    /// Returns error if schema creation fails.
    pub async fn with_pool(pool: SqlitePool) -> Result<Self, PersistenceError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(db_err)?;
        }
        debug!("Session store schema ready");
        Ok(Self { pool })
    }

    fn row_to_record(row: &SqliteRow) -> Result<SessionRecord, PersistenceError> {
        let status: String = row.try_get("status").map_err(db_err)?;
        let metadata: String = row.try_get("metadata").map_err(db_err)?;
        Ok(SessionRecord {
            session_id: row.try_get("session_id").map_err(db_err)?,
            sandbox_id: row.try_get("sandbox_id").map_err(db_err)?,
            sandbox_url: row.try_get("sandbox_url").map_err(db_err)?,
            status: status.parse()?,
            metadata: serde_json::from_str(&metadata)
                .map_err(|e| PersistenceError::Failed(e.to_string()))?,
            created_at: row.try_get("created_at").map_err(db_err)?,
            updated_at: row.try_get("updated_at").map_err(db_err)?,
        })
    }
}

fn parse_role(role: &str) -> Result<Role, PersistenceError> {
    match role {
        "user" => Ok(Role::User),
        "assistant" => Ok(Role::Assistant),
        other => Err(PersistenceError::Failed(format!("unknown role: {other}"))),
    }
}

#[async_trait]
impl SessionStore for SqliteStore {
    async fn create_record(
        &self,
        session_id: &str,
        metadata: Value,
    ) -> Result<SessionRecord, PersistenceError> {
        let timestamp = now();
        let result = sqlx::query(
            "INSERT INTO sessions (session_id, status, metadata, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(RecordStatus::Created.as_str())
        .bind(metadata.to_string())
        .bind(timestamp)
        .bind(timestamp)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => Ok(SessionRecord {
                session_id: session_id.to_string(),
                sandbox_id: None,
                sandbox_url: None,
                status: RecordStatus::Created,
                metadata,
                created_at: timestamp,
                updated_at: timestamp,
            }),
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                Err(PersistenceError::AlreadyExists(session_id.to_string()))
            }
            Err(e) => Err(db_err(e)),
        }
    }

    async fn get_record(&self, session_id: &str) -> Result<Option<SessionRecord>, PersistenceError> {
        let row = sqlx::query("SELECT * FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_err)?;
        row.as_ref().map(Self::row_to_record).transpose()
    }

    async fn update_record(
        &self,
        session_id: &str,
        update: RecordUpdate,
    ) -> Result<SessionRecord, PersistenceError> {
        let result = sqlx::query(
            "UPDATE sessions SET
                sandbox_id = COALESCE(?, sandbox_id),
                sandbox_url = COALESCE(?, sandbox_url),
                status = COALESCE(?, status),
                metadata = COALESCE(?, metadata),
                updated_at = ?
             WHERE session_id = ?",
        )
        .bind(update.sandbox_id)
        .bind(update.sandbox_url)
        .bind(update.status.map(RecordStatus::as_str))
        .bind(update.metadata.map(|m| m.to_string()))
        .bind(now())
        .bind(session_id)
        .execute(&self.pool)
        .await
        .map_err(db_err)?;

        if result.rows_affected() == 0 {
            return Err(PersistenceError::NotFound(session_id.to_string()));
        }
        self.get_record(session_id)
            .await?
            .ok_or_else(|| PersistenceError::NotFound(session_id.to_string()))
    }

    async fn append_message(
        &self,
        session_id: &str,
        role: Role,
        content: &str,
        message_type: &str,
    ) -> Result<(), PersistenceError> {
        sqlx::query(
            "INSERT INTO messages (session_id, role, content, message_type, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(role.as_str())
        .bind(content)
        .bind(message_type)
        .bind(now())
        .execute(&self.pool)
        .await
        .map_err(db_err)?;
        Ok(())
    }

    async fn messages(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, PersistenceError> {
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);
        let rows = sqlx::query(
            "SELECT * FROM (
                SELECT * FROM messages WHERE session_id = ? ORDER BY id DESC LIMIT ?
             ) ORDER BY id ASC",
        )
        .bind(session_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(db_err)?;

        rows.iter()
            .map(|row| -> Result<StoredMessage, PersistenceError> {
                let role: String = row.try_get("role").map_err(db_err)?;
                Ok(StoredMessage {
                    session_id: row.try_get("session_id").map_err(db_err)?,
                    role: parse_role(&role)?,
                    content: row.try_get("content").map_err(db_err)?,
                    message_type: row.try_get("message_type").map_err(db_err)?,
                    created_at: row.try_get("created_at").map_err(db_err)?,
                })
            })
            .collect()
    }

    async fn save_file_version(
        &self,
        session_id: &str,
        path: &str,
        content: &str,
    ) -> Result<u32, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        let current: Option<i64> = sqlx::query_scalar(
            "SELECT MAX(version) FROM file_versions WHERE session_id = ? AND path = ?",
        )
        .bind(session_id)
        .bind(path)
        .fetch_one(&mut *tx)
        .await
        .map_err(db_err)?;
        let version = current.unwrap_or(0) + 1;

        sqlx::query(
            "INSERT INTO file_versions (session_id, path, version, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(session_id)
        .bind(path)
        .bind(version)
        .bind(content)
        .bind(now())
        .execute(&mut *tx)
        .await
        .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;

        u32::try_from(version).map_err(|e| PersistenceError::Failed(e.to_string()))
    }

    async fn delete_session(&self, session_id: &str) -> Result<bool, PersistenceError> {
        let mut tx = self.pool.begin().await.map_err(db_err)?;
        for table in ["messages", "file_versions"] {
            sqlx::query(&format!("DELETE FROM {table} WHERE session_id = ?"))
                .bind(session_id)
                .execute(&mut *tx)
                .await
                .map_err(db_err)?;
        }
        let deleted = sqlx::query("DELETE FROM sessions WHERE session_id = ?")
            .bind(session_id)
            .execute(&mut *tx)
            .await
            .map_err(db_err)?;
        tx.commit().await.map_err(db_err)?;
        Ok(deleted.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    async fn store() -> SqliteStore {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        SqliteStore::with_pool(pool).await.unwrap()
    }

    #[tokio::test]
    async fn test_record_roundtrip() {
        let store = store().await;
        store
            .create_record("s1", json!({ "initialized_at": "2024-01-01T00:00:00Z" }))
            .await
            .unwrap();
        assert!(matches!(
            store.create_record("s1", Value::Null).await,
            Err(PersistenceError::AlreadyExists(_))
        ));

        let updated = store
            .update_record(
                "s1",
                RecordUpdate {
                    sandbox_id: Some("sb-1".into()),
                    sandbox_url: Some("http://localhost:3100".into()),
                    status: Some(RecordStatus::Active),
                    metadata: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.status, RecordStatus::Active);
        assert_eq!(updated.sandbox_url.as_deref(), Some("http://localhost:3100"));
        assert_eq!(
            updated.metadata["initialized_at"],
            "2024-01-01T00:00:00Z"
        );

        assert!(store.get_record("missing").await.unwrap().is_none());
        assert!(matches!(
            store.update_record("missing", RecordUpdate::default()).await,
            Err(PersistenceError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_messages_limit_oldest_first() {
        let store = store().await;
        store.append_message("s1", Role::User, "add a header", "USER").await.unwrap();
        store
            .append_message("s1", Role::Assistant, "Added a header", "AGENT_FINAL")
            .await
            .unwrap();
        store.append_message("s1", Role::User, "make it blue", "USER").await.unwrap();

        let messages = store.messages("s1", 2).await.unwrap();
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, Role::Assistant);
        assert_eq!(messages[0].message_type, "AGENT_FINAL");
        assert_eq!(messages[1].content, "make it blue");
    }

    #[tokio::test]
    async fn test_file_versioning() {
        let store = store().await;
        assert_eq!(store.save_file_version("s1", "App.tsx", "a").await.unwrap(), 1);
        assert_eq!(store.save_file_version("s1", "App.tsx", "b").await.unwrap(), 2);
        assert_eq!(store.save_file_version("s2", "App.tsx", "c").await.unwrap(), 1);

        store.create_record("s1", Value::Null).await.unwrap();
        assert!(store.delete_session("s1").await.unwrap());
        assert_eq!(store.save_file_version("s1", "App.tsx", "d").await.unwrap(), 1);
        assert!(!store.delete_session("nope").await.unwrap());
    }
}
