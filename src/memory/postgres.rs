//! Postgres-backed message and memory stores
//!
//! Message parts are stored as serialized JSON text; arrival order is the
//! `seq` column, which an upsert never changes. Deleted ids are kept in
//! `archived_messages` so a resent history cannot bring them back.

use crate::error::AgentError;
use crate::memory::store::{MemoryStore, MessageStore};
use crate::models::{MemoryEntry, Message, MessageMetadata, MessagePart, MessageRole};
use crate::Result;
use sqlx::{PgPool, Row};
use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::warn;
use uuid::Uuid;

/// Shared pool plus lazy schema initialisation
#[derive(Clone)]
pub struct PgBackend {
    pool: PgPool,
    schema_ready: Arc<OnceCell<()>>,
}

impl PgBackend {
    /// Build a lazily-connecting pool. No I/O happens until first use.
    pub fn connect_lazy(url: &str) -> Result<Self> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(5)
            .connect_lazy(url)
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to create postgres pool: {}", e))
            })?;

        Ok(Self {
            pool,
            schema_ready: Arc::new(OnceCell::new()),
        })
    }

    async fn ensure_schema(&self) -> Result<()> {
        self.schema_ready
            .get_or_try_init(|| async {
                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS conversation_messages (
                      seq BIGSERIAL PRIMARY KEY,
                      conversation_id TEXT NOT NULL,
                      message_id TEXT NOT NULL,
                      role TEXT NOT NULL,
                      parts TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      UNIQUE (conversation_id, message_id)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS archived_messages (
                      conversation_id TEXT NOT NULL,
                      message_id TEXT NOT NULL,
                      archived_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                      PRIMARY KEY (conversation_id, message_id)
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE TABLE IF NOT EXISTS memory_entries (
                      entry_id UUID PRIMARY KEY,
                      conversation_id TEXT NOT NULL,
                      text TEXT NOT NULL,
                      created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
                    );
                    "#,
                )
                .execute(&self.pool)
                .await?;

                sqlx::query(
                    r#"
                    CREATE INDEX IF NOT EXISTS idx_memory_entries_scope_time
                    ON memory_entries (conversation_id, created_at);
                    "#,
                )
                .execute(&self.pool)
                .await?;

                Ok::<(), sqlx::Error>(())
            })
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to initialize schema: {}", e))
            })?;

        Ok(())
    }
}

fn role_to_db(role: MessageRole) -> &'static str {
    match role {
        MessageRole::User => "user",
        MessageRole::Assistant => "assistant",
        MessageRole::System => "system",
        MessageRole::Tool => "tool",
    }
}

fn role_from_db(role: &str) -> MessageRole {
    match role.to_lowercase().as_str() {
        "assistant" => MessageRole::Assistant,
        "system" => MessageRole::System,
        "tool" => MessageRole::Tool,
        _ => MessageRole::User,
    }
}

/// Message store over `conversation_messages`
pub struct PgMessageStore {
    backend: PgBackend,
}

impl PgMessageStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl MessageStore for PgMessageStore {
    async fn append(&self, conversation_id: &str, messages: &[Message]) -> Result<()> {
        self.backend.ensure_schema().await?;

        let mut tx = self.backend.pool.begin().await.map_err(|e| {
            AgentError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        for msg in messages {
            let archived = sqlx::query(
                "SELECT 1 FROM archived_messages WHERE conversation_id = $1 AND message_id = $2",
            )
            .bind(conversation_id)
            .bind(&msg.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to check archived messages: {}", e))
            })?;
            if archived.is_some() {
                continue;
            }

            let existing = sqlx::query(
                r#"
                SELECT parts FROM conversation_messages
                WHERE conversation_id = $1 AND message_id = $2
                FOR UPDATE
                "#,
            )
            .bind(conversation_id)
            .bind(&msg.id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to load stored message: {}", e))
            })?;

            let merged = match existing {
                Some(row) => {
                    let raw: String = row.try_get("parts").unwrap_or_default();
                    match serde_json::from_str::<Vec<MessagePart>>(&raw) {
                        Ok(parts) => {
                            let stored = Message {
                                parts,
                                ..msg.clone()
                            };
                            stored.merge_resent(msg)
                        }
                        Err(e) => {
                            warn!(
                                message_id = %msg.id,
                                error = %e,
                                "Overwriting unreadable stored parts"
                            );
                            msg.clone()
                        }
                    }
                }
                None => msg.clone(),
            };
            let msg = &merged;
            let parts = serde_json::to_string(&msg.parts)?;

            sqlx::query(
                r#"
                INSERT INTO conversation_messages
                  (conversation_id, message_id, role, parts, created_at)
                VALUES
                  ($1, $2, $3, $4, $5)
                ON CONFLICT (conversation_id, message_id)
                DO UPDATE SET role = EXCLUDED.role, parts = EXCLUDED.parts
                "#,
            )
            .bind(conversation_id)
            .bind(&msg.id)
            .bind(role_to_db(msg.role))
            .bind(parts)
            .bind(msg.metadata.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| {
                AgentError::DatabaseError(format!("Failed to insert conversation message: {}", e))
            })?;
        }

        tx.commit().await.map_err(|e| {
            AgentError::DatabaseError(format!("Failed to commit messages: {}", e))
        })?;

        Ok(())
    }

    async fn delete(&self, conversation_id: &str, ids: &[String]) -> Result<usize> {
        self.backend.ensure_schema().await?;

        if ids.is_empty() {
            return Ok(0);
        }

        let mut tx = self.backend.pool.begin().await.map_err(|e| {
            AgentError::DatabaseError(format!("Failed to begin transaction: {}", e))
        })?;

        let result = sqlx::query(
            "DELETE FROM conversation_messages WHERE conversation_id = $1 AND message_id = ANY($2)",
        )
        .bind(conversation_id)
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to delete messages: {}", e)))?;

        sqlx::query(
            r#"
            INSERT INTO archived_messages (conversation_id, message_id)
            SELECT $1, UNNEST($2::TEXT[])
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(conversation_id)
        .bind(ids)
        .execute(&mut *tx)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to archive messages: {}", e)))?;

        tx.commit().await.map_err(|e| {
            AgentError::DatabaseError(format!("Failed to commit deletion: {}", e))
        })?;

        Ok(result.rows_affected() as usize)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<Message>> {
        self.backend.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT message_id, role, parts, created_at
            FROM conversation_messages
            WHERE conversation_id = $1
            ORDER BY seq ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.backend.pool)
        .await
        .map_err(|e| {
            AgentError::DatabaseError(format!("Failed to load conversation history: {}", e))
        })?;

        let mut messages = Vec::with_capacity(rows.len());

        for row in rows {
            let id: String = row.try_get("message_id").map_err(|e| {
                AgentError::DatabaseError(format!("Corrupt message row: {}", e))
            })?;
            let db_role: String = row.try_get("role").unwrap_or_else(|_| "user".to_string());
            let raw_parts: String = row.try_get("parts").unwrap_or_default();

            let parts: Vec<MessagePart> = match serde_json::from_str(&raw_parts) {
                Ok(parts) => parts,
                Err(e) => {
                    warn!(message_id = %id, error = %e, "Skipping message with unreadable parts");
                    continue;
                }
            };

            messages.push(Message {
                id,
                role: role_from_db(&db_role),
                parts,
                metadata: MessageMetadata {
                    created_at: row
                        .try_get("created_at")
                        .unwrap_or_else(|_| chrono::Utc::now()),
                },
            });
        }

        Ok(messages)
    }
}

/// Memory store over `memory_entries`
pub struct PgMemoryStore {
    backend: PgBackend,
}

impl PgMemoryStore {
    pub fn new(backend: PgBackend) -> Self {
        Self { backend }
    }
}

#[async_trait::async_trait]
impl MemoryStore for PgMemoryStore {
    async fn append(&self, conversation_id: &str, text: &str) -> Result<MemoryEntry> {
        self.backend.ensure_schema().await?;

        let entry = MemoryEntry::new(text.to_string());

        sqlx::query(
            r#"
            INSERT INTO memory_entries (entry_id, conversation_id, text, created_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(entry.id)
        .bind(conversation_id)
        .bind(&entry.text)
        .bind(entry.created_at)
        .execute(&self.backend.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to append memory: {}", e)))?;

        Ok(entry)
    }

    async fn list(&self, conversation_id: &str) -> Result<Vec<MemoryEntry>> {
        self.backend.ensure_schema().await?;

        let rows = sqlx::query(
            r#"
            SELECT entry_id, text, created_at
            FROM memory_entries
            WHERE conversation_id = $1
            ORDER BY created_at ASC
            "#,
        )
        .bind(conversation_id)
        .fetch_all(&self.backend.pool)
        .await
        .map_err(|e| AgentError::DatabaseError(format!("Failed to load memories: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|row| MemoryEntry {
                id: row.try_get("entry_id").unwrap_or_else(|_| Uuid::new_v4()),
                text: row.try_get("text").unwrap_or_default(),
                created_at: row
                    .try_get("created_at")
                    .unwrap_or_else(|_| chrono::Utc::now()),
            })
            .collect())
    }
}
