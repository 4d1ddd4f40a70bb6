use std::path::{Path, PathBuf};

use sqlx::Row;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use tracing::info;

use super::error::{RepositoryError, RepositoryResult};
use super::message_repository::{
    AttachmentRecord, BoxFuture, ConversationSummary, MessageRecord, MessageRepository,
};
use crate::models::attachment::AttachmentSource;
use crate::models::message::{MessageStatus, Sender};

/// Migrations applied in order. Each entry is (version, sql).
/// To add a new migration: append a tuple with the next version number and
/// its SQL. Never edit or remove existing entries — existing databases
/// depend on them.
const MIGRATIONS: &[(i64, &str)] = &[(
    1,
    "CREATE TABLE IF NOT EXISTS messages (
        id              TEXT    PRIMARY KEY,
        conversation_id TEXT    NOT NULL,
        sender          TEXT    NOT NULL,
        sequence        INTEGER NOT NULL,
        status          TEXT    NOT NULL,
        content_text    TEXT    NOT NULL DEFAULT '',
        thoughts_text   TEXT    NOT NULL DEFAULT '',
        metadata        TEXT    NOT NULL DEFAULT '{}',
        request_id      TEXT,
        created_at      INTEGER NOT NULL DEFAULT 0,
        updated_at      INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_messages_conversation
        ON messages (conversation_id);
    CREATE INDEX IF NOT EXISTS idx_messages_conversation_sequence
        ON messages (conversation_id, sequence);
    CREATE TABLE IF NOT EXISTS attachments (
        id              TEXT    PRIMARY KEY,
        message_id      TEXT    NOT NULL,
        name            TEXT    NOT NULL,
        mime_type       TEXT    NOT NULL,
        size            INTEGER NOT NULL DEFAULT 0,
        source          TEXT    NOT NULL,
        remote_uri      TEXT,
        expires_at      INTEGER,
        data            BLOB,
        upload_progress INTEGER NOT NULL DEFAULT 0,
        error           TEXT,
        order_index     INTEGER NOT NULL DEFAULT 0
    );
    CREATE INDEX IF NOT EXISTS idx_attachments_message
        ON attachments (message_id);",
)];

/// SQLite-backed repository for messages and attachments.
///
/// Uses WAL journal mode for concurrent reads during background saves.
/// `SqlitePool` is internally reference-counted and cheap to clone.
pub struct SqliteMessageRepository {
    pool: SqlitePool,
}

impl SqliteMessageRepository {
    /// Open (or create) the database at the platform-specific config path.
    pub async fn open_default() -> RepositoryResult<Self> {
        Self::open(Self::default_db_path()?).await
    }

    /// Open (or create) the database at an explicit path.
    pub async fn open(db_path: impl AsRef<Path>) -> RepositoryResult<Self> {
        let db_path = db_path.as_ref();
        if let Some(parent) = db_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::run_migrations(&pool).await?;

        info!(path = %db_path.display(), "Opened SQLite message database");

        Ok(Self { pool })
    }

    /// Create the schema_version table if absent, then apply any pending
    /// migrations.
    async fn run_migrations(pool: &SqlitePool) -> RepositoryResult<()> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER NOT NULL
            )",
        )
        .execute(pool)
        .await?;

        // Seed version 0 if the table is empty (fresh database).
        sqlx::query("INSERT INTO schema_version (version) SELECT 0 WHERE NOT EXISTS (SELECT 1 FROM schema_version)")
            .execute(pool)
            .await?;

        let current: i64 = sqlx::query_scalar("SELECT version FROM schema_version")
            .fetch_one(pool)
            .await?;

        for (version, sql) in MIGRATIONS {
            if *version > current {
                info!(version, "Applying schema migration");
                // sqlx doesn't support multiple statements in a single query
                // call, so split on ';' and execute each statement
                // individually.
                for statement in sql.split(';') {
                    let trimmed = statement.trim();
                    if !trimmed.is_empty() {
                        sqlx::query(trimmed).execute(pool).await?;
                    }
                }
                sqlx::query("UPDATE schema_version SET version = ?")
                    .bind(version)
                    .execute(pool)
                    .await?;
            }
        }

        Ok(())
    }

    fn default_db_path() -> RepositoryResult<PathBuf> {
        dirs::config_dir()
            .ok_or_else(|| RepositoryError::InitializationError {
                message: "Cannot find config directory".into(),
            })
            .map(|p| p.join("weft").join("messages.db"))
    }

    fn record_from_row(row: &sqlx::sqlite::SqliteRow) -> RepositoryResult<MessageRecord> {
        let sender: String = row.get("sender");
        let status: String = row.get("status");
        Ok(MessageRecord {
            id: row.get("id"),
            conversation_id: row.get("conversation_id"),
            sender: Sender::parse(&sender).ok_or_else(|| RepositoryError::InvalidData {
                message: format!("unknown sender: {sender}"),
            })?,
            sequence: row.get("sequence"),
            status: MessageStatus::parse(&status).ok_or_else(|| {
                RepositoryError::InvalidData {
                    message: format!("unknown status: {status}"),
                }
            })?,
            content_text: row.get("content_text"),
            thoughts_text: row.get("thoughts_text"),
            metadata: row.get("metadata"),
            request_id: row.get("request_id"),
            created_at: row.get("created_at"),
            updated_at: row.get("updated_at"),
        })
    }
}

impl Clone for SqliteMessageRepository {
    fn clone(&self) -> Self {
        Self {
            pool: self.pool.clone(),
        }
    }
}

const SELECT_MESSAGE_COLUMNS: &str = "SELECT id, conversation_id, sender, sequence, status,
        content_text, thoughts_text, metadata, request_id, created_at, updated_at
 FROM messages";

impl MessageRepository for SqliteMessageRepository {
    fn load_one(&self, id: &str) -> BoxFuture<'static, RepositoryResult<Option<MessageRecord>>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let row = sqlx::query(&format!("{SELECT_MESSAGE_COLUMNS} WHERE id = ?"))
                .bind(&id)
                .fetch_optional(&pool)
                .await?;
            row.map(|r| Self::record_from_row(&r)).transpose()
        })
    }

    fn load_conversation(
        &self,
        conversation_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<MessageRecord>>> {
        let pool = self.pool.clone();
        let conversation_id = conversation_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(&format!(
                "{SELECT_MESSAGE_COLUMNS} WHERE conversation_id = ? ORDER BY sequence ASC"
            ))
            .bind(&conversation_id)
            .fetch_all(&pool)
            .await?;
            rows.iter().map(Self::record_from_row).collect()
        })
    }

    fn load_attachments(
        &self,
        message_id: &str,
    ) -> BoxFuture<'static, RepositoryResult<Vec<AttachmentRecord>>> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT id, message_id, name, mime_type, size, source, remote_uri,
                        expires_at, data, upload_progress, error, order_index
                 FROM attachments
                 WHERE message_id = ?
                 ORDER BY order_index ASC",
            )
            .bind(&message_id)
            .fetch_all(&pool)
            .await?;

            rows.iter()
                .map(|row| {
                    let source: String = row.get("source");
                    let source = match source.as_str() {
                        "user" => AttachmentSource::User,
                        "model" => AttachmentSource::Model,
                        other => {
                            return Err(RepositoryError::InvalidData {
                                message: format!("unknown attachment source: {other}"),
                            });
                        }
                    };
                    Ok(AttachmentRecord {
                        id: row.get("id"),
                        message_id: row.get("message_id"),
                        name: row.get("name"),
                        mime_type: row.get("mime_type"),
                        size: row.get("size"),
                        source,
                        remote_uri: row.get("remote_uri"),
                        expires_at: row.get("expires_at"),
                        data: row.get("data"),
                        upload_progress: row.get("upload_progress"),
                        error: row.get("error"),
                        order_index: row.get("order_index"),
                    })
                })
                .collect()
        })
    }

    fn load_summaries(&self) -> BoxFuture<'static, RepositoryResult<Vec<ConversationSummary>>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            let rows = sqlx::query(
                "SELECT conversation_id, COUNT(*) AS message_count,
                        MAX(updated_at) AS last_updated_at
                 FROM messages
                 GROUP BY conversation_id
                 ORDER BY last_updated_at DESC",
            )
            .fetch_all(&pool)
            .await?;

            Ok(rows
                .iter()
                .map(|row| ConversationSummary {
                    conversation_id: row.get("conversation_id"),
                    message_count: row.get("message_count"),
                    last_updated_at: row.get("last_updated_at"),
                })
                .collect())
        })
    }

    fn save(&self, record: MessageRecord) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        Box::pin(async move {
            sqlx::query(
                "INSERT OR REPLACE INTO messages
                 (id, conversation_id, sender, sequence, status, content_text,
                  thoughts_text, metadata, request_id, created_at, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&record.id)
            .bind(&record.conversation_id)
            .bind(record.sender.as_str())
            .bind(record.sequence)
            .bind(record.status.as_str())
            .bind(&record.content_text)
            .bind(&record.thoughts_text)
            .bind(&record.metadata)
            .bind(&record.request_id)
            .bind(record.created_at)
            .bind(record.updated_at)
            .execute(&pool)
            .await?;
            Ok(())
        })
    }

    fn save_attachments(
        &self,
        message_id: &str,
        records: Vec<AttachmentRecord>,
    ) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let message_id = message_id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM attachments WHERE message_id = ?")
                .bind(&message_id)
                .execute(&mut *tx)
                .await?;

            for record in records {
                let source = match record.source {
                    AttachmentSource::User => "user",
                    AttachmentSource::Model => "model",
                };
                sqlx::query(
                    "INSERT INTO attachments
                     (id, message_id, name, mime_type, size, source, remote_uri,
                      expires_at, data, upload_progress, error, order_index)
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&record.id)
                .bind(&record.message_id)
                .bind(&record.name)
                .bind(&record.mime_type)
                .bind(record.size)
                .bind(source)
                .bind(&record.remote_uri)
                .bind(record.expires_at)
                .bind(&record.data)
                .bind(record.upload_progress)
                .bind(&record.error)
                .bind(record.order_index)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(())
        })
    }

    fn delete(&self, id: &str) -> BoxFuture<'static, RepositoryResult<()>> {
        let pool = self.pool.clone();
        let id = id.to_string();
        Box::pin(async move {
            let mut tx = pool.begin().await?;
            sqlx::query("DELETE FROM attachments WHERE message_id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            sqlx::query("DELETE FROM messages WHERE id = ?")
                .bind(&id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            Ok(())
        })
    }
}
