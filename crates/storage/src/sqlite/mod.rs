use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;
use std::time::{SystemTime, UNIX_EPOCH};

use snafu::{OptionExt, ResultExt};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{FromRow, Sqlite, SqlitePool, Transaction};

use super::error::{
    ConflictSnafu, CreateSqliteDirectorySnafu, DecodeJsonSnafu, EncodeJsonSnafu,
    InvariantViolationSnafu, NotFoundSnafu, SqliteConnectOptionsSnafu, SqliteConnectSnafu,
    SqliteMigrateSnafu, SqlitePragmaSnafu, SqliteQuerySnafu, StorageResult,
};
use super::ids::{MessageId, ThreadId};
use super::types::{
    AppendOutcome, AttachmentRecord, ConversationPatch, ConversationRecord, MessageRecord,
    MessageRole, MetricsRecord, NewConversation,
};
use super::{BoxFuture, ConversationGateway};

const SELECT_OWNED_CONVERSATION: &str = "SELECT id, owner_key, title, identity_key, construct_id, is_canonical, archived, created_at, updated_at, deleted_at FROM conversations WHERE owner_key = ? AND id = ?";
const SELECT_CONVERSATIONS_BY_OWNER: &str = "SELECT id, owner_key, title, identity_key, construct_id, is_canonical, archived, created_at, updated_at, deleted_at FROM conversations WHERE owner_key = ? ORDER BY updated_at DESC, id DESC";

#[derive(Debug, Clone)]
pub struct SqliteGateway {
    pool: SqlitePool,
}

impl SqliteGateway {
    pub async fn open(database_location: &str) -> StorageResult<Self> {
        ensure_database_directory(database_location)?;

        let database_url = normalize_database_url(database_location);
        let connect_options = SqliteConnectOptions::from_str(&database_url)
            .context(SqliteConnectOptionsSnafu {
                stage: "sqlite-open-parse-url",
                database_url: database_url.clone(),
            })?
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(5_000));

        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(connect_options)
            .await
            .context(SqliteConnectSnafu {
                stage: "sqlite-open-connect",
                database_url: database_url.clone(),
            })?;

        sqlx::query("PRAGMA foreign_keys = ON;")
            .execute(&pool)
            .await
            .context(SqlitePragmaSnafu {
                stage: "sqlite-open-pragma-foreign-keys",
                pragma: "foreign_keys",
            })?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context(SqliteMigrateSnafu {
                stage: "sqlite-open-migrate",
            })?;

        tracing::debug!(database_url = %database_url, "opened sqlite conversation archive");
        Ok(Self { pool })
    }

    async fn load_messages(
        &self,
        owner_key: &str,
    ) -> StorageResult<HashMap<String, Vec<MessageRecord>>> {
        let rows = sqlx::query_as::<_, MessageRow>(
            "SELECT m.id, m.conversation_id, m.role, m.content, m.packets_json, m.attachments_json, m.elapsed_ms, m.reasoning_trace, m.timestamp_ms FROM messages m JOIN conversations c ON c.owner_key = m.owner_key AND c.id = m.conversation_id WHERE m.owner_key = ? AND c.deleted_at IS NULL ORDER BY m.conversation_id ASC, m.seq ASC",
        )
        .bind(owner_key)
        .fetch_all(&self.pool)
        .await
        .context(SqliteQuerySnafu {
            stage: "conversation-list-messages",
        })?;

        let mut grouped: HashMap<String, Vec<MessageRecord>> = HashMap::new();
        for row in rows {
            let conversation_id = row.conversation_id.clone();
            grouped
                .entry(conversation_id)
                .or_default()
                .push(message_row_to_record(row)?);
        }
        Ok(grouped)
    }

    async fn load_conversation(
        &self,
        owner_key: &str,
        thread_id: &ThreadId,
        stage: &'static str,
    ) -> StorageResult<Option<ConversationRecord>> {
        let row = sqlx::query_as::<_, ConversationRow>(SELECT_OWNED_CONVERSATION)
        .bind(owner_key)
        .bind(thread_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .context(SqliteQuerySnafu { stage })?;

        row.map(|row| conversation_row_to_record(row, Vec::new()))
            .transpose()
    }
}

impl ConversationGateway for SqliteGateway {
    fn list_conversations<'a>(
        &'a self,
        owner_key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            let rows = sqlx::query_as::<_, ConversationRow>(SELECT_CONVERSATIONS_BY_OWNER)
            .bind(owner_key)
            .fetch_all(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-list-query",
            })?;

            let mut messages = self.load_messages(owner_key).await?;
            rows.into_iter()
                .map(|row| {
                    let thread_messages = messages.remove(&row.id).unwrap_or_default();
                    conversation_row_to_record(row, thread_messages)
                })
                .collect()
        })
    }

    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            if let Some(thread_id) = &input.thread_id
                && let Some(existing) = self
                    .load_conversation(
                        &input.owner_key,
                        thread_id,
                        "conversation-create-load-existing",
                    )
                    .await?
            {
                // Deterministic ids converge on the existing row instead of duplicating it.
                if existing.is_tombstoned() {
                    return ConflictSnafu {
                        stage: "conversation-create-existing",
                        entity: "conversation",
                        details: format!("thread '{thread_id}' is not available for reuse"),
                    }
                    .fail();
                }
                return Ok(existing);
            }

            let thread_id = input.thread_id.clone().unwrap_or_else(ThreadId::new_v7);
            let title = input.effective_title();
            let now = unix_timestamp_ms();

            sqlx::query(
                "INSERT INTO conversations (id, owner_key, title, identity_key, construct_id, is_canonical, archived, created_at, updated_at, deleted_at) VALUES (?, ?, ?, ?, NULL, ?, 0, ?, ?, NULL)",
            )
            .bind(thread_id.as_str())
            .bind(&input.owner_key)
            .bind(&title)
            .bind(input.identity_key.as_deref())
            .bind(input.is_canonical)
            .bind(now)
            .bind(now)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-create-insert",
            })?;

            Ok(ConversationRecord {
                id: thread_id,
                owner_key: input.owner_key,
                title,
                identity_key: input.identity_key,
                construct_id: None,
                is_canonical: input.is_canonical,
                archived: false,
                created_at_ms: i64_to_u64(now, "conversation-create-created-at")?,
                updated_at_ms: i64_to_u64(now, "conversation-create-updated-at")?,
                deleted_at_ms: None,
                messages: Vec::new(),
            })
        })
    }

    fn append_message<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
        message: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<AppendOutcome>> {
        Box::pin(async move {
            let attachments_json =
                serde_json::to_string(&message.attachments).context(EncodeJsonSnafu {
                    stage: "message-append-encode-attachments",
                    field: "attachments",
                })?;
            let timestamp_ms = u64_to_i64(message.timestamp_ms, "message-append-timestamp")?;
            let elapsed_ms = message
                .metrics
                .as_ref()
                .map(|metrics| u64_to_i64(metrics.elapsed_ms, "message-append-elapsed"))
                .transpose()?;

            let mut tx = self.pool.begin().await.context(SqliteQuerySnafu {
                stage: "message-append-begin",
            })?;

            ensure_live_conversation(&mut tx, owner_key, thread_id, "message-append-scope")
                .await?;

            let existing_home = sqlx::query_as::<_, (String, String)>(
                "SELECT owner_key, conversation_id FROM messages WHERE id = ?",
            )
            .bind(message.id.as_str())
            .fetch_optional(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-dedupe",
            })?;

            match existing_home {
                Some((stored_owner, conversation_id))
                    if stored_owner == owner_key && conversation_id == thread_id.as_str() =>
                {
                    return Ok(AppendOutcome::AlreadyPresent);
                }
                Some(_) => {
                    return ConflictSnafu {
                        stage: "message-append-foreign-id",
                        entity: "message",
                        details: format!("message '{}' belongs to another thread", message.id),
                    }
                    .fail();
                }
                None => {}
            }

            let next_seq = sqlx::query_scalar::<_, i64>(
                "SELECT COALESCE(MAX(seq), 0) + 1 FROM messages WHERE owner_key = ? AND conversation_id = ?",
            )
            .bind(owner_key)
            .bind(thread_id.as_str())
            .fetch_one(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-next-seq",
            })?;

            sqlx::query(
                "INSERT INTO messages (id, owner_key, conversation_id, seq, role, content, packets_json, attachments_json, elapsed_ms, reasoning_trace, timestamp_ms) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(message.id.as_str())
            .bind(owner_key)
            .bind(thread_id.as_str())
            .bind(next_seq)
            .bind(message.role.as_str())
            .bind(&message.content)
            .bind(message.packets_json.as_deref())
            .bind(attachments_json)
            .bind(elapsed_ms)
            .bind(
                message
                    .metrics
                    .as_ref()
                    .and_then(|metrics| metrics.reasoning_trace.as_deref()),
            )
            .bind(timestamp_ms)
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-insert",
            })?;

            sqlx::query(
                "UPDATE conversations SET updated_at = MAX(updated_at, ?) WHERE owner_key = ? AND id = ?",
            )
            .bind(timestamp_ms)
            .bind(owner_key)
            .bind(thread_id.as_str())
            .execute(&mut *tx)
            .await
            .context(SqliteQuerySnafu {
                stage: "message-append-touch-conversation",
            })?;

            tx.commit().await.context(SqliteQuerySnafu {
                stage: "message-append-commit",
            })?;

            Ok(AppendOutcome::Inserted)
        })
    }

    fn update_conversation<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let now = unix_timestamp_ms();
            let result = sqlx::query(
                "UPDATE conversations SET title = COALESCE(?, title), archived = COALESCE(?, archived), updated_at = MAX(updated_at, ?) WHERE id = ? AND owner_key = ? AND deleted_at IS NULL",
            )
            .bind(patch.title)
            .bind(patch.archived)
            .bind(now)
            .bind(thread_id.as_str())
            .bind(owner_key)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-update-apply",
            })?;

            if result.rows_affected() == 0 {
                return NotFoundSnafu {
                    stage: "conversation-update-missing",
                    entity: "conversation",
                    id: thread_id.to_string(),
                }
                .fail();
            }

            Ok(())
        })
    }

    fn tombstone_conversation<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            let now = unix_timestamp_ms();
            let result = sqlx::query(
                "UPDATE conversations SET deleted_at = ?, updated_at = MAX(updated_at, ?) WHERE id = ? AND owner_key = ? AND deleted_at IS NULL",
            )
            .bind(now)
            .bind(now)
            .bind(thread_id.as_str())
            .bind(owner_key)
            .execute(&self.pool)
            .await
            .context(SqliteQuerySnafu {
                stage: "conversation-tombstone-apply",
            })?;

            if result.rows_affected() == 0 {
                // Repeated tombstones are fine; a missing row is not.
                let exists = self
                    .load_conversation(owner_key, thread_id, "conversation-tombstone-load")
                    .await?
                    .is_some();
                if !exists {
                    return NotFoundSnafu {
                        stage: "conversation-tombstone-missing",
                        entity: "conversation",
                        id: thread_id.to_string(),
                    }
                    .fail();
                }
            }

            Ok(())
        })
    }
}

#[derive(Debug, FromRow)]
struct ConversationRow {
    id: String,
    owner_key: String,
    title: String,
    identity_key: Option<String>,
    construct_id: Option<String>,
    is_canonical: bool,
    archived: bool,
    created_at: i64,
    updated_at: i64,
    deleted_at: Option<i64>,
}

#[derive(Debug, FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    packets_json: Option<String>,
    attachments_json: String,
    elapsed_ms: Option<i64>,
    reasoning_trace: Option<String>,
    timestamp_ms: i64,
}

fn conversation_row_to_record(
    row: ConversationRow,
    messages: Vec<MessageRecord>,
) -> StorageResult<ConversationRecord> {
    Ok(ConversationRecord {
        id: ThreadId::parse(&row.id)?,
        owner_key: row.owner_key,
        title: row.title,
        identity_key: row.identity_key,
        construct_id: row.construct_id,
        is_canonical: row.is_canonical,
        archived: row.archived,
        created_at_ms: i64_to_u64(row.created_at, "conversation-row-created-at")?,
        updated_at_ms: i64_to_u64(row.updated_at, "conversation-row-updated-at")?,
        deleted_at_ms: row
            .deleted_at
            .map(|value| i64_to_u64(value, "conversation-row-deleted-at"))
            .transpose()?,
        messages,
    })
}

fn message_row_to_record(row: MessageRow) -> StorageResult<MessageRecord> {
    let role = MessageRole::parse(&row.role).context(InvariantViolationSnafu {
        stage: "message-row-role",
        details: format!("unknown message role '{}'", row.role),
    })?;
    let attachments =
        serde_json::from_str::<Vec<AttachmentRecord>>(&row.attachments_json).context(
            DecodeJsonSnafu {
                stage: "message-row-attachments",
                field: "attachments",
            },
        )?;
    let metrics = row
        .elapsed_ms
        .map(|elapsed| -> StorageResult<MetricsRecord> {
            Ok(MetricsRecord {
                elapsed_ms: i64_to_u64(elapsed, "message-row-elapsed")?,
                reasoning_trace: row.reasoning_trace.clone(),
            })
        })
        .transpose()?;

    Ok(MessageRecord {
        id: MessageId::parse(&row.id)?,
        role,
        content: row.content,
        packets_json: row.packets_json,
        timestamp_ms: i64_to_u64(row.timestamp_ms, "message-row-timestamp")?,
        attachments,
        metrics,
    })
}

async fn ensure_live_conversation(
    tx: &mut Transaction<'_, Sqlite>,
    owner_key: &str,
    thread_id: &ThreadId,
    stage: &'static str,
) -> StorageResult<()> {
    let live = sqlx::query_scalar::<_, i64>(
        "SELECT 1 FROM conversations WHERE id = ? AND owner_key = ? AND deleted_at IS NULL LIMIT 1",
    )
    .bind(thread_id.as_str())
    .bind(owner_key)
    .fetch_optional(&mut **tx)
    .await
    .context(SqliteQuerySnafu { stage })?;

    if live.is_none() {
        return NotFoundSnafu {
            stage,
            entity: "conversation",
            id: thread_id.to_string(),
        }
        .fail();
    }

    Ok(())
}

fn unix_timestamp_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| i64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}

fn i64_to_u64(value: i64, stage: &'static str) -> StorageResult<u64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("negative sqlite integer '{value}' cannot map to u64"),
        })
}

fn u64_to_i64(value: u64, stage: &'static str) -> StorageResult<i64> {
    value
        .try_into()
        .map_err(|_| super::error::StorageError::InvariantViolation {
            stage,
            details: format!("u64 '{value}' cannot map to sqlite i64"),
        })
}

fn ensure_database_directory(database_location: &str) -> StorageResult<()> {
    if database_location.starts_with("sqlite:") || database_location == ":memory:" {
        return Ok(());
    }

    let path = Path::new(database_location);
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context(CreateSqliteDirectorySnafu {
            stage: "sqlite-open-create-directory",
            path: parent.display().to_string(),
        })?;
    }

    Ok(())
}

fn normalize_database_url(database_location: &str) -> String {
    if database_location.starts_with("sqlite:") {
        return database_location.to_string();
    }

    if database_location == ":memory:" {
        return "sqlite::memory:".to_string();
    }

    format!("sqlite://{database_location}")
}
