use std::collections::{HashMap, VecDeque};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::{Mutex, oneshot};

use super::error::{
    ConflictSnafu, NotFoundSnafu, StorageError, StorageErrorKind, StorageResult,
};
use super::ids::ThreadId;
use super::types::{
    AppendOutcome, ConversationPatch, ConversationRecord, MessageRecord, NewConversation,
};
use super::{BoxFuture, ConversationGateway};

/// Gateway operations that can be observed, failed or paused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GatewayOp {
    List,
    Create,
    Append,
    Update,
    Tombstone,
}

/// Rows are scoped per owner, so two owners may hold the same deterministic thread id.
type RowKey = (String, ThreadId);

#[derive(Default)]
struct MemoryState {
    conversations: HashMap<RowKey, ConversationRecord>,
    faults: HashMap<GatewayOp, VecDeque<StorageErrorKind>>,
    pauses: HashMap<GatewayOp, VecDeque<oneshot::Receiver<()>>>,
    calls: HashMap<GatewayOp, usize>,
}

/// In-process archive with scripted fault injection.
#[derive(Default)]
pub struct MemoryGateway {
    state: Mutex<MemoryState>,
    latency: Option<Duration>,
}

impl MemoryGateway {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Seeds a stored row as-is, including legacy shapes and tombstones.
    pub async fn insert_record(&self, record: ConversationRecord) {
        let mut state = self.state.lock().await;
        state
            .conversations
            .insert((record.owner_key.clone(), record.id.clone()), record);
    }

    /// Makes the next call of `op` fail with an error of `kind`.
    pub async fn fail_next(&self, op: GatewayOp, kind: StorageErrorKind) {
        let mut state = self.state.lock().await;
        state.faults.entry(op).or_default().push_back(kind);
    }

    /// Holds the next call of `op` until the returned sender fires or is dropped.
    pub async fn pause_next(&self, op: GatewayOp) -> oneshot::Sender<()> {
        let (release_tx, release_rx) = oneshot::channel();
        let mut state = self.state.lock().await;
        state.pauses.entry(op).or_default().push_back(release_rx);
        release_tx
    }

    pub async fn calls(&self, op: GatewayOp) -> usize {
        let state = self.state.lock().await;
        state.calls.get(&op).copied().unwrap_or(0)
    }

    pub async fn record(&self, owner_key: &str, thread_id: &ThreadId) -> Option<ConversationRecord> {
        let state = self.state.lock().await;
        state
            .conversations
            .get(&row_key(owner_key, thread_id))
            .cloned()
    }

    async fn enter(&self, op: GatewayOp, stage: &'static str) -> StorageResult<()> {
        let (fault, pause) = {
            let mut state = self.state.lock().await;
            *state.calls.entry(op).or_default() += 1;
            let fault = state.faults.get_mut(&op).and_then(VecDeque::pop_front);
            let pause = state.pauses.get_mut(&op).and_then(VecDeque::pop_front);
            (fault, pause)
        };

        if let Some(pause) = pause {
            let _ = pause.await;
        }
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        match fault {
            Some(kind) => Err(injected_error(kind, stage)),
            None => Ok(()),
        }
    }
}

impl ConversationGateway for MemoryGateway {
    fn list_conversations<'a>(
        &'a self,
        owner_key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>> {
        Box::pin(async move {
            self.enter(GatewayOp::List, "memory-list").await?;
            let state = self.state.lock().await;
            let mut conversations = state
                .conversations
                .values()
                .filter(|record| record.owner_key == owner_key)
                .cloned()
                .collect::<Vec<_>>();
            conversations.sort_by(|left, right| {
                right
                    .updated_at_ms
                    .cmp(&left.updated_at_ms)
                    .then_with(|| right.id.cmp(&left.id))
            });
            Ok(conversations)
        })
    }

    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>> {
        Box::pin(async move {
            self.enter(GatewayOp::Create, "memory-create").await?;
            let mut state = self.state.lock().await;

            if let Some(thread_id) = &input.thread_id
                && let Some(existing) = state
                    .conversations
                    .get(&row_key(&input.owner_key, thread_id))
            {
                if existing.is_tombstoned() {
                    return ConflictSnafu {
                        stage: "memory-create-existing",
                        entity: "conversation",
                        details: format!("thread '{thread_id}' is not available for reuse"),
                    }
                    .fail();
                }
                return Ok(existing.clone());
            }

            let now = unix_timestamp_ms();
            let record = ConversationRecord {
                id: input.thread_id.clone().unwrap_or_else(ThreadId::new_v7),
                owner_key: input.owner_key.clone(),
                title: input.effective_title(),
                identity_key: input.identity_key.clone(),
                construct_id: None,
                is_canonical: input.is_canonical,
                archived: false,
                created_at_ms: now,
                updated_at_ms: now,
                deleted_at_ms: None,
                messages: Vec::new(),
            };
            state.conversations.insert(
                (record.owner_key.clone(), record.id.clone()),
                record.clone(),
            );
            Ok(record)
        })
    }

    fn append_message<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
        message: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<AppendOutcome>> {
        Box::pin(async move {
            self.enter(GatewayOp::Append, "memory-append").await?;
            let mut state = self.state.lock().await;

            let owned_elsewhere = state.conversations.values().any(|record| {
                (record.owner_key != owner_key || record.id != *thread_id)
                    && record
                        .messages
                        .iter()
                        .any(|existing| existing.id == message.id)
            });
            if owned_elsewhere {
                return ConflictSnafu {
                    stage: "memory-append-foreign-id",
                    entity: "message",
                    details: format!("message '{}' belongs to another thread", message.id),
                }
                .fail();
            }

            let record = live_record_mut(&mut state, owner_key, thread_id, "memory-append-scope")?;
            if record
                .messages
                .iter()
                .any(|existing| existing.id == message.id)
            {
                return Ok(AppendOutcome::AlreadyPresent);
            }

            record.updated_at_ms = record.updated_at_ms.max(message.timestamp_ms);
            record.messages.push(message);
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
            self.enter(GatewayOp::Update, "memory-update").await?;
            let mut state = self.state.lock().await;
            let record = live_record_mut(&mut state, owner_key, thread_id, "memory-update-scope")?;
            if let Some(title) = patch.title {
                record.title = title;
            }
            if let Some(archived) = patch.archived {
                record.archived = archived;
            }
            record.updated_at_ms = record.updated_at_ms.max(unix_timestamp_ms());
            Ok(())
        })
    }

    fn tombstone_conversation<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, StorageResult<()>> {
        Box::pin(async move {
            self.enter(GatewayOp::Tombstone, "memory-tombstone").await?;
            let mut state = self.state.lock().await;
            let Some(record) = state.conversations.get_mut(&row_key(owner_key, thread_id)) else {
                return NotFoundSnafu {
                    stage: "memory-tombstone-missing",
                    entity: "conversation",
                    id: thread_id.to_string(),
                }
                .fail();
            };

            if record.deleted_at_ms.is_none() {
                let now = unix_timestamp_ms();
                record.deleted_at_ms = Some(now);
                record.updated_at_ms = record.updated_at_ms.max(now);
            }
            Ok(())
        })
    }
}

fn live_record_mut<'a>(
    state: &'a mut MemoryState,
    owner_key: &str,
    thread_id: &ThreadId,
    stage: &'static str,
) -> StorageResult<&'a mut ConversationRecord> {
    match state.conversations.get_mut(&row_key(owner_key, thread_id)) {
        Some(record) if !record.is_tombstoned() => Ok(record),
        _ => NotFoundSnafu {
            stage,
            entity: "conversation",
            id: thread_id.to_string(),
        }
        .fail(),
    }
}

fn row_key(owner_key: &str, thread_id: &ThreadId) -> RowKey {
    (owner_key.to_string(), thread_id.clone())
}

fn injected_error(kind: StorageErrorKind, stage: &'static str) -> StorageError {
    match kind {
        StorageErrorKind::Transient => StorageError::Unavailable {
            stage,
            details: "injected transient failure".to_string(),
        },
        StorageErrorKind::NotFound => StorageError::NotFound {
            stage,
            entity: "conversation",
            id: "injected".to_string(),
        },
        StorageErrorKind::Rejected => StorageError::Rejected {
            stage,
            entity: "message",
            details: "injected rejection".to_string(),
        },
        StorageErrorKind::Corrupt => StorageError::InvariantViolation {
            stage,
            details: "injected corruption".to_string(),
        },
    }
}

fn unix_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}
