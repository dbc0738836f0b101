use std::collections::HashSet;

use threadline_llm::ResponsePacket;
use threadline_storage::{
    ConversationGateway, ConversationRecord, MessageId, StorageError, StorageErrorKind,
    StorageResult, ThreadId,
};

use super::canonical::{is_canonical_id_for, next_canonical_thread_id};
use super::codec::{DecodeStats, decode_thread};
use super::config::SyncSettings;
use super::matching::match_thread;
use super::model::{Message, Thread};
use super::runtime::IdentityKey;

pub const EMERGENCY_GREETING: &str =
    "Hi! I can't reach your saved conversations right now, but you can keep chatting here.";

/// Where the thread set of a (re)load came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BootstrapSource {
    Remote,
    /// The archive failed; threads were restored from the local snapshot.
    Snapshot,
    /// The archive failed and nothing local was available.
    Emergency,
    /// The archive failed during a reload; the in-memory set was kept as is.
    Retained,
    /// A newer reload started first; this result was dropped.
    Stale,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BootstrapReport {
    pub source: BootstrapSource,
    pub identity_key: IdentityKey,
    pub loaded_threads: usize,
    pub skipped_tombstones: usize,
    pub repaired_messages: usize,
    pub attempts: u32,
    pub error: Option<String>,
}

impl BootstrapReport {
    pub(crate) fn new(source: BootstrapSource, identity_key: IdentityKey) -> Self {
        Self {
            source,
            identity_key,
            loaded_threads: 0,
            skipped_tombstones: 0,
            repaired_messages: 0,
            attempts: 0,
            error: None,
        }
    }
}

/// Lists the owner's conversations with a bounded timeout, retrying transient failures.
///
/// Returns the records and the number of attempts made. Not-found counts as an empty
/// archive.
pub async fn load_records(
    gateway: &dyn ConversationGateway,
    owner_key: &str,
    settings: &SyncSettings,
) -> (StorageResult<Vec<ConversationRecord>>, u32) {
    let max_attempts = settings.load_retries.saturating_add(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        let result = match tokio::time::timeout(
            settings.load_timeout(),
            gateway.list_conversations(owner_key),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(StorageError::Unavailable {
                stage: "load-conversations-timeout",
                details: format!(
                    "listing conversations took longer than {}ms",
                    settings.load_timeout_ms
                ),
            }),
        };

        match result {
            Ok(records) => return (Ok(records), attempt),
            Err(error) if error.kind() == StorageErrorKind::NotFound => {
                tracing::debug!(owner_key, "no conversations stored yet");
                return (Ok(Vec::new()), attempt);
            }
            Err(error) if error.is_transient() && attempt < max_attempts => {
                tracing::warn!(
                    owner_key,
                    attempt,
                    error = %error,
                    "transient failure while loading conversations, retrying"
                );
            }
            Err(error) => return (Err(error), attempt),
        }
    }
}

/// Loaded threads of one identity key, ready to merge.
#[derive(Debug, Clone, Default)]
pub struct LoadedView {
    pub threads: Vec<Thread>,
    /// Every tombstoned thread id of the owner, whatever its identity.
    pub tombstones: HashSet<ThreadId>,
    pub repaired_messages: usize,
}

/// Filters records to `identity_key`, sets tombstones aside and repairs legacy messages.
pub fn prepare(records: Vec<ConversationRecord>, identity_key: &IdentityKey) -> LoadedView {
    let mut view = LoadedView::default();
    let mut stats = DecodeStats::default();

    for record in records {
        if record.is_tombstoned() {
            view.tombstones.insert(record.id.clone());
            continue;
        }
        let Some(basis) = match_thread(&record, identity_key) else {
            continue;
        };

        let mut thread = decode_thread(record, Some(identity_key.clone()), &mut stats);
        // Rows written before the canonical flag existed are recognized by their id.
        if is_canonical_id_for(&thread.id, identity_key) {
            thread.is_canonical = true;
        }
        tracing::trace!(thread_id = %thread.id, basis = ?basis, "matched stored thread");
        view.threads.push(thread);
    }

    if stats.repaired_messages > 0 {
        tracing::info!(
            identity_key = %identity_key,
            repaired = stats.repaired_messages,
            "repaired legacy message shapes"
        );
    }
    view.repaired_messages = stats.repaired_messages;
    view
}

/// Canonical thread with one local greeting, used when nothing could be loaded.
///
/// It is not persisted until the user sends a message, and the greeting never is.
pub fn emergency_thread(
    identity_key: &IdentityKey,
    tombstones: &HashSet<ThreadId>,
    now_ms: u64,
) -> Thread {
    let mut thread = Thread::local(
        next_canonical_thread_id(identity_key, tombstones),
        Some(identity_key.clone()),
        now_ms,
    )
    .canonical();
    thread.messages.push(Message::synthetic(
        MessageId::new_v7(),
        ResponsePacket::answer(EMERGENCY_GREETING),
        now_ms,
    ));
    thread
}
