use std::collections::HashSet;

use threadline_storage::{ConversationGateway, DEFAULT_THREAD_TITLE, NewConversation, ThreadId};

use super::codec::{DecodeStats, decode_thread};
use super::model::Thread;
use super::runtime::IdentityKey;

pub const CANONICAL_ID_SEPARATOR: &str = "_chat_with_";

/// Deterministic id of the canonical thread of `key`.
///
/// Generation 0 is `{family}_chat_with_{key}`; later generations append `-r{n}` and are
/// only used once earlier ids were tombstoned.
pub fn canonical_thread_id(key: &IdentityKey, generation: u32) -> ThreadId {
    let base = format!("{}{CANONICAL_ID_SEPARATOR}{}", key.family(), key.as_str());
    let raw = if generation == 0 {
        base
    } else {
        format!("{base}-r{generation}")
    };
    // Identity keys are non-empty and whitespace-free, so parsing cannot reject them.
    ThreadId::parse(&raw).unwrap_or_else(|_| ThreadId::new_v7())
}

/// First canonical id of `key` that was not tombstoned.
pub fn next_canonical_thread_id(key: &IdentityKey, tombstones: &HashSet<ThreadId>) -> ThreadId {
    let mut generation = 0;
    loop {
        let candidate = canonical_thread_id(key, generation);
        if !tombstones.contains(&candidate) {
            return candidate;
        }
        generation += 1;
    }
}

/// True when `thread_id` is one of the deterministic canonical ids of `key`.
pub fn is_canonical_id_for(thread_id: &ThreadId, key: &IdentityKey) -> bool {
    let base = canonical_thread_id(key, 0);
    let Some(rest) = thread_id.as_str().strip_prefix(base.as_str()) else {
        return false;
    };
    rest.is_empty()
        || rest
            .strip_prefix("-r")
            .is_some_and(|digits| !digits.is_empty() && digits.chars().all(|ch| ch.is_ascii_digit()))
}

pub fn find_canonical<'a>(threads: &'a [Thread], key: &IdentityKey) -> Option<&'a Thread> {
    threads.iter().find(|thread| thread.is_canonical_for(key))
}

/// Finds or creates the canonical thread of `key`.
///
/// Creation uses the deterministic id so repeated attempts converge on one row. Returns
/// `None` when creation fails; callers then fall back to [`transient_canonical`].
pub async fn resolve_canonical(
    gateway: &dyn ConversationGateway,
    owner_key: &str,
    key: &IdentityKey,
    known: &[Thread],
    tombstones: &HashSet<ThreadId>,
) -> Option<Thread> {
    if let Some(existing) = find_canonical(known, key) {
        return Some(existing.clone());
    }

    let thread_id = next_canonical_thread_id(key, tombstones);
    let input = NewConversation::new(owner_key, DEFAULT_THREAD_TITLE)
        .with_identity_key(key.as_str())
        .with_thread_id(thread_id.clone())
        .canonical();

    match gateway.create_conversation(input).await {
        Ok(record) => {
            let mut stats = DecodeStats::default();
            let mut thread = decode_thread(record, Some(key.clone()), &mut stats);
            thread.is_canonical = true;
            tracing::info!(
                thread_id = %thread.id,
                identity_key = %key,
                "resolved canonical thread through the archive"
            );
            Some(thread)
        }
        Err(error) => {
            tracing::warn!(
                thread_id = %thread_id,
                identity_key = %key,
                error = %error,
                "failed to create canonical thread"
            );
            None
        }
    }
}

/// In-memory canonical thread used while the archive cannot create one.
pub fn transient_canonical(key: &IdentityKey, tombstones: &HashSet<ThreadId>, now_ms: u64) -> Thread {
    Thread::local(next_canonical_thread_id(key, tombstones), Some(key.clone()), now_ms).canonical()
}
