use std::cmp::Reverse;
use std::collections::{HashMap, HashSet};

use threadline_storage::ThreadId;

use super::canonical::is_canonical_id_for;
use super::model::{Delivery, Thread};
use super::runtime::IdentityKey;

/// Thread to synthesize when the default identity ends up without a canonical thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalSeed {
    pub thread_id: ThreadId,
    pub now_ms: u64,
}

/// Merges freshly loaded threads into the current in-memory set.
///
/// Pure: nothing is written anywhere. Threads are never removed, and a thread that already
/// holds messages in memory keeps all of them; loaded messages only fill in what memory
/// lacks. After merging, every identity key has at most one canonical thread.
pub fn merge(
    current: &[Thread],
    loaded: Vec<Thread>,
    identity_key: &IdentityKey,
    seed: CanonicalSeed,
) -> Vec<Thread> {
    let mut merged = current.to_vec();
    let mut index = merged
        .iter()
        .enumerate()
        .map(|(position, thread)| (thread.id.clone(), position))
        .collect::<HashMap<_, _>>();

    for incoming in loaded {
        match index.get(&incoming.id) {
            Some(&position) => merge_thread(&mut merged[position], incoming),
            None => {
                index.insert(incoming.id.clone(), merged.len());
                merged.push(incoming);
            }
        }
    }

    enforce_single_canonical(&mut merged);

    if identity_key.is_default()
        && !merged
            .iter()
            .any(|thread| thread.is_canonical_for(identity_key))
    {
        let synthesized = Thread::local(seed.thread_id, Some(identity_key.clone()), seed.now_ms)
            .canonical();
        merged.push(synthesized);
    }

    sort_threads(&mut merged, identity_key);
    merged
}

fn merge_thread(local: &mut Thread, loaded: Thread) {
    let loaded_has_default_title = loaded.has_default_title();
    if local.messages.is_empty() {
        local.messages = loaded.messages;
    } else {
        let local_ids = local
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();
        let loaded_ids = loaded
            .messages
            .iter()
            .map(|message| message.id.clone())
            .collect::<HashSet<_>>();

        // The archive holding a message proves the append landed.
        for message in &mut local.messages {
            if loaded_ids.contains(&message.id)
                && matches!(message.delivery, Delivery::Pending | Delivery::Failed)
                && !message.is_typing()
            {
                message.delivery = Delivery::Persisted;
            }
        }

        let additions = loaded
            .messages
            .into_iter()
            .filter(|message| !local_ids.contains(&message.id))
            .collect::<Vec<_>>();
        if !additions.is_empty() {
            local.messages.extend(additions);
            local.messages.sort_by_key(|message| message.timestamp_ms);
        }
    }

    if local.has_default_title() && !loaded_has_default_title {
        local.title = loaded.title;
    }
    if loaded.updated_at_ms > local.updated_at_ms {
        local.archived = loaded.archived;
    }
    local.created_at_ms = local.created_at_ms.min(loaded.created_at_ms);
    local.touch(loaded.updated_at_ms);
    if local.identity_key.is_none() {
        local.identity_key = loaded.identity_key;
    }
    local.is_canonical |= loaded.is_canonical;
    local.persisted |= loaded.persisted;
}

/// Keeps one canonical thread per identity key and demotes the rest.
///
/// Preference: a deterministic canonical id, then the most messages, then the oldest
/// thread, then the smallest id.
pub fn enforce_single_canonical(threads: &mut [Thread]) {
    let mut groups: HashMap<Option<IdentityKey>, Vec<usize>> = HashMap::new();
    for (position, thread) in threads.iter().enumerate() {
        if thread.is_canonical {
            groups
                .entry(thread.identity_key.clone())
                .or_default()
                .push(position);
        }
    }

    for (key, positions) in groups {
        if positions.len() < 2 {
            continue;
        }

        let keep = positions.iter().copied().min_by_key(|&position| {
            let thread = &threads[position];
            let deterministic = key
                .as_ref()
                .is_some_and(|key| is_canonical_id_for(&thread.id, key));
            (
                !deterministic,
                Reverse(thread.messages.len()),
                thread.created_at_ms,
                thread.id.clone(),
            )
        });

        for position in positions {
            if Some(position) != keep {
                tracing::debug!(
                    thread_id = %threads[position].id,
                    "demoting duplicate canonical thread"
                );
                threads[position].is_canonical = false;
            }
        }
    }
}

/// Canonical thread of the active key first, then other canonical threads, then the rest by
/// most recent update.
pub fn sort_threads(threads: &mut [Thread], identity_key: &IdentityKey) {
    threads.sort_by(|left, right| {
        let rank = |thread: &Thread| {
            if thread.is_canonical_for(identity_key) {
                0
            } else if thread.is_canonical {
                1
            } else {
                2
            }
        };
        rank(left)
            .cmp(&rank(right))
            .then_with(|| right.updated_at_ms.cmp(&left.updated_at_ms))
            .then_with(|| left.id.cmp(&right.id))
    });
}

#[cfg(test)]
mod tests {
    use threadline_llm::ResponsePacket;
    use threadline_storage::MessageId;

    use super::*;
    use crate::canonical::canonical_thread_id;
    use crate::model::Message;

    fn key(raw: &str) -> IdentityKey {
        IdentityKey::new(raw).expect("key")
    }

    fn seed(key: &IdentityKey) -> CanonicalSeed {
        CanonicalSeed {
            thread_id: canonical_thread_id(key, 0),
            now_ms: 1_000,
        }
    }

    fn persisted(text: &str, timestamp_ms: u64) -> Message {
        let mut message = Message::user(text, Vec::new(), timestamp_ms);
        message.delivery = Delivery::Persisted;
        message
    }

    fn canonical(key: &IdentityKey, messages: Vec<Message>) -> Thread {
        let mut thread = Thread::local(canonical_thread_id(key, 0), Some(key.clone()), 10).canonical();
        thread.messages = messages;
        thread.persisted = true;
        thread
    }

    #[test]
    fn stale_load_never_drops_optimistic_messages() {
        let key = IdentityKey::default_key();
        let old = persisted("earlier", 1);
        let optimistic = Message::user("just sent", Vec::new(), 5);
        let placeholder = Message::placeholder(MessageId::new_v7(), 5);
        let current = vec![canonical(
            &key,
            vec![old.clone(), optimistic.clone(), placeholder.clone()],
        )];
        let loaded = vec![canonical(&key, vec![old])];

        let merged = merge(&current, loaded, &key, seed(&key));

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].messages.len(), 3);
        assert!(merged[0].message(&optimistic.id).is_some());
        assert!(merged[0].message(&placeholder.id).is_some());
    }

    #[test]
    fn empty_local_thread_takes_loaded_messages() {
        let key = IdentityKey::default_key();
        let current = vec![canonical(&key, Vec::new())];
        let loaded = vec![canonical(&key, vec![persisted("a", 1), persisted("b", 2)])];

        let merged = merge(&current, loaded, &key, seed(&key));
        assert_eq!(merged[0].messages.len(), 2);
    }

    #[test]
    fn empty_local_thread_takes_loaded_messages_and_title_together() {
        let key = IdentityKey::default_key();
        let current = vec![canonical(&key, Vec::new())];
        let mut loaded = canonical(&key, vec![persisted("a", 1)]);
        loaded.title = "Saved elsewhere".to_string();

        let merged = merge(&current, vec![loaded], &key, seed(&key));

        assert_eq!(merged[0].title, "Saved elsewhere");
        assert_eq!(merged[0].messages.len(), 1);
        assert_eq!(merged[0].messages[0].text(), "a");
    }

    #[test]
    fn loaded_only_messages_are_unioned_in_timestamp_order() {
        let key = IdentityKey::default_key();
        let local = persisted("local", 5);
        let remote = persisted("remote", 3);
        let current = vec![canonical(&key, vec![local.clone()])];
        let loaded = vec![canonical(&key, vec![remote.clone(), local])];

        let merged = merge(&current, loaded, &key, seed(&key));
        let texts = merged[0]
            .messages
            .iter()
            .map(Message::text)
            .collect::<Vec<_>>();
        assert_eq!(texts, vec!["remote", "local"]);
    }

    #[test]
    fn archive_copy_confirms_failed_delivery() {
        let key = IdentityKey::default_key();
        let mut failed = Message::user("retry me", Vec::new(), 4);
        failed.delivery = Delivery::Failed;
        let mut archived = failed.clone();
        archived.delivery = Delivery::Persisted;

        let merged = merge(
            &[canonical(&key, vec![failed.clone()])],
            vec![canonical(&key, vec![archived])],
            &key,
            seed(&key),
        );
        assert_eq!(
            merged[0].message(&failed.id).map(|message| message.delivery),
            Some(Delivery::Persisted)
        );
    }

    #[test]
    fn duplicate_canonical_threads_are_demoted() {
        let key = key("lin-001");
        let deterministic = canonical(&key, vec![persisted("x", 1)]);
        let mut stray = Thread::local(ThreadId::new_v7(), Some(key.clone()), 0).canonical();
        stray.messages = vec![persisted("a", 1), persisted("b", 2)];

        let merged = merge(&[deterministic.clone()], vec![stray], &key, seed(&key));

        let canonical_ids = merged
            .iter()
            .filter(|thread| thread.is_canonical_for(&key))
            .map(|thread| thread.id.clone())
            .collect::<Vec<_>>();
        assert_eq!(canonical_ids, vec![deterministic.id]);
        assert_eq!(merged.len(), 2);
    }

    #[test]
    fn default_key_gets_one_synthesized_canonical_thread() {
        let key = IdentityKey::default_key();
        let merged = merge(&[], Vec::new(), &key, seed(&key));

        assert_eq!(merged.len(), 1);
        assert!(merged[0].is_canonical_for(&key));
        assert!(!merged[0].persisted);

        let again = merge(&merged, Vec::new(), &key, seed(&key));
        assert_eq!(again.len(), 1);
    }

    #[test]
    fn other_keys_are_not_synthesized() {
        let merged = merge(&[], Vec::new(), &key("lin-001"), seed(&key("lin-001")));
        assert!(merged.is_empty());
    }

    #[test]
    fn canonical_first_then_recent() {
        let key = IdentityKey::default_key();
        let mut older = Thread::local(ThreadId::new_v7(), Some(key.clone()), 5);
        older.updated_at_ms = 5;
        let mut newer = Thread::local(ThreadId::new_v7(), Some(key.clone()), 50);
        newer.updated_at_ms = 50;
        let anchor = canonical(&key, Vec::new());

        let merged = merge(&[], vec![older.clone(), anchor.clone(), newer.clone()], &key, seed(&key));
        let ids = merged.iter().map(|thread| thread.id.clone()).collect::<Vec<_>>();
        assert_eq!(ids, vec![anchor.id, newer.id, older.id]);
    }

    #[test]
    fn loaded_title_replaces_only_the_default_title() {
        let key = IdentityKey::default_key();
        let mut local = canonical(&key, vec![persisted("x", 1)]);
        let mut loaded = local.clone();
        loaded.title = "Trip plans".to_string();

        let merged = merge(&[local.clone()], vec![loaded.clone()], &key, seed(&key));
        assert_eq!(merged[0].title, "Trip plans");

        local.title = "Mine".to_string();
        let merged = merge(&[local], vec![loaded], &key, seed(&key));
        assert_eq!(merged[0].title, "Mine");
    }

    #[test]
    fn packets_survive_merge_untouched() {
        let key = IdentityKey::default_key();
        let mut answer = Message::synthetic(MessageId::new_v7(), ResponsePacket::answer("hi"), 2);
        answer.delivery = Delivery::Persisted;
        let merged = merge(
            &[canonical(&key, vec![answer.clone()])],
            vec![canonical(&key, Vec::new())],
            &key,
            seed(&key),
        );
        assert_eq!(merged[0].messages, vec![answer]);
    }
}
