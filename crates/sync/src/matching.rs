use threadline_storage::ConversationRecord;

use super::canonical::CANONICAL_ID_SEPARATOR;
use super::runtime::{IdentityKey, family_prefix};

/// Which rule tied a stored conversation to an identity key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchBasis {
    IdentityKey,
    ConstructId,
    SessionPrefix,
    Title,
    /// No identity hints at all; adopted by the default key.
    Orphan,
}

/// Decides whether `record` belongs to `key`.
///
/// Rules apply in a fixed order and the first rule with data decides: stored identity key,
/// legacy construct id, session-id prefix, title mention, orphan. A weaker rule is never
/// consulted once a stronger one had data to compare.
pub fn match_thread(record: &ConversationRecord, key: &IdentityKey) -> Option<MatchBasis> {
    if let Some(stored) = record.identity_key.as_deref().and_then(IdentityKey::new) {
        return (&stored == key).then_some(MatchBasis::IdentityKey);
    }

    if let Some(construct) = record.construct_id.as_deref().and_then(IdentityKey::new) {
        return (&construct == key).then_some(MatchBasis::ConstructId);
    }

    if let Some(prefix) = session_prefix(record.id.as_str()) {
        let prefix = prefix.to_lowercase();
        return (family_prefix(&prefix) == key.family()).then_some(MatchBasis::SessionPrefix);
    }

    if title_mentions(&record.title, key) {
        return Some(MatchBasis::Title);
    }

    key.is_default().then_some(MatchBasis::Orphan)
}

fn session_prefix(thread_id: &str) -> Option<&str> {
    thread_id
        .split_once(CANONICAL_ID_SEPARATOR)
        .map(|(prefix, _)| prefix)
        .filter(|prefix| !prefix.is_empty())
}

fn title_mentions(title: &str, key: &IdentityKey) -> bool {
    let family = key.family();
    if family.len() < 2 {
        return false;
    }

    title
        .to_lowercase()
        .split(|ch: char| !(ch.is_alphanumeric() || ch == '-'))
        .any(|token| !token.is_empty() && family_prefix(token) == family)
}
