use serde::{Deserialize, Serialize};
use threadline_llm::{ResponsePacket, answer_text};
use threadline_storage::{DEFAULT_THREAD_TITLE, MessageId, MessageRole, ThreadId};

use super::runtime::IdentityKey;

/// Lightweight file descriptor. Raw bytes never enter the thread model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub name: String,
    pub size_bytes: u64,
    pub kind: String,
}

impl Attachment {
    pub fn new(name: impl Into<String>, size_bytes: u64, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size_bytes,
            kind: kind.into(),
        }
    }
}

/// A message body is either plain text or a list of response packets, never both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Content {
    Text(String),
    Packets(Vec<ResponsePacket>),
}

impl Content {
    pub fn text(&self) -> String {
        match self {
            Self::Text(text) => text.clone(),
            Self::Packets(packets) => answer_text(packets),
        }
    }
}

/// UI-only marker. Never written to the archive or the local snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransientState {
    Typing { status: Option<String> },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationMetrics {
    pub elapsed_ms: u64,
    #[serde(default)]
    pub reasoning_trace: Option<String>,
}

/// Where a message stands relative to the durable store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    /// Shown optimistically; the append has not resolved yet.
    Pending,
    Persisted,
    /// The append failed. The message stays visible with an error indicator.
    Failed,
    /// Produced locally (greetings, failure notices); never written to the archive.
    Synthetic,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: Content,
    pub timestamp_ms: u64,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(skip)]
    pub transient_state: Option<TransientState>,
    #[serde(default)]
    pub generation_metrics: Option<GenerationMetrics>,
    pub delivery: Delivery,
}

impl Message {
    pub fn user(text: impl Into<String>, attachments: Vec<Attachment>, timestamp_ms: u64) -> Self {
        Self {
            id: MessageId::new_v7(),
            role: MessageRole::User,
            content: Content::Text(text.into()),
            timestamp_ms,
            attachments,
            transient_state: None,
            generation_metrics: None,
            delivery: Delivery::Pending,
        }
    }

    /// In-progress assistant message that is later replaced in place.
    pub fn placeholder(id: MessageId, timestamp_ms: u64) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: Content::Packets(Vec::new()),
            timestamp_ms,
            attachments: Vec::new(),
            transient_state: Some(TransientState::Typing { status: None }),
            generation_metrics: None,
            delivery: Delivery::Pending,
        }
    }

    pub fn synthetic(id: MessageId, packet: ResponsePacket, timestamp_ms: u64) -> Self {
        Self {
            id,
            role: MessageRole::Assistant,
            content: Content::Packets(vec![packet]),
            timestamp_ms,
            attachments: Vec::new(),
            transient_state: None,
            generation_metrics: None,
            delivery: Delivery::Synthetic,
        }
    }

    pub fn is_typing(&self) -> bool {
        self.transient_state.is_some()
    }

    /// Only settled, non-synthetic messages may reach the archive.
    pub fn is_persistable(&self) -> bool {
        self.transient_state.is_none() && self.delivery != Delivery::Synthetic
    }

    pub fn text(&self) -> String {
        self.content.text()
    }

    pub fn status_line(&self) -> Option<&str> {
        match &self.transient_state {
            Some(TransientState::Typing { status }) => status.as_deref(),
            None => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Thread {
    pub id: ThreadId,
    pub title: String,
    pub messages: Vec<Message>,
    pub identity_key: Option<IdentityKey>,
    pub is_canonical: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub archived: bool,
    /// False until the archive holds a row for this thread.
    pub persisted: bool,
}

impl Thread {
    /// A thread that so far exists only in memory.
    pub fn local(id: ThreadId, identity_key: Option<IdentityKey>, now_ms: u64) -> Self {
        Self {
            id,
            title: DEFAULT_THREAD_TITLE.to_string(),
            messages: Vec::new(),
            identity_key,
            is_canonical: false,
            created_at_ms: now_ms,
            updated_at_ms: now_ms,
            archived: false,
            persisted: false,
        }
    }

    pub fn canonical(mut self) -> Self {
        self.is_canonical = true;
        self
    }

    pub fn has_default_title(&self) -> bool {
        let title = self.title.trim();
        title.is_empty() || title == DEFAULT_THREAD_TITLE
    }

    pub fn belongs_to(&self, identity_key: &IdentityKey) -> bool {
        match &self.identity_key {
            Some(key) => key == identity_key,
            None => identity_key.is_default(),
        }
    }

    pub fn is_canonical_for(&self, identity_key: &IdentityKey) -> bool {
        self.is_canonical && self.belongs_to(identity_key)
    }

    pub fn message(&self, id: &MessageId) -> Option<&Message> {
        self.messages.iter().find(|message| &message.id == id)
    }

    pub fn message_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|message| &message.id == id)
    }

    /// Advances `updated_at_ms`, never moving it backwards.
    pub fn touch(&mut self, now_ms: u64) {
        self.updated_at_ms = self.updated_at_ms.max(now_ms);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_state_is_not_serialized() {
        let message = Message::placeholder(MessageId::new_v7(), 5);
        let encoded = serde_json::to_string(&message).expect("encode");
        assert!(!encoded.contains("typing"));

        let decoded: Message = serde_json::from_str(&encoded).expect("decode");
        assert!(!decoded.is_typing());
    }

    #[test]
    fn touch_never_moves_backwards() {
        let mut thread = Thread::local(ThreadId::new_v7(), None, 100);
        thread.touch(50);
        assert_eq!(thread.updated_at_ms, 100);
        thread.touch(150);
        assert_eq!(thread.updated_at_ms, 150);
    }

    #[test]
    fn unkeyed_threads_belong_to_the_default_identity() {
        let thread = Thread::local(ThreadId::new_v7(), None, 1);
        assert!(thread.belongs_to(&IdentityKey::default_key()));
        assert!(!thread.belongs_to(&IdentityKey::new("lin-001").expect("key")));
    }

    #[test]
    fn synthetic_and_typing_messages_are_not_persistable() {
        let typing = Message::placeholder(MessageId::new_v7(), 1);
        let notice = Message::synthetic(MessageId::new_v7(), ResponsePacket::answer("hi"), 1);
        let user = Message::user("hello", Vec::new(), 1);
        assert!(!typing.is_persistable());
        assert!(!notice.is_persistable());
        assert!(user.is_persistable());
    }
}
