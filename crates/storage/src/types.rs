use serde::{Deserialize, Serialize};

use super::ids::{MessageId, ThreadId};

/// Title a conversation carries until it is renamed or auto-titled.
pub const DEFAULT_THREAD_TITLE: &str = "New Conversation";

/// Storage-local message role, decoupled from the in-memory thread model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    System,
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::System => "system",
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "system" => Some(Self::System),
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            _ => None,
        }
    }
}

/// Lightweight file descriptor. Raw bytes never reach the archive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentRecord {
    pub name: String,
    pub size_bytes: u64,
    pub kind: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsRecord {
    pub elapsed_ms: u64,
    #[serde(default)]
    pub reasoning_trace: Option<String>,
}

/// Archived message shape.
///
/// Current rows carry `packets_json`; rows written before the packet format only have
/// bare `content` text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    pub id: MessageId,
    pub role: MessageRole,
    pub content: String,
    pub packets_json: Option<String>,
    pub timestamp_ms: u64,
    pub attachments: Vec<AttachmentRecord>,
    pub metrics: Option<MetricsRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRecord {
    pub id: ThreadId,
    pub owner_key: String,
    pub title: String,
    pub identity_key: Option<String>,
    /// Identity stored by older clients that predate `identity_key`.
    pub construct_id: Option<String>,
    pub is_canonical: bool,
    pub archived: bool,
    pub created_at_ms: u64,
    pub updated_at_ms: u64,
    pub deleted_at_ms: Option<u64>,
    pub messages: Vec<MessageRecord>,
}

impl ConversationRecord {
    pub fn is_tombstoned(&self) -> bool {
        self.deleted_at_ms.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewConversation {
    pub owner_key: String,
    pub title: String,
    pub identity_key: Option<String>,
    /// Explicit id for deterministic creation; a fresh UUIDv7 is minted when absent.
    pub thread_id: Option<ThreadId>,
    pub is_canonical: bool,
}

impl NewConversation {
    pub fn new(owner_key: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            owner_key: owner_key.into(),
            title: title.into(),
            identity_key: None,
            thread_id: None,
            is_canonical: false,
        }
    }

    pub fn with_identity_key(mut self, identity_key: impl Into<String>) -> Self {
        self.identity_key = Some(identity_key.into());
        self
    }

    pub fn with_thread_id(mut self, thread_id: ThreadId) -> Self {
        self.thread_id = Some(thread_id);
        self
    }

    pub fn canonical(mut self) -> Self {
        self.is_canonical = true;
        self
    }

    pub(crate) fn effective_title(&self) -> String {
        if self.title.trim().is_empty() {
            DEFAULT_THREAD_TITLE.to_string()
        } else {
            self.title.clone()
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub archived: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendOutcome {
    Inserted,
    /// The message id was already stored for this conversation; nothing was written.
    AlreadyPresent,
}
