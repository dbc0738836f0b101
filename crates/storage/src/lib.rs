use std::future::Future;
use std::pin::Pin;

pub mod error;
pub mod ids;
pub mod memory;
pub mod sqlite;
pub mod types;

pub use error::{StorageError, StorageErrorKind, StorageResult};
pub use ids::{MessageId, ThreadId};
pub use memory::{GatewayOp, MemoryGateway};
pub use sqlite::SqliteGateway;
pub use types::{
    AppendOutcome, AttachmentRecord, ConversationPatch, ConversationRecord, DEFAULT_THREAD_TITLE,
    MessageRecord, MessageRole, MetricsRecord, NewConversation,
};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Durable conversation archive, scoped by owner key.
///
/// Implementations must treat message ids and explicit thread ids as de-duplication keys
/// so callers can retry without double writes.
pub trait ConversationGateway: Send + Sync {
    /// Lists every conversation of the owner, tombstoned ones included. An unknown owner
    /// yields an empty list.
    fn list_conversations<'a>(
        &'a self,
        owner_key: &'a str,
    ) -> BoxFuture<'a, StorageResult<Vec<ConversationRecord>>>;

    fn create_conversation<'a>(
        &'a self,
        input: NewConversation,
    ) -> BoxFuture<'a, StorageResult<ConversationRecord>>;

    fn append_message<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
        message: MessageRecord,
    ) -> BoxFuture<'a, StorageResult<AppendOutcome>>;

    fn update_conversation<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
        patch: ConversationPatch,
    ) -> BoxFuture<'a, StorageResult<()>>;

    /// Writes a deletion tombstone. Rows are never physically removed.
    fn tombstone_conversation<'a>(
        &'a self,
        owner_key: &'a str,
        thread_id: &'a ThreadId,
    ) -> BoxFuture<'a, StorageResult<()>>;
}
