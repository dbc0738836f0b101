use std::time::{SystemTime, UNIX_EPOCH};

pub mod bootstrap;
pub mod canonical;
pub mod codec;
pub mod config;
pub mod error;
pub mod local;
pub mod matching;
pub mod model;
pub mod pipeline;
pub mod reconcile;
pub mod runtime;
pub mod session;

pub use bootstrap::{BootstrapReport, BootstrapSource, EMERGENCY_GREETING};
pub use canonical::{canonical_thread_id, resolve_canonical};
pub use config::{SettingsError, SettingsStore, SyncSettings};
pub use error::{SyncError, SyncResult};
pub use local::{RuntimeSelectionStore, Snapshot, SnapshotStore};
pub use model::{Attachment, Content, Delivery, GenerationMetrics, Message, Thread, TransientState};
pub use pipeline::{Draft, FinalizeOutcome, PipelineState};
pub use reconcile::{CanonicalSeed, merge};
pub use runtime::{
    CORE_IDENTITY_KEY, CORE_RUNTIME_ID, DEFAULT_IDENTITY_KEY, IdentityKey, RuntimeDescriptor,
    resolve_identity_key,
};
pub use session::{SendOutcome, SendReceipt, SessionEngine, SessionEngineBuilder};

pub(crate) fn now_unix_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|duration| u64::try_from(duration.as_millis()).ok())
        .unwrap_or(0)
}
