use std::path::PathBuf;

use snafu::Snafu;
use threadline_storage::{MessageId, StorageError, ThreadId};

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum SyncError {
    #[snafu(display("message rejected on `{stage}`: {reason}"))]
    Validation { stage: &'static str, reason: String },
    #[snafu(display("thread {thread_id} is not loaded (stage `{stage}`)"))]
    UnknownThread {
        stage: &'static str,
        thread_id: ThreadId,
    },
    #[snafu(display("message was not saved and has been returned to the composer on `{stage}`: {source}"))]
    SendRejected {
        stage: &'static str,
        input: String,
        source: StorageError,
    },
    #[snafu(display("failed to create thread on `{stage}`: {source}"))]
    CreateThread {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("storage call failed on `{stage}`: {source}"))]
    Storage {
        stage: &'static str,
        source: StorageError,
    },
    #[snafu(display("message {message_id} cannot be written to the archive (stage `{stage}`)"))]
    NotPersistable {
        stage: &'static str,
        message_id: MessageId,
    },
    #[snafu(display("failed to encode response packets on `{stage}`: {source}"))]
    EncodePackets {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("local store IO failed at {path:?} on `{stage}`: {source}"))]
    LocalStoreIo {
        stage: &'static str,
        path: PathBuf,
        source: std::io::Error,
    },
    #[snafu(display("failed to encode local store payload on `{stage}`: {source}"))]
    LocalStoreEncode {
        stage: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode local store payload at {path:?} on `{stage}`: {source}"))]
    LocalStoreDecode {
        stage: &'static str,
        path: PathBuf,
        source: serde_json::Error,
    },
}

impl SyncError {
    /// Composer text handed back when a send was rolled back.
    pub fn restored_input(&self) -> Option<&str> {
        match self {
            Self::SendRejected { input, .. } => Some(input),
            _ => None,
        }
    }

    pub fn storage_source(&self) -> Option<&StorageError> {
        match self {
            Self::SendRejected { source, .. }
            | Self::CreateThread { source, .. }
            | Self::Storage { source, .. } => Some(source),
            _ => None,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
