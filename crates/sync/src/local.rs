use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use snafu::ResultExt;

use super::error::{LocalStoreDecodeSnafu, LocalStoreEncodeSnafu, LocalStoreIoSnafu, SyncResult};
use super::model::Thread;
use super::runtime::RuntimeDescriptor;

const SNAPSHOT_VERSION: u32 = 1;
const RUNTIME_SELECTION_FILE_NAME: &str = "runtime.json";

/// Serialized thread set kept for recovery when the archive is unreachable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: u32,
    pub owner_key: String,
    pub saved_at_ms: u64,
    pub threads: Vec<Thread>,
}

/// Per-owner snapshot files under one directory. Never authoritative over the archive.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    directory: PathBuf,
}

impl SnapshotStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, owner_key: &str) -> PathBuf {
        self.directory.join(format!("{}.json", file_stem(owner_key)))
    }

    /// Writes `threads` without their typing placeholders; a reply still in flight has
    /// nothing durable to restore.
    pub fn save(&self, owner_key: &str, threads: &[Thread], now_ms: u64) -> SyncResult<()> {
        let threads = threads
            .iter()
            .map(|thread| {
                let mut settled = thread.clone();
                settled.messages.retain(|message| !message.is_typing());
                settled
            })
            .collect();
        let snapshot = Snapshot {
            version: SNAPSHOT_VERSION,
            owner_key: owner_key.to_string(),
            saved_at_ms: now_ms,
            threads,
        };
        write_json_atomically(&self.path_for(owner_key), &snapshot)
    }

    /// Returns `None` when no snapshot exists or it was written for another owner or
    /// format version.
    pub fn load(&self, owner_key: &str) -> SyncResult<Option<Snapshot>> {
        let Some(snapshot) = read_json::<Snapshot>(&self.path_for(owner_key))? else {
            return Ok(None);
        };
        if snapshot.version != SNAPSHOT_VERSION || snapshot.owner_key != owner_key {
            tracing::warn!(
                owner_key,
                version = snapshot.version,
                "ignoring snapshot written for a different owner or format"
            );
            return Ok(None);
        }
        Ok(Some(snapshot))
    }
}

/// Remembers the selected runtime across restarts.
#[derive(Debug, Clone)]
pub struct RuntimeSelectionStore {
    path: PathBuf,
}

impl RuntimeSelectionStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn in_directory(directory: impl AsRef<Path>) -> Self {
        Self::new(directory.as_ref().join(RUNTIME_SELECTION_FILE_NAME))
    }

    pub fn save(&self, runtime: &RuntimeDescriptor) -> SyncResult<()> {
        write_json_atomically(&self.path, runtime)
    }

    pub fn load(&self) -> SyncResult<Option<RuntimeDescriptor>> {
        read_json(&self.path)
    }
}

fn file_stem(owner_key: &str) -> String {
    let stem = owner_key
        .trim()
        .chars()
        .map(|ch| {
            if ch.is_ascii_alphanumeric() || ch == '-' || ch == '_' {
                ch
            } else {
                '_'
            }
        })
        .collect::<String>();
    if stem.is_empty() {
        "anonymous".to_string()
    } else {
        stem
    }
}

pub(crate) fn write_json_atomically<T: Serialize>(path: &Path, value: &T) -> SyncResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).context(LocalStoreIoSnafu {
            stage: "create-local-store-directory",
            path: parent.to_path_buf(),
        })?;
    }

    let content = serde_json::to_string(value).context(LocalStoreEncodeSnafu {
        stage: "serialize-local-store-json",
    })?;

    let temp_path = path.with_extension("json.tmp");
    std::fs::write(&temp_path, content).context(LocalStoreIoSnafu {
        stage: "write-temporary-local-store-file",
        path: temp_path.clone(),
    })?;
    std::fs::rename(&temp_path, path).context(LocalStoreIoSnafu {
        stage: "rename-temporary-local-store-file",
        path: path.to_path_buf(),
    })?;
    Ok(())
}

fn read_json<T: DeserializeOwned>(path: &Path) -> SyncResult<Option<T>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(source).context(LocalStoreIoSnafu {
                stage: "read-local-store-file",
                path: path.to_path_buf(),
            });
        }
    };

    serde_json::from_str(&content)
        .map(Some)
        .context(LocalStoreDecodeSnafu {
            stage: "parse-local-store-file",
            path: path.to_path_buf(),
        })
}
