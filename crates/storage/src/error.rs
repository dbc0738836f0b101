use snafu::Snafu;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum StorageError {
    #[snafu(display("{entity} '{id}' is not in the archive"))]
    NotFound {
        stage: &'static str,
        entity: &'static str,
        id: String,
    },
    #[snafu(display("archive conflict on {entity}: {details}"))]
    Conflict {
        stage: &'static str,
        entity: &'static str,
        details: String,
    },
    #[snafu(display("archive refused {entity}: {details}"))]
    Rejected {
        stage: &'static str,
        entity: &'static str,
        details: String,
    },
    #[snafu(display("'{raw}' is not a valid {id_type}"))]
    InvalidId {
        stage: &'static str,
        id_type: &'static str,
        raw: String,
    },
    #[snafu(display("archive data is inconsistent: {details}"))]
    InvariantViolation {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("storage backend unavailable at {stage}: {details}"))]
    Unavailable {
        stage: &'static str,
        details: String,
    },
    #[snafu(display("failed to encode '{field}' as JSON"))]
    EncodeJson {
        stage: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("failed to decode '{field}' from JSON"))]
    DecodeJson {
        stage: &'static str,
        field: &'static str,
        source: serde_json::Error,
    },
    #[snafu(display("cannot create archive directory {path}"))]
    CreateSqliteDirectory {
        stage: &'static str,
        path: String,
        source: std::io::Error,
    },
    #[snafu(display("invalid archive location '{database_url}'"))]
    SqliteConnectOptions {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot open archive database '{database_url}'"))]
    SqliteConnect {
        stage: &'static str,
        database_url: String,
        source: sqlx::Error,
    },
    #[snafu(display("cannot apply archive pragma '{pragma}'"))]
    SqlitePragma {
        stage: &'static str,
        pragma: &'static str,
        source: sqlx::Error,
    },
    #[snafu(display("archive schema migration failed"))]
    SqliteMigrate {
        stage: &'static str,
        source: sqlx::migrate::MigrateError,
    },
    #[snafu(display("archive query failed at {stage}: {source}"))]
    SqliteQuery {
        stage: &'static str,
        source: sqlx::Error,
    },
}

/// Failure classes callers branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageErrorKind {
    /// Network, timeout or a busy backend. Safe to retry a load, surfaced for appends.
    Transient,
    /// The entity does not exist. Loads treat this as an empty result.
    NotFound,
    /// Quota, validation or conflict. Fatal to the single operation.
    Rejected,
    /// Stored data or ids no longer satisfy the schema.
    Corrupt,
}

impl StorageError {
    pub fn kind(&self) -> StorageErrorKind {
        match self {
            Self::NotFound { .. } => StorageErrorKind::NotFound,
            Self::Conflict { .. } | Self::Rejected { .. } | Self::EncodeJson { .. } => {
                StorageErrorKind::Rejected
            }
            Self::InvalidId { .. } | Self::InvariantViolation { .. } | Self::DecodeJson { .. } => {
                StorageErrorKind::Corrupt
            }
            Self::Unavailable { .. }
            | Self::CreateSqliteDirectory { .. }
            | Self::SqliteConnect { .. }
            | Self::SqlitePragma { .. }
            | Self::SqliteMigrate { .. } => StorageErrorKind::Transient,
            Self::SqliteConnectOptions { .. } => StorageErrorKind::Rejected,
            Self::SqliteQuery { source, .. } => classify_sqlx_error(source),
        }
    }

    pub fn is_transient(&self) -> bool {
        self.kind() == StorageErrorKind::Transient
    }
}

fn classify_sqlx_error(error: &sqlx::Error) -> StorageErrorKind {
    match error {
        sqlx::Error::RowNotFound => StorageErrorKind::NotFound,
        sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
            StorageErrorKind::Transient
        }
        sqlx::Error::Database(database_error) => {
            // SQLITE_BUSY / SQLITE_LOCKED clear up on their own; everything else is a
            // constraint the caller has to react to.
            match database_error.code().as_deref() {
                Some("5") | Some("6") => StorageErrorKind::Transient,
                _ => StorageErrorKind::Rejected,
            }
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => StorageErrorKind::Corrupt,
        _ => StorageErrorKind::Transient,
    }
}

pub type StorageResult<T> = Result<T, StorageError>;
