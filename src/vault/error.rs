//! Error types for vault operations.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Structured classification for vault/database failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VaultDbErrorKind {
    /// `SQLite` returned busy/locked under concurrent access.
    BusyOrLocked,
    /// Constraint failure (unique/foreign-key/check/not-null).
    ConstraintViolation,
    /// Connection pool timed out waiting for a free connection.
    PoolTimeout,
    /// Connection pool is closed.
    PoolClosed,
    /// Expected row was not found.
    RowNotFound,
    /// Filesystem or transport IO failure.
    Io,
    /// SQL protocol/driver error.
    Protocol,
    /// Row content could not be decoded (bad JSON column, unknown status).
    Decode,
    /// Unclassified database failure.
    Other,
}

impl VaultDbErrorKind {
    #[must_use]
    pub fn from_sqlx(error: &sqlx::Error) -> Self {
        match error {
            sqlx::Error::PoolTimedOut => Self::PoolTimeout,
            sqlx::Error::PoolClosed => Self::PoolClosed,
            sqlx::Error::RowNotFound => Self::RowNotFound,
            sqlx::Error::Io(_) => Self::Io,
            sqlx::Error::Protocol(_) => Self::Protocol,
            sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) => Self::Decode,
            sqlx::Error::Database(database_error) => {
                classify_database_error(database_error.as_ref())
            }
            _ => Self::Other,
        }
    }
}

impl fmt::Display for VaultDbErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::BusyOrLocked => "busy_or_locked",
            Self::ConstraintViolation => "constraint_violation",
            Self::PoolTimeout => "pool_timeout",
            Self::PoolClosed => "pool_closed",
            Self::RowNotFound => "row_not_found",
            Self::Io => "io",
            Self::Protocol => "protocol",
            Self::Decode => "decode",
            Self::Other => "other",
        };
        write!(f, "{label}")
    }
}

fn classify_database_error(
    database_error: &(dyn sqlx::error::DatabaseError + 'static),
) -> VaultDbErrorKind {
    let code = database_error.code();
    if matches!(
        code.as_deref(),
        Some("SQLITE_BUSY" | "SQLITE_LOCKED" | "5" | "6")
    ) {
        return VaultDbErrorKind::BusyOrLocked;
    }

    if database_error.is_unique_violation()
        || database_error.is_foreign_key_violation()
        || database_error.is_check_violation()
        || code
            .as_deref()
            .is_some_and(|value| value.starts_with("SQLITE_CONSTRAINT"))
    {
        return VaultDbErrorKind::ConstraintViolation;
    }

    let message = database_error.message().to_ascii_lowercase();
    if message.contains("database is locked")
        || message.contains("database table is locked")
        || message.contains("database is busy")
    {
        return VaultDbErrorKind::BusyOrLocked;
    }

    VaultDbErrorKind::Other
}

/// Errors that can occur during vault operations.
#[derive(Debug, Error)]
pub enum VaultError {
    /// Database operation failed.
    #[error("database error ({kind}): {message}")]
    Database {
        /// Typed classification used for failure handling.
        kind: VaultDbErrorKind,
        /// Human-readable database error text.
        message: String,
    },

    /// No manuscript with this `(doc_id, library)` identity.
    #[error("manuscript not found: {doc_id} ({library})")]
    ManuscriptNotFound {
        /// Document identifier.
        doc_id: String,
        /// Owning library.
        library: String,
    },

    /// No job row with this id.
    #[error("job not found: {0}")]
    JobNotFound(String),

    /// Stored status text is not a known value.
    #[error("invalid status '{status}' stored for {table}")]
    InvalidStatus {
        /// Table the row came from.
        table: &'static str,
        /// The unrecognized value.
        status: String,
    },

    /// The operation is refused while a download is still active for the manuscript.
    #[error("manuscript {doc_id} ({library}) has an active download job {job_id}")]
    ActiveDownload {
        /// Document identifier.
        doc_id: String,
        /// Owning library.
        library: String,
        /// The blocking job.
        job_id: String,
    },

    /// Only terminal job rows may be removed.
    #[error("job {job_id} is still {status}; only terminal jobs can be removed")]
    JobNotTerminal {
        /// The job id.
        job_id: String,
        /// Its current status.
        status: String,
    },

    /// A completed export must point at an existing artifact.
    #[error("export {job_id} cannot complete: artifact missing at {path}")]
    MissingArtifact {
        /// The export job id.
        job_id: String,
        /// The path that does not exist (empty when none was given).
        path: PathBuf,
    },

    /// JSON column (de)serialization failed.
    #[error("invalid JSON in {column}: {message}")]
    Json {
        /// Column name.
        column: &'static str,
        /// Serde error text.
        message: String,
    },

    /// Filesystem side of a compound operation failed.
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being touched.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },
}

impl From<sqlx::Error> for VaultError {
    fn from(err: sqlx::Error) -> Self {
        Self::Database {
            kind: VaultDbErrorKind::from_sqlx(&err),
            message: err.to_string(),
        }
    }
}

impl VaultError {
    /// Creates an IO error for a path.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn json(column: &'static str, err: &serde_json::Error) -> Self {
        Self::Json {
            column,
            message: err.to_string(),
        }
    }

    /// Returns the typed database error kind, when this is a database error.
    #[must_use]
    pub fn database_kind(&self) -> Option<VaultDbErrorKind> {
        match self {
            Self::Database { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Returns true when this error is a database busy/locked condition.
    #[must_use]
    pub fn is_busy_or_locked(&self) -> bool {
        self.database_kind() == Some(VaultDbErrorKind::BusyOrLocked)
    }
}
