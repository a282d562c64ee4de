//! SQLite store behind the vault.
//!
//! One file holds the whole ledger: `manuscripts` (with their `snippets`),
//! `download_jobs` and `export_jobs`. The schema lives in `migrations/` and
//! is brought up to date every time the vault is opened. WAL journaling
//! lets the CLI and status pollers read while job workers write.
//!
//! ```no_run
//! use scriptorium_core::Database;
//! use std::path::Path;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let db = Database::open(Path::new("data/vault.db")).await?;
//! println!("schema {:?}", db.schema_version().await?);
//! # Ok(())
//! # }
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::{debug, instrument};

/// Tables every vault must carry after migrations ran.
pub const VAULT_TABLES: [&str; 4] = ["manuscripts", "snippets", "download_jobs", "export_jobs"];

/// SQLite locks the whole file, so a handful of connections is plenty.
const MAX_CONNECTIONS: u32 = 5;

/// How long a writer waits on a locked vault before `SQLITE_BUSY`.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Error, Debug)]
pub enum DbError {
    #[error("cannot create vault directory '{path}': {source}")]
    CreateDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("vault database error: {0}")]
    Connection(#[from] sqlx::Error),

    #[error("vault schema migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("vault schema is missing tables: {}", .0.join(", "))]
    MissingTables(Vec<String>),
}

/// Connection pool over the vault file.
#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens the vault at `db_path`, creating the file and its parent folder
    /// on first use, then migrates the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::CreateDir`] when the parent folder cannot be made,
    /// [`DbError::Connection`], [`DbError::Migration`], or
    /// [`DbError::MissingTables`] when the migrated schema is incomplete.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self, DbError> {
        if let Some(parent) = db_path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| DbError::CreateDir {
                    path: parent.to_path_buf(),
                    source,
                })?;
        }

        let options = SqliteConnectOptions::new()
            .filename(db_path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        Self::migrated(pool).await
    }

    /// Throwaway vault in memory, on a single connection so every query
    /// sees the same database.
    ///
    /// # Errors
    ///
    /// Same as [`Database::open`], minus the directory error.
    #[instrument]
    pub async fn in_memory() -> Result<Self, DbError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::migrated(pool).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DbError> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        let db = Self { pool };
        let missing = db.missing_tables().await?;
        if !missing.is_empty() {
            return Err(DbError::MissingTables(missing));
        }
        debug!("vault schema ready");
        Ok(db)
    }

    #[must_use]
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Vault tables absent from the schema.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the catalog query fails.
    pub async fn missing_tables(&self) -> Result<Vec<String>, DbError> {
        let present: Vec<(String,)> = sqlx::query_as("SELECT name FROM sqlite_master WHERE type = 'table'")
            .fetch_all(&self.pool)
            .await?;
        Ok(VAULT_TABLES
            .iter()
            .filter(|table| !present.iter().any(|(name,)| name == *table))
            .map(|table| (*table).to_string())
            .collect())
    }

    /// Latest applied migration, `None` on a vault that was never migrated.
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the query fails.
    pub async fn schema_version(&self) -> Result<Option<i64>, DbError> {
        let version: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM _sqlx_migrations WHERE success = 1")
                .fetch_one(&self.pool)
                .await?;
        Ok(version)
    }

    /// Current journal mode, lower-cased (`wal` for file vaults).
    ///
    /// # Errors
    ///
    /// Returns [`DbError::Connection`] if the pragma fails.
    pub async fn journal_mode(&self) -> Result<String, DbError> {
        let (mode,): (String,) = sqlx::query_as("PRAGMA journal_mode").fetch_one(&self.pool).await?;
        Ok(mode.to_ascii_lowercase())
    }

    /// Waits for in-flight queries, then closes every connection.
    #[instrument(skip(self))]
    pub async fn close(self) {
        self.pool.close().await;
    }
}
