//! SQLite connection management for a single document file.
//!
//! A [`Database`] owns exactly one connection. Opening it drives the schema
//! lifecycle: a fresh writable file is initialized, an older one is migrated,
//! and every file is validated before the handle is returned.
//!
//! # Write-Ahead Logging (WAL)
//!
//! Writable handles switch the file to WAL mode so other processes can keep
//! reading while one writer commits. Closing a handle checkpoints the log
//! back into the main file.
//!
//! # Read-only handles
//!
//! A read-only open never creates the file, never changes the journal mode,
//! and never migrates. Validation still runs, so a file with missing tables
//! is rejected in either mode.

use std::path::{Path, PathBuf};

use futures::future::BoxFuture;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Connection, Sqlite, SqliteConnection, Transaction};
use tracing::{debug, warn};

use crate::config::ConnectionConfig;
use crate::error::{DocError, Result};
use crate::schema::{self, SCHEMA_VERSION};

/// Read the stored schema generation without validating or changing the file.
pub async fn read_version(path: &Path, config: &ConnectionConfig) -> Result<i64> {
    let options = SqliteConnectOptions::new()
        .filename(path)
        .read_only(true)
        .busy_timeout(config.busy_timeout());
    let mut conn = SqliteConnection::connect_with(&options).await?;
    let version = schema::get_version(&mut conn).await;
    conn.close().await?;
    Ok(version)
}

/// An open document file.
pub struct Database {
    conn: SqliteConnection,
    path: PathBuf,
    read_only: bool,
    checkpoint_on_close: bool,
}

fn synchronous_mode(setting: &str) -> SqliteSynchronous {
    match setting {
        "off" => SqliteSynchronous::Off,
        "full" => SqliteSynchronous::Full,
        _ => SqliteSynchronous::Normal,
    }
}

impl Database {
    /// Open (and with `create`, create) the file at `path`.
    ///
    /// - Writable, generation 0: tables are created and stamped.
    /// - Writable, older generation: migrated forward.
    /// - Writable, newer generation: refused with
    ///   [`DocError::UnsupportedVersion`].
    /// - Any mode: missing tables fail the open with [`DocError::Structural`].
    pub async fn open(
        path: &Path,
        read_only: bool,
        create: bool,
        config: &ConnectionConfig,
    ) -> Result<Self> {
        let create = create && !read_only;

        if create {
            if let Some(parent) = path.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent)?;
                }
            }
        }

        let mut options = SqliteConnectOptions::new()
            .filename(path)
            .read_only(read_only)
            .create_if_missing(create)
            .foreign_keys(true)
            .busy_timeout(config.busy_timeout());
        if !read_only {
            options = options
                .journal_mode(SqliteJournalMode::Wal)
                .synchronous(synchronous_mode(&config.synchronous));
        }

        let mut conn = SqliteConnection::connect_with(&options).await?;

        let version = schema::get_version(&mut conn).await;
        if !read_only {
            if version == 0 {
                schema::ensure_initialized(&mut conn).await?;
            } else if version > SCHEMA_VERSION {
                return Err(DocError::UnsupportedVersion {
                    found: version,
                    supported: SCHEMA_VERSION,
                });
            } else if version < SCHEMA_VERSION {
                schema::migrate(&mut conn).await?;
            }
        } else if version > SCHEMA_VERSION {
            warn!(
                path = %path.display(),
                version,
                "reading a document written by a newer schema generation"
            );
        }

        let validation = schema::validate(&mut conn).await?;
        if !validation.valid {
            return Err(DocError::Structural {
                missing: validation.missing,
            });
        }

        debug!(path = %path.display(), read_only, version, "opened document database");

        Ok(Self {
            conn,
            path: path.to_path_buf(),
            read_only,
            checkpoint_on_close: config.checkpoint_on_close,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    /// Direct access to the connection for single-statement operations.
    pub fn conn(&mut self) -> &mut SqliteConnection {
        &mut self.conn
    }

    /// Start a transaction. Dropping it without `commit` rolls back.
    pub async fn begin(&mut self) -> Result<Transaction<'_, Sqlite>> {
        Ok(self.conn.begin().await?)
    }

    /// Run `f` inside one transaction.
    ///
    /// The transaction commits when `f` returns `Ok` and rolls back every
    /// write made inside `f` when it returns `Err`.
    pub async fn with_transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: for<'c> FnOnce(&'c mut SqliteConnection) -> BoxFuture<'c, Result<T>>,
    {
        let mut tx = self.conn.begin().await?;
        match f(&mut *tx).await {
            Ok(value) => {
                tx.commit().await?;
                Ok(value)
            }
            Err(e) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback failed");
                }
                Err(e)
            }
        }
    }

    pub async fn schema_version(&mut self) -> i64 {
        schema::get_version(&mut self.conn).await
    }

    /// Checkpoint the WAL into the main file and release the connection.
    ///
    /// Checkpoint failures are ignored on read-only handles and returned on
    /// writable ones; the connection is released either way.
    pub async fn close(mut self) -> Result<()> {
        let mut checkpoint_error = None;
        if self.checkpoint_on_close {
            if let Err(e) = sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
                .execute(&mut self.conn)
                .await
            {
                if self.read_only {
                    debug!(path = %self.path.display(), error = %e, "skipping checkpoint on read-only handle");
                } else {
                    checkpoint_error = Some(e);
                }
            }
        }

        self.conn.close().await?;

        match checkpoint_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}
