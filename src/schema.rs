//! Schema definition, generation stamping, migration, and validation.
//!
//! A document file carries seven tables. The `schema_version` table holds a
//! single integer, the structural generation the file was last written by.
//! Generations only move forward.
//!
//! # Generations
//!
//! | Version | Change |
//! |---------|--------|
//! | 1 | Initial layout |
//! | 2 | Every document carries an `id` metadata key (no table change) |

use sqlx::{Connection, SqliteConnection};
use tracing::{debug, info};

use crate::error::{DocError, Result};

/// Generation written by this build.
pub const SCHEMA_VERSION: i64 = 2;

/// Tables every valid document must contain.
pub const REQUIRED_TABLES: [&str; 7] = [
    "metadata",
    "content",
    "content_history",
    "audit_log",
    "artifacts",
    "enhancement_log",
    "schema_version",
];

const CREATE_STATEMENTS: [&str; 11] = [
    r#"
    CREATE TABLE IF NOT EXISTS metadata (
        key TEXT PRIMARY KEY,
        value TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS content (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_type TEXT NOT NULL CHECK (content_type IN ('transcript', 'summary', 'notes')),
        text TEXT NOT NULL DEFAULT '',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS content_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        content_id INTEGER NOT NULL,
        diff TEXT NOT NULL,
        created_at TEXT NOT NULL,
        FOREIGN KEY (content_id) REFERENCES content(id) ON DELETE CASCADE
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS audit_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        field TEXT NOT NULL,
        old_value TEXT,
        new_value TEXT,
        changed_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS artifacts (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        artifact_type TEXT NOT NULL,
        data BLOB,
        metadata TEXT,
        created_at TEXT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS enhancement_log (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        phase TEXT NOT NULL CHECK (phase IN ('transcribe', 'clean', 'extract', 'classify', 'route', 'review')),
        action TEXT NOT NULL,
        details TEXT,
        entities TEXT
    )
    "#,
    "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL)",
    "CREATE INDEX IF NOT EXISTS idx_content_history_content_id ON content_history(content_id)",
    "CREATE INDEX IF NOT EXISTS idx_audit_log_field ON audit_log(field, changed_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_artifacts_type ON artifacts(artifact_type, created_at DESC)",
    "CREATE INDEX IF NOT EXISTS idx_enhancement_log_timestamp ON enhancement_log(timestamp)",
];

/// Outcome of [`validate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaValidation {
    pub valid: bool,
    pub missing: Vec<String>,
}

/// Create every table that does not exist yet, and stamp the current
/// generation if no version row is present. Safe to run repeatedly.
pub async fn ensure_initialized(conn: &mut SqliteConnection) -> Result<()> {
    let mut tx = conn.begin().await?;

    for stmt in CREATE_STATEMENTS {
        sqlx::query(stmt).execute(&mut *tx).await?;
    }

    let stamped: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM schema_version")
        .fetch_one(&mut *tx)
        .await?;
    if stamped == 0 {
        sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
            .bind(SCHEMA_VERSION)
            .execute(&mut *tx)
            .await?;
        debug!(version = SCHEMA_VERSION, "stamped schema version");
    }

    tx.commit().await?;
    Ok(())
}

/// Stored generation, or 0 when the version table is absent or empty.
///
/// Never fails: an unreadable version table counts as generation 0.
pub async fn get_version(conn: &mut SqliteConnection) -> i64 {
    let exists = match table_exists(conn, "schema_version").await {
        Ok(exists) => exists,
        Err(e) => {
            debug!(error = %e, "could not inspect schema_version");
            return 0;
        }
    };
    if !exists {
        return 0;
    }

    match sqlx::query_scalar::<_, Option<i64>>("SELECT MAX(version) FROM schema_version")
        .fetch_one(&mut *conn)
        .await
    {
        Ok(version) => version.unwrap_or(0),
        Err(e) => {
            debug!(error = %e, "could not read schema_version");
            0
        }
    }
}

pub async fn needs_migration(conn: &mut SqliteConnection) -> bool {
    get_version(conn).await < SCHEMA_VERSION
}

/// Bring the file up to [`SCHEMA_VERSION`].
///
/// A file with no version behaves as a fresh file. Otherwise each upgrade
/// step from the stored generation onward runs in order, then the current
/// generation is stamped, all in one transaction.
pub async fn migrate(conn: &mut SqliteConnection) -> Result<()> {
    let from = get_version(conn).await;
    if from == 0 {
        return ensure_initialized(conn).await;
    }
    if from >= SCHEMA_VERSION {
        return Ok(());
    }

    let mut tx = conn.begin().await?;
    for version in from..SCHEMA_VERSION {
        apply_step(&mut *tx, version).await?;
    }
    sqlx::query("DELETE FROM schema_version")
        .execute(&mut *tx)
        .await?;
    sqlx::query("INSERT INTO schema_version (version) VALUES (?)")
        .bind(SCHEMA_VERSION)
        .execute(&mut *tx)
        .await?;
    tx.commit().await?;

    info!(from, to = SCHEMA_VERSION, "migrated document schema");
    Ok(())
}

async fn apply_step(_conn: &mut SqliteConnection, from: i64) -> Result<()> {
    match from {
        1 => {
            // identity key is backfilled by the document layer on writable open
            debug!("schema step 1 -> 2 has no table changes");
            Ok(())
        }
        other => Err(DocError::UnsupportedVersion {
            found: other,
            supported: SCHEMA_VERSION,
        }),
    }
}

/// Report which required tables are missing. Nothing is created here.
pub async fn validate(conn: &mut SqliteConnection) -> Result<SchemaValidation> {
    let mut missing = Vec::new();
    for table in REQUIRED_TABLES {
        if !table_exists(conn, table).await? {
            missing.push(table.to_string());
        }
    }
    Ok(SchemaValidation {
        valid: missing.is_empty(),
        missing,
    })
}

async fn table_exists(conn: &mut SqliteConnection, name: &str) -> Result<bool> {
    let exists: bool = sqlx::query_scalar(
        "SELECT COUNT(*) > 0 FROM sqlite_master WHERE type='table' AND name=?",
    )
    .bind(name)
    .fetch_one(&mut *conn)
    .await?;
    Ok(exists)
}
