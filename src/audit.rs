//! Audit trail of metadata field changes.
//!
//! Entries are append-only. Reads return newest first, the opposite of
//! content history, which has to be replayed in order.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, Row, SqliteConnection};

use crate::error::Result;
use crate::models::{format_ts, parse_ts, AuditEntry, FieldChange};

const SELECT_ENTRIES: &str = "SELECT id, field, old_value, new_value, changed_at FROM audit_log";

fn encode_value(value: &Option<serde_json::Value>) -> Result<Option<String>> {
    Ok(value.as_ref().map(serde_json::to_string).transpose()?)
}

fn decode_value(raw: Option<String>) -> Result<Option<serde_json::Value>> {
    Ok(raw.as_deref().map(serde_json::from_str).transpose()?)
}

fn row_to_entry(row: &SqliteRow) -> Result<AuditEntry> {
    let changed_at: String = row.get("changed_at");
    Ok(AuditEntry {
        id: row.get("id"),
        field: row.get("field"),
        old_value: decode_value(row.get("old_value"))?,
        new_value: decode_value(row.get("new_value"))?,
        changed_at: parse_ts("changed_at", &changed_at)?,
    })
}

pub async fn log_change(conn: &mut SqliteConnection, change: &FieldChange) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO audit_log (field, old_value, new_value, changed_at) VALUES (?, ?, ?, ?)",
    )
    .bind(&change.field)
    .bind(encode_value(&change.old_value)?)
    .bind(encode_value(&change.new_value)?)
    .bind(format_ts(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Append a batch atomically: either every entry is written or none is.
pub async fn log_changes(conn: &mut SqliteConnection, changes: &[FieldChange]) -> Result<()> {
    if changes.is_empty() {
        return Ok(());
    }
    let mut tx = conn.begin().await?;
    for change in changes {
        log_change(&mut *tx, change).await?;
    }
    tx.commit().await?;
    Ok(())
}

pub async fn get_trail(conn: &mut SqliteConnection) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(&format!("{} ORDER BY changed_at DESC, id DESC", SELECT_ENTRIES))
        .fetch_all(&mut *conn)
        .await?;
    rows.iter().map(row_to_entry).collect()
}

pub async fn get_field_history(conn: &mut SqliteConnection, field: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(&format!(
        "{} WHERE field = ? ORDER BY changed_at DESC, id DESC",
        SELECT_ENTRIES
    ))
    .bind(field)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_entry).collect()
}

/// Entries recorded at or after `since`.
pub async fn get_since(conn: &mut SqliteConnection, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query(&format!(
        "{} WHERE changed_at >= ? ORDER BY changed_at DESC, id DESC",
        SELECT_ENTRIES
    ))
    .bind(format_ts(since))
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_entry).collect()
}

pub async fn get_count(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM audit_log")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}
