//! Append-only log of enhancement pipeline steps.
//!
//! Steps carry their own timestamp. Reads sort by that timestamp, not by
//! insertion order, so a pipeline may record steps out of order.

use sqlx::sqlite::SqliteRow;
use sqlx::{Connection, QueryBuilder, Row, Sqlite, SqliteConnection};

use crate::error::Result;
use crate::models::{format_ts, parse_ts, EnhancementLogEntry, EnhancementPhase, EnhancementStep};

/// Optional filters for [`get_log`]. Both set means both must match.
#[derive(Debug, Clone, Default)]
pub struct LogFilter {
    pub phase: Option<EnhancementPhase>,
    pub action: Option<String>,
}

fn row_to_entry(row: &SqliteRow) -> Result<EnhancementLogEntry> {
    let timestamp: String = row.get("timestamp");
    let phase: String = row.get("phase");
    let details: Option<String> = row.get("details");
    let entities: Option<String> = row.get("entities");
    Ok(EnhancementLogEntry {
        id: row.get("id"),
        timestamp: parse_ts("timestamp", &timestamp)?,
        phase: phase.parse()?,
        action: row.get("action"),
        details: details.as_deref().map(serde_json::from_str).transpose()?,
        entities: entities.as_deref().map(serde_json::from_str).transpose()?,
    })
}

pub async fn log_step(conn: &mut SqliteConnection, step: &EnhancementStep) -> Result<i64> {
    let details = step.details.as_ref().map(serde_json::to_string).transpose()?;
    let entities = step.entities.as_ref().map(serde_json::to_string).transpose()?;
    let result = sqlx::query(
        "INSERT INTO enhancement_log (timestamp, phase, action, details, entities) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(format_ts(step.timestamp))
    .bind(step.phase.as_str())
    .bind(&step.action)
    .bind(details)
    .bind(entities)
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Append several steps in one transaction.
pub async fn log_steps(conn: &mut SqliteConnection, steps: &[EnhancementStep]) -> Result<Vec<i64>> {
    let mut tx = conn.begin().await?;
    let mut ids = Vec::with_capacity(steps.len());
    for step in steps {
        ids.push(log_step(&mut *tx, step).await?);
    }
    tx.commit().await?;
    Ok(ids)
}

/// Entries matching `filter`, oldest timestamp first.
pub async fn get_log(
    conn: &mut SqliteConnection,
    filter: &LogFilter,
) -> Result<Vec<EnhancementLogEntry>> {
    let mut query: QueryBuilder<Sqlite> = QueryBuilder::new(
        "SELECT id, timestamp, phase, action, details, entities FROM enhancement_log WHERE 1=1",
    );
    if let Some(phase) = filter.phase {
        query.push(" AND phase = ").push_bind(phase.as_str());
    }
    if let Some(action) = &filter.action {
        query.push(" AND action = ").push_bind(action.clone());
    }
    query.push(" ORDER BY timestamp ASC, id ASC");

    let rows = query.build().fetch_all(&mut *conn).await?;
    rows.iter().map(row_to_entry).collect()
}

pub async fn get_count(conn: &mut SqliteConnection) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM enhancement_log")
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

/// Remove every entry. Returns how many were removed.
pub async fn clear_log(conn: &mut SqliteConnection) -> Result<u64> {
    let result = sqlx::query("DELETE FROM enhancement_log")
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}
