//! Typed side payloads attached to a document.
//!
//! Any number of artifacts may share a type; "the" artifact of a type is the
//! most recently created one. The raw capture a transcript came from is kept
//! under the reserved [`RAW_SOURCE_TYPE`]. This module does not enforce
//! write-once semantics for it; the document layer does.

use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::error::{DocError, Result};
use crate::models::{format_ts, parse_ts, Artifact, RawSource};

pub const RAW_SOURCE_TYPE: &str = "raw_source";

const SELECT_ARTIFACTS: &str =
    "SELECT id, artifact_type, data, metadata, created_at FROM artifacts";

fn row_to_artifact(row: &SqliteRow) -> Result<Artifact> {
    let metadata: Option<String> = row.get("metadata");
    let created_at: String = row.get("created_at");
    Ok(Artifact {
        id: row.get("id"),
        artifact_type: row.get("artifact_type"),
        data: row.get("data"),
        metadata: metadata.as_deref().map(serde_json::from_str).transpose()?,
        created_at: parse_ts("created_at", &created_at)?,
    })
}

/// Insert an artifact and return its id.
pub async fn add_artifact(
    conn: &mut SqliteConnection,
    artifact_type: &str,
    data: Option<&[u8]>,
    metadata: Option<&serde_json::Value>,
) -> Result<i64> {
    let metadata_json = metadata.map(serde_json::to_string).transpose()?;
    let result = sqlx::query(
        "INSERT INTO artifacts (artifact_type, data, metadata, created_at) VALUES (?, ?, ?, ?)",
    )
    .bind(artifact_type)
    .bind(data)
    .bind(metadata_json)
    .bind(format_ts(Utc::now()))
    .execute(&mut *conn)
    .await?;
    Ok(result.last_insert_rowid())
}

/// Most recently created artifact of `artifact_type`.
pub async fn get_artifact(
    conn: &mut SqliteConnection,
    artifact_type: &str,
) -> Result<Option<Artifact>> {
    let row = sqlx::query(&format!(
        "{} WHERE artifact_type = ? ORDER BY created_at DESC, id DESC LIMIT 1",
        SELECT_ARTIFACTS
    ))
    .bind(artifact_type)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_artifact).transpose()
}

pub async fn get_artifacts_by_type(
    conn: &mut SqliteConnection,
    artifact_type: &str,
) -> Result<Vec<Artifact>> {
    let rows = sqlx::query(&format!(
        "{} WHERE artifact_type = ? ORDER BY created_at DESC, id DESC",
        SELECT_ARTIFACTS
    ))
    .bind(artifact_type)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_artifact).collect()
}

pub async fn get_all(conn: &mut SqliteConnection) -> Result<Vec<Artifact>> {
    let rows = sqlx::query(&format!(
        "{} ORDER BY created_at DESC, id DESC",
        SELECT_ARTIFACTS
    ))
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_artifact).collect()
}

/// Remove one artifact. Returns whether it existed.
pub async fn delete_artifact(conn: &mut SqliteConnection, id: i64) -> Result<bool> {
    let result = sqlx::query("DELETE FROM artifacts WHERE id = ?")
        .bind(id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

pub async fn artifact_type_of(conn: &mut SqliteConnection, id: i64) -> Result<Option<String>> {
    let artifact_type = sqlx::query_scalar("SELECT artifact_type FROM artifacts WHERE id = ?")
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(artifact_type)
}

pub async fn has_artifact(conn: &mut SqliteConnection, artifact_type: &str) -> Result<bool> {
    let exists: bool =
        sqlx::query_scalar("SELECT COUNT(*) > 0 FROM artifacts WHERE artifact_type = ?")
            .bind(artifact_type)
            .fetch_one(&mut *conn)
            .await?;
    Ok(exists)
}

/// Lowercase hex SHA-256 of `text`.
pub fn content_hash(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Store the raw capture under [`RAW_SOURCE_TYPE`].
///
/// The text becomes the blob; the remaining fields become the JSON
/// metadata. A missing `content_hash` is filled in from the text.
pub async fn set_raw_source(conn: &mut SqliteConnection, source: &RawSource) -> Result<i64> {
    let mut side = source.clone();
    if side.content_hash.is_none() {
        side.content_hash = Some(content_hash(&source.text));
    }
    let metadata = serde_json::to_value(&side)?;
    add_artifact(
        conn,
        RAW_SOURCE_TYPE,
        Some(source.text.as_bytes()),
        Some(&metadata),
    )
    .await
}

pub async fn get_raw_source(conn: &mut SqliteConnection) -> Result<Option<RawSource>> {
    let artifact = match get_artifact(conn, RAW_SOURCE_TYPE).await? {
        Some(artifact) => artifact,
        None => return Ok(None),
    };

    let mut source: RawSource = match artifact.metadata {
        Some(metadata) => serde_json::from_value(metadata)?,
        None => RawSource::default(),
    };
    source.text = match artifact.data {
        Some(bytes) => String::from_utf8(bytes)
            .map_err(|e| DocError::invalid_value(RAW_SOURCE_TYPE, e))?,
        None => String::new(),
    };
    Ok(Some(source))
}

pub async fn has_raw_source(conn: &mut SqliteConnection) -> Result<bool> {
    has_artifact(conn, RAW_SOURCE_TYPE).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_hash_is_sha256_hex() {
        assert_eq!(
            content_hash("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_raw_source_metadata_excludes_text() {
        let source = RawSource {
            text: "hello".to_string(),
            model: Some("whisper-large".to_string()),
            ..Default::default()
        };
        let value = serde_json::to_value(&source).unwrap();
        assert_eq!(value, serde_json::json!({"model": "whisper-large"}));
    }
}
