//! Metadata codec: one [`MetadataRecord`] stored as key/value rows.
//!
//! Each known field maps to exactly one key and one [`FieldKind`]. The
//! encoder and decoder for every field live in the exhaustive matches of
//! [`MetadataField::encode`] and [`MetadataField::decode`], so adding a field
//! to the record without teaching the codec about it does not compile.
//!
//! | Kind | Stored as |
//! |------|-----------|
//! | text | the string verbatim |
//! | timestamp | RFC 3339 (pre-formatted text is kept as given) |
//! | enum | its lowercase name |
//! | number | decimal text |
//! | json | canonical JSON (sorted keys, RFC 3339 nested timestamps) |
//!
//! Keys the codec does not know are left alone by every operation except
//! [`delete_key`].

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use sqlx::{Connection, Row, SqliteConnection};
use tracing::debug;
use uuid::Uuid;

use crate::error::{DocError, Result};
use crate::models::{now_ts, FieldChange, MetadataRecord, Timestamp};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    Timestamp,
    Enum,
    Number,
    Json,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetadataField {
    Id,
    Title,
    Date,
    ProjectId,
    ProjectName,
    Tags,
    Status,
    Confidence,
    Routing,
    StatusHistory,
    Tasks,
    Entities,
    Error,
}

impl MetadataField {
    pub const ALL: [MetadataField; 13] = [
        MetadataField::Id,
        MetadataField::Title,
        MetadataField::Date,
        MetadataField::ProjectId,
        MetadataField::ProjectName,
        MetadataField::Tags,
        MetadataField::Status,
        MetadataField::Confidence,
        MetadataField::Routing,
        MetadataField::StatusHistory,
        MetadataField::Tasks,
        MetadataField::Entities,
        MetadataField::Error,
    ];

    pub fn key(self) -> &'static str {
        match self {
            MetadataField::Id => "id",
            MetadataField::Title => "title",
            MetadataField::Date => "date",
            MetadataField::ProjectId => "project_id",
            MetadataField::ProjectName => "project_name",
            MetadataField::Tags => "tags",
            MetadataField::Status => "status",
            MetadataField::Confidence => "confidence",
            MetadataField::Routing => "routing",
            MetadataField::StatusHistory => "status_history",
            MetadataField::Tasks => "tasks",
            MetadataField::Entities => "entities",
            MetadataField::Error => "error",
        }
    }

    pub fn from_key(key: &str) -> Option<MetadataField> {
        MetadataField::ALL.into_iter().find(|f| f.key() == key)
    }

    pub fn kind(self) -> FieldKind {
        match self {
            MetadataField::Id
            | MetadataField::Title
            | MetadataField::ProjectId
            | MetadataField::ProjectName
            | MetadataField::Error => FieldKind::Text,
            MetadataField::Date => FieldKind::Timestamp,
            MetadataField::Status => FieldKind::Enum,
            MetadataField::Confidence => FieldKind::Number,
            MetadataField::Tags
            | MetadataField::Routing
            | MetadataField::StatusHistory
            | MetadataField::Tasks
            | MetadataField::Entities => FieldKind::Json,
        }
    }

    /// Stored text for this field of `record`, or `None` when absent.
    pub fn encode(self, record: &MetadataRecord) -> Result<Option<String>> {
        Ok(match self {
            MetadataField::Id => record.id.clone(),
            MetadataField::Title => record.title.clone(),
            MetadataField::Date => record.date.as_ref().map(Timestamp::to_stored),
            MetadataField::ProjectId => record.project_id.clone(),
            MetadataField::ProjectName => record.project_name.clone(),
            MetadataField::Tags => record.tags.as_ref().map(canonical_json).transpose()?,
            MetadataField::Status => record.status.map(|s| s.as_str().to_string()),
            MetadataField::Confidence => record
                .confidence
                .map(|c| encode_number(self, c))
                .transpose()?,
            MetadataField::Routing => record.routing.as_ref().map(canonical_json).transpose()?,
            MetadataField::StatusHistory => record
                .status_history
                .as_ref()
                .map(canonical_json)
                .transpose()?,
            MetadataField::Tasks => record.tasks.as_ref().map(canonical_json).transpose()?,
            MetadataField::Entities => record.entities.as_ref().map(canonical_json).transpose()?,
            MetadataField::Error => record.error.clone(),
        })
    }

    /// Set this field of `record` from its stored text.
    pub fn decode(self, record: &mut MetadataRecord, raw: &str) -> Result<()> {
        match self {
            MetadataField::Id => record.id = Some(raw.to_string()),
            MetadataField::Title => record.title = Some(raw.to_string()),
            MetadataField::Date => record.date = Some(Timestamp::from_stored(raw)),
            MetadataField::ProjectId => record.project_id = Some(raw.to_string()),
            MetadataField::ProjectName => record.project_name = Some(raw.to_string()),
            MetadataField::Tags => record.tags = Some(parse_json(self, raw)?),
            MetadataField::Status => record.status = Some(raw.parse()?),
            MetadataField::Confidence => {
                let value = raw
                    .parse::<f64>()
                    .map_err(|e| DocError::invalid_value(self.key(), e))?;
                record.confidence = Some(value);
            }
            MetadataField::Routing => record.routing = Some(parse_json(self, raw)?),
            MetadataField::StatusHistory => record.status_history = Some(parse_json(self, raw)?),
            MetadataField::Tasks => record.tasks = Some(parse_json(self, raw)?),
            MetadataField::Entities => record.entities = Some(parse_json(self, raw)?),
            MetadataField::Error => record.error = Some(raw.to_string()),
        }
        Ok(())
    }

    /// JSON form of a stored value, as recorded in the audit log.
    pub fn to_json(self, stored: &str) -> Result<Value> {
        match self.kind() {
            FieldKind::Text | FieldKind::Timestamp | FieldKind::Enum => {
                Ok(Value::String(stored.to_string()))
            }
            FieldKind::Number => {
                let number = stored
                    .parse::<f64>()
                    .ok()
                    .and_then(serde_json::Number::from_f64);
                Ok(match number {
                    Some(n) => Value::Number(n),
                    None => Value::String(stored.to_string()),
                })
            }
            FieldKind::Json => Ok(serde_json::from_str(stored)?),
        }
    }
}

fn encode_number(field: MetadataField, value: f64) -> Result<String> {
    if value.is_finite() {
        Ok(value.to_string())
    } else {
        Err(DocError::invalid_value(field.key(), format!("{} is not a finite number", value)))
    }
}

fn canonical_json<T: Serialize>(value: &T) -> Result<String> {
    // round-tripping through Value sorts object keys
    let value = serde_json::to_value(value)?;
    Ok(serde_json::to_string(&value)?)
}

fn parse_json<T: DeserializeOwned>(field: MetadataField, raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| DocError::invalid_value(field.key(), e))
}

async fn upsert(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO metadata (key, value, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT(key) DO UPDATE SET
            value = excluded.value,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(key)
    .bind(value)
    .bind(now_ts())
    .execute(&mut *conn)
    .await?;
    Ok(())
}

async fn stored_rows(conn: &mut SqliteConnection) -> Result<HashMap<String, String>> {
    let rows = sqlx::query("SELECT key, value FROM metadata")
        .fetch_all(&mut *conn)
        .await?;
    Ok(rows
        .iter()
        .map(|row| (row.get("key"), row.get("value")))
        .collect())
}

/// Write every present field of `record` in one transaction.
///
/// Absent fields are skipped, so keys not mentioned in `record` keep their
/// stored values. Returns the number of fields written.
pub async fn save(conn: &mut SqliteConnection, record: &MetadataRecord) -> Result<usize> {
    let mut tx = conn.begin().await?;
    let mut written = 0;
    for field in MetadataField::ALL {
        if let Some(value) = field.encode(record)? {
            upsert(&mut *tx, field.key(), &value).await?;
            written += 1;
        }
    }
    tx.commit().await?;
    Ok(written)
}

/// Read the record back.
///
/// When the store has no `id` key an identity is generated for the returned
/// value only; nothing is written. Use [`ensure_identity`] to persist one.
pub async fn load(conn: &mut SqliteConnection) -> Result<MetadataRecord> {
    let rows = stored_rows(conn).await?;
    let mut record = MetadataRecord::default();
    for field in MetadataField::ALL {
        if let Some(raw) = rows.get(field.key()) {
            field.decode(&mut record, raw)?;
        }
    }
    if record.id.is_none() {
        let synthesized = Uuid::new_v4().to_string();
        debug!(id = %synthesized, "metadata has no identity, synthesized one");
        record.id = Some(synthesized);
    }
    Ok(record)
}

/// Apply the present fields of `partial` that differ from what is stored.
///
/// Values are compared by their JSON form, so a re-serialized but equal
/// structure is not a change. Nothing is written when nothing changed.
/// Returns the changes in field order; recording them in the audit log is
/// the caller's job.
pub async fn update(
    conn: &mut SqliteConnection,
    partial: &MetadataRecord,
) -> Result<Vec<FieldChange>> {
    let mut tx = conn.begin().await?;
    let rows = stored_rows(&mut *tx).await?;

    let mut changes = Vec::new();
    for field in MetadataField::ALL {
        let new_raw = match field.encode(partial)? {
            Some(raw) => raw,
            None => continue,
        };
        let new_value = field.to_json(&new_raw)?;
        let old_value = rows
            .get(field.key())
            .map(|raw| field.to_json(raw))
            .transpose()?;
        if old_value.as_ref() == Some(&new_value) {
            continue;
        }

        upsert(&mut *tx, field.key(), &new_raw).await?;
        changes.push(FieldChange {
            field: field.key().to_string(),
            old_value,
            new_value: Some(new_value),
        });
    }

    tx.commit().await?;
    Ok(changes)
}

pub async fn get_value(conn: &mut SqliteConnection, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar("SELECT value FROM metadata WHERE key = ?")
        .bind(key)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(value)
}

pub async fn set_value(conn: &mut SqliteConnection, key: &str, value: &str) -> Result<()> {
    upsert(conn, key, value).await
}

/// Remove a key. Returns whether a row existed.
pub async fn delete_key(conn: &mut SqliteConnection, key: &str) -> Result<bool> {
    let result = sqlx::query("DELETE FROM metadata WHERE key = ?")
        .bind(key)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected() > 0)
}

/// Return the stored identity, generating and persisting one if missing.
pub async fn ensure_identity(conn: &mut SqliteConnection) -> Result<String> {
    let key = MetadataField::Id.key();
    if let Some(id) = get_value(conn, key).await? {
        return Ok(id);
    }
    let id = Uuid::new_v4().to_string();
    upsert(conn, key, &id).await?;
    debug!(id = %id, "backfilled document identity");
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{RoutingInfo, StatusTransition, TranscriptStatus};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_every_field_round_trips_through_key() {
        for field in MetadataField::ALL {
            assert_eq!(MetadataField::from_key(field.key()), Some(field));
        }
        assert_eq!(MetadataField::from_key("unknown"), None);
    }

    #[test]
    fn test_encode_skips_absent_fields() {
        let record = MetadataRecord {
            title: Some("Standup".to_string()),
            ..Default::default()
        };
        for field in MetadataField::ALL {
            let encoded = field.encode(&record).unwrap();
            if field == MetadataField::Title {
                assert_eq!(encoded.as_deref(), Some("Standup"));
            } else {
                assert!(encoded.is_none(), "{} should be absent", field.key());
            }
        }
    }

    #[test]
    fn test_preformatted_date_is_kept_verbatim() {
        let record = MetadataRecord {
            date: Some(Timestamp::Text("2024-03-01".to_string())),
            ..Default::default()
        };
        let stored = MetadataField::Date.encode(&record).unwrap().unwrap();
        assert_eq!(stored, "2024-03-01");

        let mut decoded = MetadataRecord::default();
        MetadataField::Date.decode(&mut decoded, &stored).unwrap();
        assert_eq!(decoded.date, Some(Timestamp::Text("2024-03-01".to_string())));
    }

    #[test]
    fn test_parsed_date_is_iso_8601() {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 9, 30, 0).unwrap();
        let record = MetadataRecord {
            date: Some(Timestamp::Parsed(at)),
            ..Default::default()
        };
        let stored = MetadataField::Date.encode(&record).unwrap().unwrap();
        assert_eq!(stored, "2024-03-01T09:30:00.000Z");
        assert_eq!(Timestamp::from_stored(&stored), Timestamp::Parsed(at));
    }

    #[test]
    fn test_structured_field_rehydrates_nested_timestamps() {
        let at = Utc.with_ymd_and_hms(2024, 5, 2, 12, 0, 0).unwrap();
        let record = MetadataRecord {
            status_history: Some(vec![StatusTransition {
                from: Some(TranscriptStatus::Raw),
                to: TranscriptStatus::Enhanced,
                at,
                note: None,
            }]),
            routing: Some(RoutingInfo {
                destination: Some("projects/alpha".to_string()),
                confidence: Some(0.8),
                routed_at: Some(at),
                ..Default::default()
            }),
            ..Default::default()
        };

        let mut decoded = MetadataRecord::default();
        for field in [MetadataField::StatusHistory, MetadataField::Routing] {
            let stored = field.encode(&record).unwrap().unwrap();
            assert!(stored.contains("2024-05-02T12:00:00Z"));
            field.decode(&mut decoded, &stored).unwrap();
        }
        assert_eq!(decoded.status_history, record.status_history);
        assert_eq!(decoded.routing, record.routing);
    }

    #[test]
    fn test_canonical_json_sorts_keys() {
        let routing = RoutingInfo {
            reason: Some("keyword".to_string()),
            destination: Some("inbox".to_string()),
            ..Default::default()
        };
        assert_eq!(
            canonical_json(&routing).unwrap(),
            r#"{"destination":"inbox","reason":"keyword"}"#
        );
    }

    #[test]
    fn test_to_json_per_kind() {
        assert_eq!(
            MetadataField::Confidence.to_json("0.75").unwrap(),
            serde_json::json!(0.75)
        );
        assert_eq!(
            MetadataField::Status.to_json("routed").unwrap(),
            serde_json::json!("routed")
        );
        assert_eq!(
            MetadataField::Tags.to_json(r#"["a","b"]"#).unwrap(),
            serde_json::json!(["a", "b"])
        );
    }

    #[test]
    fn test_decode_rejects_bad_values() {
        let mut record = MetadataRecord::default();
        assert!(MetadataField::Status.decode(&mut record, "sleeping").is_err());
        assert!(MetadataField::Confidence.decode(&mut record, "high").is_err());
        assert!(MetadataField::Tags.decode(&mut record, "not json").is_err());
    }

    async fn memory_store() -> SqliteConnection {
        let mut conn = SqliteConnection::connect("sqlite::memory:").await.unwrap();
        crate::schema::ensure_initialized(&mut conn).await.unwrap();
        conn
    }

    #[tokio::test]
    async fn test_save_and_load() {
        let mut conn = memory_store().await;
        let record = MetadataRecord {
            id: Some("doc-1".to_string()),
            title: Some("Weekly sync".to_string()),
            tags: Some(vec!["team".to_string(), "weekly".to_string()]),
            status: Some(TranscriptStatus::Processing),
            confidence: Some(0.5),
            ..Default::default()
        };
        assert_eq!(save(&mut conn, &record).await.unwrap(), 5);

        let loaded = load(&mut conn).await.unwrap();
        assert_eq!(loaded, record);
    }

    #[tokio::test]
    async fn test_save_never_clears_unrelated_keys() {
        let mut conn = memory_store().await;
        set_value(&mut conn, "custom", "kept").await.unwrap();
        save(
            &mut conn,
            &MetadataRecord {
                title: Some("A".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();
        save(
            &mut conn,
            &MetadataRecord {
                project_name: Some("P".to_string()),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let loaded = load(&mut conn).await.unwrap();
        assert_eq!(loaded.title.as_deref(), Some("A"));
        assert_eq!(loaded.project_name.as_deref(), Some("P"));
        assert_eq!(get_value(&mut conn, "custom").await.unwrap().as_deref(), Some("kept"));
    }

    #[tokio::test]
    async fn test_load_without_identity_does_not_persist() {
        let mut conn = memory_store().await;
        let first = load(&mut conn).await.unwrap();
        assert!(first.id.is_some());
        assert_eq!(get_value(&mut conn, "id").await.unwrap(), None);

        let id = ensure_identity(&mut conn).await.unwrap();
        assert_eq!(load(&mut conn).await.unwrap().id, Some(id.clone()));
        assert_eq!(ensure_identity(&mut conn).await.unwrap(), id);
    }

    #[tokio::test]
    async fn test_update_reports_only_real_changes() {
        let mut conn = memory_store().await;
        save(
            &mut conn,
            &MetadataRecord {
                title: Some("Old".to_string()),
                tags: Some(vec!["x".to_string()]),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        let changes = update(
            &mut conn,
            &MetadataRecord {
                title: Some("New".to_string()),
                tags: Some(vec!["x".to_string()]),
                status: Some(TranscriptStatus::Routed),
                ..Default::default()
            },
        )
        .await
        .unwrap();

        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].field, "title");
        assert_eq!(changes[0].old_value, Some(serde_json::json!("Old")));
        assert_eq!(changes[0].new_value, Some(serde_json::json!("New")));
        assert_eq!(changes[1].field, "status");
        assert_eq!(changes[1].old_value, None);
    }

    #[tokio::test]
    async fn test_delete_key_reports_existence() {
        let mut conn = memory_store().await;
        set_value(&mut conn, "title", "T").await.unwrap();
        assert!(delete_key(&mut conn, "title").await.unwrap());
        assert!(!delete_key(&mut conn, "title").await.unwrap());
    }

    #[test]
    fn test_non_finite_confidence_is_rejected() {
        for value in [f64::NAN, f64::INFINITY] {
            let record = MetadataRecord {
                confidence: Some(value),
                ..Default::default()
            };
            let err = MetadataField::Confidence.encode(&record).unwrap_err();
            assert!(matches!(err, DocError::InvalidValue { ref field, .. } if field == "confidence"));
        }
    }
}
