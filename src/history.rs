//! Content streams and their reversible diff history.
//!
//! Only the current text of a stream is stored in full. Every change appends
//! one unified diff (old -> new) to `content_history`; earlier states are
//! rebuilt on demand by walking the log backwards from the current text and
//! applying each diff in reverse.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use crate::error::{DocError, Result};
use crate::models::{format_ts, parse_ts, truncate_ts, ContentDiff, ContentKind, ContentStream};
use crate::patch::Patch;

fn row_to_stream(row: &SqliteRow) -> Result<ContentStream> {
    let kind: String = row.get("content_type");
    let created_at: String = row.get("created_at");
    let updated_at: String = row.get("updated_at");
    Ok(ContentStream {
        id: row.get("id"),
        kind: kind.parse()?,
        text: row.get("text"),
        created_at: parse_ts("created_at", &created_at)?,
        updated_at: parse_ts("updated_at", &updated_at)?,
    })
}

fn row_to_diff(row: &SqliteRow) -> Result<ContentDiff> {
    let created_at: String = row.get("created_at");
    Ok(ContentDiff {
        id: row.get("id"),
        content_id: row.get("content_id"),
        diff: row.get("diff"),
        created_at: parse_ts("created_at", &created_at)?,
    })
}

/// Insert a new stream holding `text`. Returns the stream as stored.
pub async fn create_stream(
    conn: &mut SqliteConnection,
    kind: ContentKind,
    text: &str,
) -> Result<ContentStream> {
    let now = truncate_ts(Utc::now());
    let stamp = format_ts(now);
    let result = sqlx::query(
        "INSERT INTO content (content_type, text, created_at, updated_at) VALUES (?, ?, ?, ?)",
    )
    .bind(kind.as_str())
    .bind(text)
    .bind(&stamp)
    .bind(&stamp)
    .execute(&mut *conn)
    .await?;
    Ok(ContentStream {
        id: result.last_insert_rowid(),
        kind,
        text: text.to_string(),
        created_at: now,
        updated_at: now,
    })
}

/// The first stream of the given kind, if any.
pub async fn find_stream(
    conn: &mut SqliteConnection,
    kind: ContentKind,
) -> Result<Option<ContentStream>> {
    let row = sqlx::query(
        "SELECT id, content_type, text, created_at, updated_at FROM content WHERE content_type = ? ORDER BY id ASC LIMIT 1",
    )
    .bind(kind.as_str())
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_stream).transpose()
}

pub async fn get_stream(conn: &mut SqliteConnection, stream_id: i64) -> Result<Option<ContentStream>> {
    let row = sqlx::query(
        "SELECT id, content_type, text, created_at, updated_at FROM content WHERE id = ?",
    )
    .bind(stream_id)
    .fetch_optional(&mut *conn)
    .await?;
    row.as_ref().map(row_to_stream).transpose()
}

/// Overwrite the stored text of a stream. No diff is recorded here.
///
/// Returns the `updated_at` that was written.
pub async fn set_text(
    conn: &mut SqliteConnection,
    stream_id: i64,
    text: &str,
) -> Result<DateTime<Utc>> {
    let now = truncate_ts(Utc::now());
    sqlx::query("UPDATE content SET text = ?, updated_at = ? WHERE id = ?")
        .bind(text)
        .bind(format_ts(now))
        .bind(stream_id)
        .execute(&mut *conn)
        .await?;
    Ok(now)
}

/// Append the diff from `old_text` to `new_text`.
///
/// Returns the new diff id, or `None` when the texts are identical and
/// nothing was written.
pub async fn save_change(
    conn: &mut SqliteConnection,
    stream_id: i64,
    old_text: &str,
    new_text: &str,
) -> Result<Option<i64>> {
    if old_text == new_text {
        return Ok(None);
    }

    let patch = Patch::between(old_text, new_text);
    let result =
        sqlx::query("INSERT INTO content_history (content_id, diff, created_at) VALUES (?, ?, ?)")
            .bind(stream_id)
            .bind(patch.render())
            .bind(format_ts(Utc::now()))
            .execute(&mut *conn)
            .await?;
    Ok(Some(result.last_insert_rowid()))
}

/// All diffs of a stream, oldest first.
pub async fn get_history(conn: &mut SqliteConnection, stream_id: i64) -> Result<Vec<ContentDiff>> {
    let rows = sqlx::query(
        "SELECT id, content_id, diff, created_at FROM content_history WHERE content_id = ? ORDER BY id ASC",
    )
    .bind(stream_id)
    .fetch_all(&mut *conn)
    .await?;
    rows.iter().map(row_to_diff).collect()
}

pub async fn get_version_count(conn: &mut SqliteConnection, stream_id: i64) -> Result<u64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM content_history WHERE content_id = ?")
        .bind(stream_id)
        .fetch_one(&mut *conn)
        .await?;
    Ok(count as u64)
}

/// Text of the stream as it was right after diff `diff_id` was recorded.
///
/// `diff_id = 0` yields the text before any recorded diff. Returns `None`
/// when the stream does not exist. Fails with
/// [`DocError::PatchReconstruction`] if any reversed diff does not apply
/// exactly to the text it should follow.
pub async fn reconstruct_at_version(
    conn: &mut SqliteConnection,
    stream_id: i64,
    diff_id: i64,
) -> Result<Option<String>> {
    let stream = match get_stream(conn, stream_id).await? {
        Some(stream) => stream,
        None => return Ok(None),
    };

    let rows = sqlx::query(
        "SELECT id, diff FROM content_history WHERE content_id = ? AND id > ? ORDER BY id DESC",
    )
    .bind(stream_id)
    .bind(diff_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut text = stream.text;
    for row in &rows {
        let id: i64 = row.get("id");
        let diff: String = row.get("diff");
        let reconstruction_error = |reason: String| DocError::PatchReconstruction {
            diff_id: id,
            reason,
        };
        let patch = Patch::parse(&diff).map_err(|e| reconstruction_error(e.to_string()))?;
        text = patch
            .reversed()
            .apply(&text)
            .map_err(|e| reconstruction_error(e.to_string()))?;
    }

    Ok(Some(text))
}
