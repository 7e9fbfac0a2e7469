//! The document handle.
//!
//! [`Document`] owns the connection to one file and is the only type that
//! enforces access policy. Every mutating method runs its storage steps in a
//! single transaction: a content update appends its diff and replaces the
//! text together, and a metadata update writes its fields and their audit
//! rows together.
//!
//! # Caching
//!
//! The handle memoizes the metadata record and the current content stream.
//! The metadata memo is dropped inside the transaction of any metadata write
//! and reloaded on the next read. The content memo is refreshed after each
//! committed content write. A handle is meant for one task at a time; all
//! mutating methods take `&mut self`.
//!
//! # Lifecycle
//!
//! `create`/`open` return a handle that is already [`DocumentState::Ready`].
//! [`Document::close`] checkpoints and releases the connection. Closing
//! twice is a no-op; any other call on a closed handle returns
//! [`DocError::Closed`].

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::artifacts::{self, RAW_SOURCE_TYPE};
use crate::audit;
use crate::config::StoreConfig;
use crate::db::Database;
use crate::enhancement::{self, LogFilter};
use crate::error::{DocError, Result};
use crate::history;
use crate::metadata;
use crate::models::{
    Artifact, AuditEntry, ContentDiff, ContentKind, ContentStream, EnhancementLogEntry,
    EnhancementStep, FieldChange, HistoryEvent, MetadataRecord, RawSource,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessMode {
    ReadWrite,
    ReadOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentState {
    Loading,
    Ready,
    Closed,
}

pub struct Document {
    db: Option<Database>,
    path: PathBuf,
    mode: AccessMode,
    state: DocumentState,
    metadata: Option<MetadataRecord>,
    content: Option<ContentStream>,
}

impl Document {
    /// Create a new document file at `path`.
    ///
    /// An identity is assigned when `initial.id` is `None`. The file starts
    /// with an empty transcript stream. Fails with [`DocError::Conflict`] if
    /// anything already exists at `path`.
    pub async fn create(path: &Path, initial: MetadataRecord, config: &StoreConfig) -> Result<Self> {
        if tokio::fs::try_exists(path).await? {
            return Err(DocError::Conflict {
                path: path.to_path_buf(),
            });
        }

        let mut record = initial;
        if record.id.is_none() {
            record.id = Some(Uuid::new_v4().to_string());
        }

        let mut db = match Database::open(path, false, true, &config.connection).await {
            Ok(db) => db,
            Err(e) => {
                remove_document_files(path).await;
                return Err(e);
            }
        };
        let (metadata, content) = match seed(&mut db, &record).await {
            Ok(seeded) => seeded,
            Err(e) => {
                if let Err(close_err) = db.close().await {
                    debug!(error = %close_err, "close after failed create");
                }
                remove_document_files(path).await;
                return Err(e);
            }
        };

        info!(path = %path.display(), id = ?record.id, "created document");
        Ok(Document {
            db: Some(db),
            path: path.to_path_buf(),
            mode: AccessMode::ReadWrite,
            state: DocumentState::Ready,
            metadata: Some(metadata),
            content: Some(content),
        })
    }

    /// Open an existing document.
    ///
    /// Writable opens migrate the schema and backfill a missing identity.
    /// Read-only opens change nothing on disk.
    pub async fn open(path: &Path, read_only: bool, config: &StoreConfig) -> Result<Self> {
        let mode = if read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let mut doc = Document {
            db: None,
            path: path.to_path_buf(),
            mode,
            state: DocumentState::Loading,
            metadata: None,
            content: None,
        };

        let mut db = Database::open(path, read_only, false, &config.connection).await?;
        if !read_only {
            metadata::ensure_identity(db.conn()).await?;
        }
        doc.metadata = Some(metadata::load(db.conn()).await?);
        doc.content = history::find_stream(db.conn(), ContentKind::Transcript).await?;
        doc.db = Some(db);
        doc.state = DocumentState::Ready;

        info!(path = %path.display(), ?mode, "opened document");
        Ok(doc)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    pub fn is_read_only(&self) -> bool {
        self.mode == AccessMode::ReadOnly
    }

    pub fn state(&self) -> DocumentState {
        self.state
    }

    fn db(&mut self) -> Result<&mut Database> {
        self.db.as_mut().ok_or(DocError::Closed)
    }

    fn ensure_writable(&self, operation: &'static str) -> Result<()> {
        if self.state == DocumentState::Closed {
            return Err(DocError::Closed);
        }
        if self.mode == AccessMode::ReadOnly {
            return Err(DocError::AccessViolation { operation });
        }
        Ok(())
    }

    pub async fn schema_version(&mut self) -> Result<i64> {
        Ok(self.db()?.schema_version().await)
    }

    // ---- metadata ----

    /// The metadata record, reloaded if a write invalidated the memo.
    pub async fn metadata(&mut self) -> Result<&MetadataRecord> {
        if self.metadata.is_none() {
            let db = self.db.as_mut().ok_or(DocError::Closed)?;
            let record = metadata::load(db.conn()).await?;
            self.metadata = Some(record);
        }
        self.metadata.as_ref().ok_or(DocError::Closed)
    }

    /// Document identity.
    pub async fn id(&mut self) -> Result<String> {
        let record = self.metadata().await?;
        Ok(record.id.clone().unwrap_or_default())
    }

    /// Persist the changed fields of `partial` and audit each change.
    ///
    /// Returns the changes that were written; an empty list means nothing
    /// on disk was touched.
    pub async fn update_metadata(&mut self, partial: &MetadataRecord) -> Result<Vec<FieldChange>> {
        self.ensure_writable("update_metadata")?;
        let db = self.db.as_mut().ok_or(DocError::Closed)?;

        let mut tx = db.begin().await?;
        let changes = metadata::update(&mut *tx, partial).await?;
        if !changes.is_empty() {
            audit::log_changes(&mut *tx, &changes).await?;
            self.metadata = None;
        }
        tx.commit().await?;

        debug!(changed = changes.len(), "updated metadata");
        Ok(changes)
    }

    /// Raw value of any metadata key, including keys the record does not model.
    pub async fn get_metadata_value(&mut self, key: &str) -> Result<Option<String>> {
        metadata::get_value(self.db()?.conn(), key).await
    }

    // ---- content ----

    /// Current transcript text; empty when the document has no stream.
    pub fn content(&self) -> &str {
        self.content.as_ref().map_or("", |c| c.text.as_str())
    }

    pub fn content_stream(&self) -> Option<&ContentStream> {
        self.content.as_ref()
    }

    /// Replace the transcript text.
    ///
    /// Identical text is a no-op. Otherwise the diff from the previous text
    /// is appended and the text replaced in one transaction. Filling an
    /// empty stream that has no history yet records no diff. Returns the id
    /// of the recorded diff, if any.
    pub async fn update_content(&mut self, text: &str) -> Result<Option<i64>> {
        self.ensure_writable("update_content")?;
        if self.content.is_some() && self.content() == text {
            return Ok(None);
        }
        if self.content.is_none() && text.is_empty() {
            return Ok(None);
        }

        let current = self.content.as_ref().map(|c| (c.id, c.text.clone()));
        let db = self.db.as_mut().ok_or(DocError::Closed)?;

        let mut tx = db.begin().await?;
        let diff_id = match current {
            Some((stream_id, old_text)) => {
                let first_fill = old_text.is_empty()
                    && history::get_version_count(&mut *tx, stream_id).await? == 0;
                let diff_id = if first_fill {
                    None
                } else {
                    history::save_change(&mut *tx, stream_id, &old_text, text).await?
                };
                let updated_at = history::set_text(&mut *tx, stream_id, text).await?;
                tx.commit().await?;

                if let Some(stream) = self.content.as_mut() {
                    stream.text = text.to_string();
                    stream.updated_at = updated_at;
                }
                diff_id
            }
            None => {
                let stream =
                    history::create_stream(&mut *tx, ContentKind::Transcript, text).await?;
                tx.commit().await?;
                self.content = Some(stream);
                None
            }
        };

        debug!(?diff_id, "updated content");
        Ok(diff_id)
    }

    /// Content diffs, oldest first.
    pub async fn get_content_history(&mut self) -> Result<Vec<ContentDiff>> {
        let stream_id = match &self.content {
            Some(stream) => stream.id,
            None => return Ok(Vec::new()),
        };
        history::get_history(self.db()?.conn(), stream_id).await
    }

    /// Transcript text right after diff `diff_id` (0 = before the first diff).
    pub async fn get_content_at_version(&mut self, diff_id: i64) -> Result<Option<String>> {
        let stream_id = match &self.content {
            Some(stream) => stream.id,
            None => return Ok(None),
        };
        history::reconstruct_at_version(self.db()?.conn(), stream_id, diff_id).await
    }

    pub async fn get_version_count(&mut self) -> Result<u64> {
        let stream_id = match &self.content {
            Some(stream) => stream.id,
            None => return Ok(0),
        };
        history::get_version_count(self.db()?.conn(), stream_id).await
    }

    // ---- audit ----

    /// Metadata changes, newest first.
    pub async fn get_audit_log(&mut self) -> Result<Vec<AuditEntry>> {
        audit::get_trail(self.db()?.conn()).await
    }

    pub async fn get_field_history(&mut self, field: &str) -> Result<Vec<AuditEntry>> {
        audit::get_field_history(self.db()?.conn(), field).await
    }

    pub async fn get_audit_since(&mut self, since: DateTime<Utc>) -> Result<Vec<AuditEntry>> {
        audit::get_since(self.db()?.conn(), since).await
    }

    pub async fn audit_count(&mut self) -> Result<u64> {
        audit::get_count(self.db()?.conn()).await
    }

    /// Content diffs and metadata changes merged into one timeline,
    /// oldest first.
    pub async fn get_history(&mut self) -> Result<Vec<HistoryEvent>> {
        let diffs = self.get_content_history().await?;
        let audit = self.get_audit_log().await?;

        let mut events: Vec<HistoryEvent> = diffs
            .into_iter()
            .map(HistoryEvent::Content)
            .chain(audit.into_iter().rev().map(HistoryEvent::Metadata))
            .collect();
        events.sort_by_key(HistoryEvent::at);
        Ok(events)
    }

    // ---- artifacts ----

    /// Attach an artifact. The raw-source type stays write-once here too.
    pub async fn add_artifact(
        &mut self,
        artifact_type: &str,
        data: Option<&[u8]>,
        metadata: Option<&serde_json::Value>,
    ) -> Result<i64> {
        self.ensure_writable("add_artifact")?;
        let db = self.db()?;

        let mut tx = db.begin().await?;
        if artifact_type == RAW_SOURCE_TYPE && artifacts::has_raw_source(&mut *tx).await? {
            return Err(DocError::WriteOnceViolation {
                artifact_type: RAW_SOURCE_TYPE.to_string(),
            });
        }
        let id = artifacts::add_artifact(&mut *tx, artifact_type, data, metadata).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_artifact(&mut self, artifact_type: &str) -> Result<Option<Artifact>> {
        artifacts::get_artifact(self.db()?.conn(), artifact_type).await
    }

    pub async fn get_artifacts_by_type(&mut self, artifact_type: &str) -> Result<Vec<Artifact>> {
        artifacts::get_artifacts_by_type(self.db()?.conn(), artifact_type).await
    }

    pub async fn get_all_artifacts(&mut self) -> Result<Vec<Artifact>> {
        artifacts::get_all(self.db()?.conn()).await
    }

    pub async fn has_artifact(&mut self, artifact_type: &str) -> Result<bool> {
        artifacts::has_artifact(self.db()?.conn(), artifact_type).await
    }

    /// Remove an artifact by id. The raw source cannot be removed.
    pub async fn delete_artifact(&mut self, id: i64) -> Result<bool> {
        self.ensure_writable("delete_artifact")?;
        let db = self.db()?;

        let mut tx = db.begin().await?;
        if artifacts::artifact_type_of(&mut *tx, id).await?.as_deref() == Some(RAW_SOURCE_TYPE) {
            return Err(DocError::WriteOnceViolation {
                artifact_type: RAW_SOURCE_TYPE.to_string(),
            });
        }
        let removed = artifacts::delete_artifact(&mut *tx, id).await?;
        tx.commit().await?;
        Ok(removed)
    }

    /// Store the raw capture. Only one raw source may ever be stored.
    pub async fn set_raw_source(&mut self, source: &RawSource) -> Result<i64> {
        self.ensure_writable("set_raw_source")?;
        let db = self.db()?;

        let mut tx = db.begin().await?;
        if artifacts::has_raw_source(&mut *tx).await? {
            return Err(DocError::WriteOnceViolation {
                artifact_type: RAW_SOURCE_TYPE.to_string(),
            });
        }
        let id = artifacts::set_raw_source(&mut *tx, source).await?;
        tx.commit().await?;
        Ok(id)
    }

    pub async fn get_raw_source(&mut self) -> Result<Option<RawSource>> {
        artifacts::get_raw_source(self.db()?.conn()).await
    }

    pub async fn has_raw_source(&mut self) -> Result<bool> {
        artifacts::has_raw_source(self.db()?.conn()).await
    }

    // ---- enhancement log ----

    pub async fn log_enhancement(&mut self, step: &EnhancementStep) -> Result<i64> {
        self.ensure_writable("log_enhancement")?;
        enhancement::log_step(self.db()?.conn(), step).await
    }

    pub async fn log_enhancements(&mut self, steps: &[EnhancementStep]) -> Result<Vec<i64>> {
        self.ensure_writable("log_enhancements")?;
        enhancement::log_steps(self.db()?.conn(), steps).await
    }

    pub async fn get_enhancement_log(&mut self, filter: &LogFilter) -> Result<Vec<EnhancementLogEntry>> {
        enhancement::get_log(self.db()?.conn(), filter).await
    }

    pub async fn enhancement_count(&mut self) -> Result<u64> {
        enhancement::get_count(self.db()?.conn()).await
    }

    pub async fn clear_enhancement_log(&mut self) -> Result<u64> {
        self.ensure_writable("clear_enhancement_log")?;
        enhancement::clear_log(self.db()?.conn()).await
    }

    // ---- lifecycle ----

    /// Checkpoint and release the connection. A second call does nothing.
    pub async fn close(&mut self) -> Result<()> {
        let db = match self.db.take() {
            Some(db) => db,
            None => return Ok(()),
        };
        self.state = DocumentState::Closed;
        self.metadata = None;
        self.content = None;
        db.close().await?;
        info!(path = %self.path.display(), "closed document");
        Ok(())
    }
}

/// Write the initial metadata and an empty transcript stream.
async fn seed(db: &mut Database, record: &MetadataRecord) -> Result<(MetadataRecord, ContentStream)> {
    let mut tx = db.begin().await?;
    metadata::save(&mut *tx, record).await?;
    let stream = history::create_stream(&mut *tx, ContentKind::Transcript, "").await?;
    tx.commit().await?;
    let loaded = metadata::load(db.conn()).await?;
    Ok((loaded, stream))
}

/// Remove a half-created document and its WAL siblings.
async fn remove_document_files(path: &Path) {
    for suffix in ["", "-wal", "-shm"] {
        let mut name = path.as_os_str().to_owned();
        name.push(suffix);
        match tokio::fs::remove_file(&name).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(
                path = %Path::new(&name).display(),
                error = %e,
                "could not remove partially created document"
            ),
        }
    }
}
