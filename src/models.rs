//! Core data models stored in a transcript document.
//!
//! These types cover the metadata record and its structured parts, the
//! content stream with its diff log, audit entries, artifacts, and the
//! enhancement log.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, SecondsFormat, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{DocError, Result};

/// Format a timestamp the way every table stores it.
///
/// Fixed millisecond precision with a `Z` suffix keeps lexical order equal to
/// chronological order, which the `ORDER BY` clauses rely on. Anything finer
/// than a millisecond is dropped, so a value read back equals
/// [`truncate_ts`] of the value written.
pub fn format_ts(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// `ts` cut to the millisecond precision [`format_ts`] stores.
pub fn truncate_ts(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.trunc_subsecs(3)
}

pub fn now_ts() -> String {
    format_ts(Utc::now())
}

pub fn parse_ts(field: &str, raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| DocError::invalid_value(field, format!("'{}': {}", raw, e)))
}

/// A metadata timestamp.
///
/// Callers that already hold a formatted date (for example from an imported
/// header) pass it as [`Timestamp::Text`] and it is stored untouched.
/// [`Timestamp::Parsed`] values are stored to the millisecond and read back
/// truncated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Timestamp {
    Parsed(DateTime<Utc>),
    Text(String),
}

impl Timestamp {
    pub fn to_stored(&self) -> String {
        match self {
            Timestamp::Parsed(dt) => format_ts(*dt),
            Timestamp::Text(s) => s.clone(),
        }
    }

    pub fn from_stored(raw: &str) -> Self {
        match DateTime::parse_from_rfc3339(raw) {
            Ok(dt) => Timestamp::Parsed(dt.with_timezone(&Utc)),
            Err(_) => Timestamp::Text(raw.to_string()),
        }
    }
}

impl From<DateTime<Utc>> for Timestamp {
    fn from(dt: DateTime<Utc>) -> Self {
        Timestamp::Parsed(dt)
    }
}

/// Processing status of a transcript.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TranscriptStatus {
    Raw,
    Processing,
    Enhanced,
    Routed,
    Archived,
    Failed,
}

impl TranscriptStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TranscriptStatus::Raw => "raw",
            TranscriptStatus::Processing => "processing",
            TranscriptStatus::Enhanced => "enhanced",
            TranscriptStatus::Routed => "routed",
            TranscriptStatus::Archived => "archived",
            TranscriptStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TranscriptStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TranscriptStatus {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "raw" => Ok(TranscriptStatus::Raw),
            "processing" => Ok(TranscriptStatus::Processing),
            "enhanced" => Ok(TranscriptStatus::Enhanced),
            "routed" => Ok(TranscriptStatus::Routed),
            "archived" => Ok(TranscriptStatus::Archived),
            "failed" => Ok(TranscriptStatus::Failed),
            other => Err(DocError::invalid_value(
                "status",
                format!("unknown status '{}'", other),
            )),
        }
    }
}

/// Where the routing stage decided a transcript belongs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RoutingInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub destination: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub routed_at: Option<DateTime<Utc>>,
}

/// One entry of the status history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusTransition {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<TranscriptStatus>,
    pub to: TranscriptStatus,
    pub at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// An action item extracted from the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub description: String,
    #[serde(default)]
    pub done: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub assignee: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub due: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
}

/// A named entity mentioned in the transcript.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub name: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub aliases: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub first_seen: Option<DateTime<Utc>>,
}

/// Entities grouped by kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Entities {
    #[serde(default)]
    pub people: Vec<Entity>,
    #[serde(default)]
    pub organizations: Vec<Entity>,
    #[serde(default)]
    pub places: Vec<Entity>,
    #[serde(default)]
    pub topics: Vec<Entity>,
}

/// The structured metadata record of a document.
///
/// Every field is optional so the same type doubles as a partial update:
/// `None` means "not present" and is never written.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MetadataRecord {
    pub id: Option<String>,
    pub title: Option<String>,
    pub date: Option<Timestamp>,
    pub project_id: Option<String>,
    pub project_name: Option<String>,
    pub tags: Option<Vec<String>>,
    pub status: Option<TranscriptStatus>,
    pub confidence: Option<f64>,
    pub routing: Option<RoutingInfo>,
    pub status_history: Option<Vec<StatusTransition>>,
    pub tasks: Option<Vec<Task>>,
    pub entities: Option<Entities>,
    pub error: Option<String>,
}

/// Closed set of content stream types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentKind {
    Transcript,
    Summary,
    Notes,
}

impl ContentKind {
    pub const ALL: [ContentKind; 3] = [
        ContentKind::Transcript,
        ContentKind::Summary,
        ContentKind::Notes,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ContentKind::Transcript => "transcript",
            ContentKind::Summary => "summary",
            ContentKind::Notes => "notes",
        }
    }
}

impl FromStr for ContentKind {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self> {
        ContentKind::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| DocError::invalid_value("content_type", format!("unknown '{}'", s)))
    }
}

/// The evolving text body of a document.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentStream {
    pub id: i64,
    pub kind: ContentKind,
    pub text: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One stored, reversible change to a content stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentDiff {
    pub id: i64,
    pub content_id: i64,
    pub diff: String,
    pub created_at: DateTime<Utc>,
}

/// A metadata field change, as computed by an update.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldChange {
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
}

/// A persisted [`FieldChange`].
#[derive(Debug, Clone, PartialEq)]
pub struct AuditEntry {
    pub id: i64,
    pub field: String,
    pub old_value: Option<serde_json::Value>,
    pub new_value: Option<serde_json::Value>,
    pub changed_at: DateTime<Utc>,
}

/// A typed side payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Artifact {
    pub id: i64,
    pub artifact_type: String,
    pub data: Option<Vec<u8>>,
    pub metadata: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// The original capture a transcript was produced from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RawSource {
    #[serde(skip)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Pipeline phase an enhancement step belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EnhancementPhase {
    Transcribe,
    Clean,
    Extract,
    Classify,
    Route,
    Review,
}

impl EnhancementPhase {
    pub const ALL: [EnhancementPhase; 6] = [
        EnhancementPhase::Transcribe,
        EnhancementPhase::Clean,
        EnhancementPhase::Extract,
        EnhancementPhase::Classify,
        EnhancementPhase::Route,
        EnhancementPhase::Review,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EnhancementPhase::Transcribe => "transcribe",
            EnhancementPhase::Clean => "clean",
            EnhancementPhase::Extract => "extract",
            EnhancementPhase::Classify => "classify",
            EnhancementPhase::Route => "route",
            EnhancementPhase::Review => "review",
        }
    }
}

impl FromStr for EnhancementPhase {
    type Err = DocError;

    fn from_str(s: &str) -> Result<Self> {
        EnhancementPhase::ALL
            .into_iter()
            .find(|p| p.as_str() == s)
            .ok_or_else(|| DocError::invalid_value("phase", format!("unknown '{}'", s)))
    }
}

/// A step to append to the enhancement log.
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancementStep {
    /// Stored to the millisecond; sub-millisecond digits do not survive.
    pub timestamp: DateTime<Utc>,
    pub phase: EnhancementPhase,
    pub action: String,
    pub details: Option<serde_json::Value>,
    pub entities: Option<Vec<String>>,
}

/// A persisted [`EnhancementStep`].
#[derive(Debug, Clone, PartialEq)]
pub struct EnhancementLogEntry {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub phase: EnhancementPhase,
    pub action: String,
    pub details: Option<serde_json::Value>,
    pub entities: Option<Vec<String>>,
}

/// One event in the combined document timeline.
#[derive(Debug, Clone, PartialEq)]
pub enum HistoryEvent {
    Content(ContentDiff),
    Metadata(AuditEntry),
}

impl HistoryEvent {
    pub fn at(&self) -> DateTime<Utc> {
        match self {
            HistoryEvent::Content(d) => d.created_at,
            HistoryEvent::Metadata(a) => a.changed_at,
        }
    }
}
