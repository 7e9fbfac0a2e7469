//! # Transcript Store
//!
//! A versioned, single-file document format for transcripts.
//!
//! Each document is one SQLite file holding a structured metadata record,
//! the current transcript text with a reversible diff history, an audit
//! trail of metadata changes, typed artifacts (including the write-once raw
//! source), and a log of enhancement pipeline steps.
//!
//! ## Architecture
//!
//! ```text
//!                 ┌────────────────────┐
//!                 │      Document      │  access policy, memo, transactions
//!                 └─────────┬──────────┘
//!      ┌──────────┬─────────┼──────────┬─────────────┐
//!      ▼          ▼         ▼          ▼             ▼
//! ┌──────────┐ ┌───────┐ ┌───────┐ ┌───────────┐ ┌─────────────┐
//! │ metadata │ │ audit │ │history│ │ artifacts │ │ enhancement │
//! └──────────┘ └───────┘ └───┬───┘ └───────────┘ └─────────────┘
//!                            ▼
//!                        ┌───────┐
//!                        │ patch │
//!                        └───────┘
//!                 ┌────────────────────┐
//!                 │  db  ──▶  schema   │  open, migrate, validate, checkpoint
//!                 └────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::path::Path;
//! use transcript_store::config::StoreConfig;
//! use transcript_store::document::Document;
//! use transcript_store::models::MetadataRecord;
//!
//! # async fn run() -> transcript_store::error::Result<()> {
//! let config = StoreConfig::default();
//! let record = MetadataRecord {
//!     title: Some("Planning call".to_string()),
//!     ..Default::default()
//! };
//! let mut doc = Document::create(Path::new("planning.tdoc"), record, &config).await?;
//! doc.update_content("First draft").await?;
//! doc.update_content("Second draft").await?;
//! assert_eq!(doc.get_content_at_version(0).await?.as_deref(), Some("First draft"));
//! doc.close().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error type |
//! | [`models`] | Core data types |
//! | [`schema`] | Table layout, versioning, migration |
//! | [`db`] | Connection lifecycle and transactions |
//! | [`metadata`] | Metadata record codec |
//! | [`patch`] | Structured unified diffs |
//! | [`history`] | Content streams and diff history |
//! | [`audit`] | Metadata audit trail |
//! | [`artifacts`] | Artifact store and raw source |
//! | [`enhancement`] | Enhancement pipeline log |
//! | [`document`] | The document handle |
//! | [`batch`] | Bulk migration and import |

pub mod artifacts;
pub mod audit;
pub mod batch;
pub mod config;
pub mod db;
pub mod document;
pub mod enhancement;
pub mod error;
pub mod history;
pub mod metadata;
pub mod models;
pub mod patch;
pub mod schema;

pub use document::{AccessMode, Document, DocumentState};
pub use error::{DocError, Result};
