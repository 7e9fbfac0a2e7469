//! Batch operations over many document files.
//!
//! Callers supply explicit paths (directory scanning is not done here).
//! Items run with bounded concurrency; a failing item is recorded in the
//! [`BatchReport`] and the rest carry on, unless `fail_fast` is set, in
//! which case no new items start after the first failure and the ones not
//! yet started are reported as skipped.

use std::future::Future;
use std::path::{Path, PathBuf};

use futures::stream::{FuturesUnordered, StreamExt};
use tracing::{info, warn};

use crate::config::{BatchConfig, StoreConfig};
use crate::db;
use crate::document::Document;
use crate::error::{DocError, Result};
use crate::models::{MetadataRecord, RawSource};

#[derive(Debug, Clone)]
pub struct BatchOptions {
    pub concurrency: usize,
    pub fail_fast: bool,
}

impl From<&BatchConfig> for BatchOptions {
    fn from(config: &BatchConfig) -> Self {
        Self {
            concurrency: config.concurrency,
            fail_fast: config.fail_fast,
        }
    }
}

#[derive(Debug)]
pub struct BatchFailure {
    pub path: PathBuf,
    pub error: DocError,
}

#[derive(Debug)]
pub struct BatchReport<T> {
    pub succeeded: Vec<(PathBuf, T)>,
    pub failed: Vec<BatchFailure>,
    pub skipped: Vec<PathBuf>,
}

impl<T> Default for BatchReport<T> {
    fn default() -> Self {
        Self {
            succeeded: Vec::new(),
            failed: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

impl<T> BatchReport<T> {
    pub fn is_success(&self) -> bool {
        self.failed.is_empty() && self.skipped.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MigrationOutcome {
    pub from: i64,
    pub to: i64,
}

/// One parsed document handed over by an importer.
#[derive(Debug, Clone)]
pub struct ImportItem {
    pub path: PathBuf,
    pub metadata: MetadataRecord,
    pub body: String,
    pub raw_source: Option<RawSource>,
}

async fn run_batch<I, T, P, F, Fut>(
    items: Vec<I>,
    options: &BatchOptions,
    path_of: P,
    op: F,
) -> BatchReport<T>
where
    P: Fn(&I) -> PathBuf,
    F: Fn(I) -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let limit = options.concurrency.max(1);
    let mut report = BatchReport::default();
    let mut queue = items.into_iter();
    let mut running = FuturesUnordered::new();
    let mut stopped = false;

    let start = |item: I| {
        let path = path_of(&item);
        let fut = op(item);
        async move { (path, fut.await) }
    };

    loop {
        while !stopped && running.len() < limit {
            match queue.next() {
                Some(item) => running.push(start(item)),
                None => break,
            }
        }

        let (path, result) = match running.next().await {
            Some(done) => done,
            None => break,
        };
        match result {
            Ok(value) => report.succeeded.push((path, value)),
            Err(error) => {
                warn!(path = %path.display(), error = %error, "batch item failed");
                report.failed.push(BatchFailure { path, error });
                if options.fail_fast {
                    stopped = true;
                }
            }
        }
    }

    report.skipped = queue.map(|item| path_of(&item)).collect();
    report
}

async fn migrate_one(path: &Path, config: &StoreConfig) -> Result<MigrationOutcome> {
    let from = db::read_version(path, &config.connection).await?;
    let mut doc = Document::open(path, false, config).await?;
    let to = doc.schema_version().await?;
    doc.close().await?;
    Ok(MigrationOutcome { from, to })
}

/// Open every path writable, which migrates and validates it.
pub async fn migrate_documents(
    paths: Vec<PathBuf>,
    options: &BatchOptions,
    config: &StoreConfig,
) -> BatchReport<MigrationOutcome> {
    let report = run_batch(
        paths,
        options,
        |path| path.clone(),
        |path| async move { migrate_one(&path, config).await },
    )
    .await;
    info!(
        migrated = report.succeeded.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "batch migration finished"
    );
    report
}

async fn populate(doc: &mut Document, body: &str, raw_source: Option<&RawSource>) -> Result<String> {
    doc.update_content(body).await?;
    if let Some(source) = raw_source {
        doc.set_raw_source(source).await?;
    }
    doc.id().await
}

async fn import_one(item: ImportItem, config: &StoreConfig) -> Result<String> {
    let ImportItem {
        path,
        metadata,
        body,
        raw_source,
    } = item;

    let mut doc = Document::create(&path, metadata, config).await?;
    let populated = populate(&mut doc, &body, raw_source.as_ref()).await;
    let closed = doc.close().await;
    let id = populated?;
    closed?;
    Ok(id)
}

/// Create one document per item. Returns the new identities.
///
/// An item whose path already exists fails with [`DocError::Conflict`].
pub async fn import_documents(
    items: Vec<ImportItem>,
    options: &BatchOptions,
    config: &StoreConfig,
) -> BatchReport<String> {
    let report = run_batch(
        items,
        options,
        |item| item.path.clone(),
        |item| async move { import_one(item, config).await },
    )
    .await;
    info!(
        imported = report.succeeded.len(),
        failed = report.failed.len(),
        skipped = report.skipped.len(),
        "batch import finished"
    );
    report
}
