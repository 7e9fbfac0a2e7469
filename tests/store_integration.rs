//! Schema lifecycle, transactions, and batch operations against real files.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use transcript_store::batch::{self, BatchOptions, ImportItem, MigrationOutcome};
use transcript_store::config::StoreConfig;
use transcript_store::db::{self, Database};
use transcript_store::metadata;
use transcript_store::models::{MetadataRecord, RawSource};
use transcript_store::schema::SCHEMA_VERSION;
use transcript_store::{DocError, Document};

fn setup_test_env() -> TempDir {
    TempDir::new().unwrap()
}

fn titled(title: &str) -> MetadataRecord {
    MetadataRecord {
        title: Some(title.to_string()),
        ..Default::default()
    }
}

async fn create_closed(path: &Path) {
    let mut doc = Document::create(path, titled("fixture"), &StoreConfig::default())
        .await
        .unwrap();
    doc.update_content("fixture body\n").await.unwrap();
    doc.close().await.unwrap();
}

/// Rewrite a current file so it looks like one written by generation 1.
async fn downgrade_to_v1(path: &Path) {
    let config = StoreConfig::default();
    let mut db = Database::open(path, false, false, &config.connection)
        .await
        .unwrap();
    metadata::delete_key(db.conn(), "id").await.unwrap();
    sqlx::query("UPDATE schema_version SET version = 1")
        .execute(db.conn())
        .await
        .unwrap();
    db.close().await.unwrap();
}

async fn raw_sql(path: &Path, sql: &str) {
    let config = StoreConfig::default();
    let mut db = Database::open(path, false, false, &config.connection)
        .await
        .unwrap();
    sqlx::query(sql).execute(db.conn()).await.unwrap();
    db.close().await.unwrap();
}

// ─── Schema lifecycle ───────────────────────────────────────────────

#[tokio::test]
async fn test_fresh_database_is_initialized() {
    let tmp = setup_test_env();
    let path = tmp.path().join("nested/dir/fresh.tdoc");
    let config = StoreConfig::default();

    let mut db = Database::open(&path, false, true, &config.connection)
        .await
        .unwrap();
    assert_eq!(db.schema_version().await, SCHEMA_VERSION);
    assert!(!db.is_read_only());
    db.close().await.unwrap();

    assert!(path.exists());
    assert_eq!(
        db::read_version(&path, &config.connection).await.unwrap(),
        SCHEMA_VERSION
    );
}

#[tokio::test]
async fn test_v1_document_migrates_and_gains_identity() {
    let tmp = setup_test_env();
    let path = tmp.path().join("legacy.tdoc");
    create_closed(&path).await;
    downgrade_to_v1(&path).await;

    let config = StoreConfig::default();
    assert_eq!(db::read_version(&path, &config.connection).await.unwrap(), 1);

    let mut doc = Document::open(&path, false, &config).await.unwrap();
    assert_eq!(doc.schema_version().await.unwrap(), SCHEMA_VERSION);
    let id = doc.id().await.unwrap();
    assert_eq!(doc.get_metadata_value("id").await.unwrap(), Some(id.clone()));
    assert_eq!(doc.content(), "fixture body\n");
    doc.close().await.unwrap();

    let mut reopened = Document::open(&path, true, &config).await.unwrap();
    assert_eq!(reopened.id().await.unwrap(), id);
    reopened.close().await.unwrap();
}

#[tokio::test]
async fn test_read_only_open_leaves_legacy_file_untouched() {
    let tmp = setup_test_env();
    let path = tmp.path().join("legacy.tdoc");
    create_closed(&path).await;
    downgrade_to_v1(&path).await;

    let config = StoreConfig::default();
    let mut doc = Document::open(&path, true, &config).await.unwrap();
    assert_eq!(doc.schema_version().await.unwrap(), 1);

    let first = doc.id().await.unwrap();
    assert_eq!(doc.id().await.unwrap(), first);
    assert_eq!(doc.get_metadata_value("id").await.unwrap(), None);
    doc.close().await.unwrap();

    assert_eq!(db::read_version(&path, &config.connection).await.unwrap(), 1);
}

#[tokio::test]
async fn test_missing_table_is_structural_error() {
    let tmp = setup_test_env();
    let path = tmp.path().join("broken.tdoc");
    create_closed(&path).await;
    raw_sql(&path, "DROP TABLE enhancement_log").await;

    let config = StoreConfig::default();
    for read_only in [false, true] {
        match Document::open(&path, read_only, &config).await {
            Err(DocError::Structural { missing }) => {
                assert_eq!(missing, vec!["enhancement_log".to_string()]);
            }
            Err(other) => panic!("expected structural error, got {}", other),
            Ok(_) => panic!("expected structural error, open succeeded"),
        }
    }
}

#[tokio::test]
async fn test_newer_generation_is_readable_but_not_writable() {
    let tmp = setup_test_env();
    let path = tmp.path().join("future.tdoc");
    create_closed(&path).await;
    raw_sql(&path, "UPDATE schema_version SET version = 99").await;

    let config = StoreConfig::default();
    assert!(matches!(
        Document::open(&path, false, &config).await.err().unwrap(),
        DocError::UnsupportedVersion { found: 99, .. }
    ));

    let mut doc = Document::open(&path, true, &config).await.unwrap();
    assert_eq!(doc.content(), "fixture body\n");
    doc.close().await.unwrap();
}

#[tokio::test]
async fn test_tampered_content_fails_reconstruction() {
    let tmp = setup_test_env();
    let path = tmp.path().join("tampered.tdoc");
    let config = StoreConfig::default();

    let mut doc = Document::create(&path, titled("t"), &config).await.unwrap();
    doc.update_content("alpha\nbeta\n").await.unwrap();
    doc.update_content("alpha\ngamma\n").await.unwrap();
    doc.close().await.unwrap();

    raw_sql(&path, "UPDATE content SET text = 'something unrelated\n'").await;

    let mut doc = Document::open(&path, true, &config).await.unwrap();
    assert!(matches!(
        doc.get_content_at_version(0).await.unwrap_err(),
        DocError::PatchReconstruction { .. }
    ));
    doc.close().await.unwrap();
}

// ─── Transactions ───────────────────────────────────────────────────

#[tokio::test]
async fn test_with_transaction_commits_on_ok() {
    let tmp = setup_test_env();
    let path = tmp.path().join("tx.tdoc");
    let config = StoreConfig::default();
    let mut db = Database::open(&path, false, true, &config.connection)
        .await
        .unwrap();

    let written = db
        .with_transaction(|conn| {
            Box::pin(async move {
                metadata::set_value(conn, "title", "committed").await?;
                metadata::set_value(conn, "project_id", "p-1").await?;
                Ok(2)
            })
        })
        .await
        .unwrap();
    assert_eq!(written, 2);
    assert_eq!(
        metadata::get_value(db.conn(), "title").await.unwrap().as_deref(),
        Some("committed")
    );
    db.close().await.unwrap();
}

#[tokio::test]
async fn test_with_transaction_rolls_back_on_err() {
    let tmp = setup_test_env();
    let path = tmp.path().join("tx.tdoc");
    let config = StoreConfig::default();
    let mut db = Database::open(&path, false, true, &config.connection)
        .await
        .unwrap();

    let result: transcript_store::Result<()> = db
        .with_transaction(|conn| {
            Box::pin(async move {
                metadata::set_value(conn, "title", "discarded").await?;
                Err(DocError::invalid_value("title", "rejected by caller"))
            })
        })
        .await;
    assert!(matches!(result, Err(DocError::InvalidValue { .. })));
    assert_eq!(metadata::get_value(db.conn(), "title").await.unwrap(), None);
    db.close().await.unwrap();
}

// ─── Batch ──────────────────────────────────────────────────────────

fn import_item(path: PathBuf, title: &str) -> ImportItem {
    ImportItem {
        path,
        metadata: titled(title),
        body: format!("{} body\n", title),
        raw_source: None,
    }
}

#[tokio::test]
async fn test_migrate_documents_reports_each_file() {
    let tmp = setup_test_env();
    let legacy = tmp.path().join("legacy.tdoc");
    let current = tmp.path().join("current.tdoc");
    let missing = tmp.path().join("missing.tdoc");
    create_closed(&legacy).await;
    downgrade_to_v1(&legacy).await;
    create_closed(&current).await;

    let config = StoreConfig::default();
    let options = BatchOptions::from(&config.batch);
    let mut report = batch::migrate_documents(
        vec![legacy.clone(), current.clone(), missing.clone()],
        &options,
        &config,
    )
    .await;

    report.succeeded.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(
        report.succeeded,
        vec![
            (current, MigrationOutcome { from: 2, to: 2 }),
            (legacy, MigrationOutcome { from: 1, to: 2 }),
        ]
    );
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].path, missing);
    assert!(report.skipped.is_empty());
    assert!(!report.is_success());
}

#[tokio::test]
async fn test_import_documents_creates_files() {
    let tmp = setup_test_env();
    let config = StoreConfig::default();
    let options = BatchOptions {
        concurrency: 2,
        fail_fast: false,
    };

    let mut with_source = import_item(tmp.path().join("a.tdoc"), "a");
    with_source.raw_source = Some(RawSource {
        text: "raw a".to_string(),
        ..Default::default()
    });
    let items = vec![with_source, import_item(tmp.path().join("b.tdoc"), "b")];

    let report = batch::import_documents(items, &options, &config).await;
    assert!(report.is_success());
    assert_eq!(report.succeeded.len(), 2);

    for (path, id) in &report.succeeded {
        let mut doc = Document::open(path, true, &config).await.unwrap();
        assert_eq!(&doc.id().await.unwrap(), id);
        assert!(doc.content().ends_with(" body\n"));
        doc.close().await.unwrap();
    }

    let mut a = Document::open(&tmp.path().join("a.tdoc"), true, &config)
        .await
        .unwrap();
    assert_eq!(a.get_raw_source().await.unwrap().unwrap().text, "raw a");
    a.close().await.unwrap();
}

#[tokio::test]
async fn test_import_conflict_is_reported_and_others_continue() {
    let tmp = setup_test_env();
    let existing = tmp.path().join("existing.tdoc");
    create_closed(&existing).await;

    let config = StoreConfig::default();
    let options = BatchOptions {
        concurrency: 1,
        fail_fast: false,
    };
    let fresh = tmp.path().join("fresh.tdoc");
    let report = batch::import_documents(
        vec![import_item(existing.clone(), "dup"), import_item(fresh.clone(), "fresh")],
        &options,
        &config,
    )
    .await;

    assert_eq!(report.failed.len(), 1);
    assert!(matches!(report.failed[0].error, DocError::Conflict { .. }));
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].0, fresh);

    let mut doc = Document::open(&existing, true, &config).await.unwrap();
    assert_eq!(doc.content(), "fixture body\n");
    doc.close().await.unwrap();
}

#[tokio::test]
async fn test_import_fail_fast_skips_remaining() {
    let tmp = setup_test_env();
    let existing = tmp.path().join("existing.tdoc");
    create_closed(&existing).await;

    let config = StoreConfig::default();
    let options = BatchOptions {
        concurrency: 1,
        fail_fast: true,
    };
    let second = tmp.path().join("second.tdoc");
    let third = tmp.path().join("third.tdoc");
    let report = batch::import_documents(
        vec![
            import_item(existing, "dup"),
            import_item(second.clone(), "second"),
            import_item(third.clone(), "third"),
        ],
        &options,
        &config,
    )
    .await;

    assert!(report.succeeded.is_empty());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.skipped, vec![second.clone(), third.clone()]);
    assert!(!second.exists());
    assert!(!third.exists());
}
