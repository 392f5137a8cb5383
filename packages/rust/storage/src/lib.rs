//! Persistence for chartdoc.
//!
//! - [`Ledger`]: the duplicate registry and rendered-content cache, behind a
//!   trait so the orchestrator never depends on a concrete backend.
//! - [`SheetsLedger`]: the spreadsheet web-app backend.
//! - [`Storage`]: a local libSQL database holding the local ledger backend,
//!   the language-model reply cache, and run history.

mod ledger;
mod migrations;
mod sheets;

use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use libsql::{Connection, Database, params};
use tracing::debug;

use chartdoc_shared::{BatchReport, ChartDocError, LedgerSheet, PublishedRecord, Result};

pub use ledger::Ledger;
pub use sheets::SheetsLedger;

use ledger::checked_key;

/// Primary storage handle wrapping a libSQL database.
pub struct Storage {
    #[allow(dead_code)]
    db: Database,
    conn: Connection,
    readonly: bool,
}

impl Storage {
    /// Open or create a database at `path` in read-write mode.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ChartDocError::io(parent, e))?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        let storage = Self {
            db,
            conn,
            readonly: false,
        };
        storage.run_migrations().await?;
        Ok(storage)
    }

    /// Open an existing database at `path` for reading only.
    pub async fn open_readonly(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Err(ChartDocError::Storage(format!(
                "database not found at {}",
                path.display()
            )));
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        let conn = db
            .connect()
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        Ok(Self {
            db,
            conn,
            readonly: true,
        })
    }

    async fn run_migrations(&self) -> Result<()> {
        let current_version = self.get_schema_version().await;

        for migration in migrations::all_migrations() {
            if migration.version > current_version {
                tracing::info!(
                    version = migration.version,
                    description = migration.description,
                    "applying migration"
                );
                self.conn
                    .execute_batch(migration.sql)
                    .await
                    .map_err(|e| {
                        ChartDocError::Storage(format!(
                            "migration v{} failed: {e}",
                            migration.version
                        ))
                    })?;
            }
        }
        Ok(())
    }

    /// Current schema version, or 0 before the first migration.
    async fn get_schema_version(&self) -> u32 {
        let result = self
            .conn
            .query("SELECT MAX(version) FROM schema_migrations", params![])
            .await;

        match result {
            Ok(mut rows) => {
                if let Ok(Some(row)) = rows.next().await {
                    row.get::<u32>(0).unwrap_or(0)
                } else {
                    0
                }
            }
            Err(_) => 0,
        }
    }

    fn check_writable(&self) -> Result<()> {
        if self.readonly {
            return Err(ChartDocError::Storage(
                "database is opened in read-only mode".into(),
            ));
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Language-model reply cache
    // -----------------------------------------------------------------------

    /// Cached reply for a prompt hash and model.
    pub async fn get_cached_response(&self, prompt_hash: &str, model: &str) -> Result<Option<String>> {
        let mut rows = self
            .conn
            .query(
                "SELECT response FROM llm_cache WHERE prompt_hash = ?1 AND model = ?2",
                params![prompt_hash, model],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let response: String = row
                    .get(0)
                    .map_err(|e| ChartDocError::Storage(e.to_string()))?;
                Ok(Some(response))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(ChartDocError::Storage(e.to_string())),
        }
    }

    /// Store a reply (upserts).
    pub async fn set_cached_response(&self, prompt_hash: &str, model: &str, response: &str) -> Result<()> {
        self.check_writable()?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO llm_cache (prompt_hash, model, response, created_at)
                 VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(prompt_hash, model) DO UPDATE SET
                   response = excluded.response,
                   created_at = excluded.created_at",
                params![prompt_hash, model, response, now.as_str()],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;
        Ok(())
    }

    /// Drop every cached reply. Returns the number removed.
    pub async fn clear_response_cache(&self) -> Result<u64> {
        self.check_writable()?;
        self.conn
            .execute("DELETE FROM llm_cache", params![])
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))
    }

    // -----------------------------------------------------------------------
    // Run history
    // -----------------------------------------------------------------------

    /// Persist a finished batch report.
    pub async fn record_run(&self, report: &BatchReport) -> Result<()> {
        self.check_writable()?;
        let json = serde_json::to_string(report)
            .map_err(|e| ChartDocError::Storage(format!("failed to encode report: {e}")))?;
        let id = report.run_id.to_string();
        let started = report.started_at.to_rfc3339();
        let finished = report.finished_at.to_rfc3339();

        self.conn
            .execute(
                "INSERT INTO runs (id, mode, started_at, finished_at, report_json)
                 VALUES (?1, ?2, ?3, ?4, ?5)
                 ON CONFLICT(id) DO UPDATE SET
                   finished_at = excluded.finished_at,
                   report_json = excluded.report_json",
                params![
                    id.as_str(),
                    report.mode.as_str(),
                    started.as_str(),
                    finished.as_str(),
                    json.as_str()
                ],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;
        debug!(run_id = %id, "run recorded");
        Ok(())
    }

    /// Most recent runs first.
    pub async fn list_runs(&self, limit: u32) -> Result<Vec<BatchReport>> {
        let mut rows = self
            .conn
            .query(
                "SELECT report_json FROM runs ORDER BY started_at DESC LIMIT ?1",
                params![i64::from(limit)],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        let mut runs = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?
        {
            let json: String = row
                .get(0)
                .map_err(|e| ChartDocError::Storage(e.to_string()))?;
            let report: BatchReport = serde_json::from_str(&json)
                .map_err(|e| ChartDocError::Storage(format!("corrupt run report: {e}")))?;
            runs.push(report);
        }
        Ok(runs)
    }
}

// ---------------------------------------------------------------------------
// Local ledger backend
// ---------------------------------------------------------------------------

#[async_trait]
impl Ledger for Storage {
    async fn lookup(&self, sheet: LedgerSheet, key: &str) -> Result<Option<PublishedRecord>> {
        let key = checked_key(key)?;
        let mut rows = self
            .conn
            .query(
                "SELECT key, display_name, url, external_id, html FROM ledger
                 WHERE sheet = ?1 AND key = ?2",
                params![sheet.as_str(), key],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_record(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(ChartDocError::Storage(e.to_string())),
        }
    }

    async fn append(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
        self.check_writable()?;
        let key = checked_key(&record.key)?;
        let now = Utc::now().to_rfc3339();
        self.conn
            .execute(
                "INSERT INTO ledger (sheet, key, display_name, url, external_id, html, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(sheet, key) DO UPDATE SET
                   display_name = excluded.display_name,
                   url = excluded.url,
                   external_id = excluded.external_id,
                   html = excluded.html,
                   updated_at = excluded.updated_at",
                params![
                    sheet.as_str(),
                    key,
                    record.display_name.as_str(),
                    record.url.as_str(),
                    record.external_id.as_str(),
                    record.html.as_str(),
                    now.as_str()
                ],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;
        Ok(())
    }

    async fn delete(&self, sheet: LedgerSheet, key: &str) -> Result<bool> {
        self.check_writable()?;
        let key = checked_key(key)?;
        let removed = self
            .conn
            .execute(
                "DELETE FROM ledger WHERE sheet = ?1 AND key = ?2",
                params![sheet.as_str(), key],
            )
            .await
            .map_err(|e| ChartDocError::Storage(e.to_string()))?;
        Ok(removed > 0)
    }

    /// `append` already upserts, so the swap is a single statement.
    async fn replace(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
        self.append(sheet, record).await
    }
}

fn row_to_record(row: &libsql::Row) -> Result<PublishedRecord> {
    let get = |i: i32| {
        row.get::<String>(i)
            .map_err(|e| ChartDocError::Storage(e.to_string()))
    };
    Ok(PublishedRecord {
        key: get(0)?,
        display_name: get(1)?,
        url: get(2)?,
        external_id: get(3)?,
        html: get(4)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chartdoc_shared::{ArticleReport, ItemStatus, LinkReport, Mode, PageMetadata, RunId};
    use uuid::Uuid;

    async fn test_storage() -> Storage {
        let tmp = std::env::temp_dir().join(format!("cd_test_{}.db", Uuid::now_v7()));
        Storage::open(&tmp).await.expect("open test db")
    }

    fn record(key: &str, html: &str) -> PublishedRecord {
        PublishedRecord {
            key: key.into(),
            display_name: format!("{key} (display)"),
            url: format!("https://help.example.com/articles/{key}"),
            external_id: "101".into(),
            html: html.into(),
        }
    }

    #[tokio::test]
    async fn open_and_migrate() {
        let storage = test_storage().await;
        assert_eq!(storage.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn idempotent_migration() {
        let tmp = std::env::temp_dir().join(format!("cd_test_{}.db", Uuid::now_v7()));
        let first = Storage::open(&tmp).await.expect("first open");
        drop(first);
        let second = Storage::open(&tmp).await.expect("second open");
        assert_eq!(second.get_schema_version().await, 2);
    }

    #[tokio::test]
    async fn ledger_append_lookup_delete() {
        let storage = test_storage().await;
        let sheet = LedgerSheet::DataDictionary;

        assert!(storage.lookup(sheet, "Capacity").await.expect("miss").is_none());

        storage
            .append(sheet, &record("Capacity", "<p>v1</p>"))
            .await
            .expect("append");
        let found = storage
            .lookup(sheet, " Capacity ")
            .await
            .expect("lookup")
            .expect("record present");
        assert_eq!(found.html, "<p>v1</p>");
        assert_eq!(found.display_name, "Capacity (display)");

        // Sheets are independent tables.
        assert!(
            storage
                .lookup(LedgerSheet::ChartLibrary, "Capacity")
                .await
                .expect("other sheet")
                .is_none()
        );

        assert!(storage.delete(sheet, "Capacity").await.expect("delete"));
        assert!(!storage.delete(sheet, "Capacity").await.expect("delete again"));
        assert!(storage.lookup(sheet, "Capacity").await.expect("gone").is_none());
    }

    #[tokio::test]
    async fn replace_overwrites_cached_html() {
        let storage = test_storage().await;
        let sheet = LedgerSheet::ChartLibrary;
        storage.append(sheet, &record("views/a", "old")).await.expect("append");
        storage.replace(sheet, &record("views/a", "new")).await.expect("replace");

        let found = storage.lookup(sheet, "views/a").await.expect("lookup");
        assert_eq!(found.map(|r| r.html).as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn rejected_replace_leaves_row_in_place() {
        let tmp = std::env::temp_dir().join(format!("cd_test_{}.db", Uuid::now_v7()));
        let sheet = LedgerSheet::DataDictionary;
        let writer = Storage::open(&tmp).await.expect("create");
        writer.append(sheet, &record("Capacity", "old")).await.expect("append");
        drop(writer);

        let storage = Storage::open_readonly(&tmp).await.expect("open readonly");
        assert!(storage.replace(sheet, &record("Capacity", "new")).await.is_err());

        let kept = storage.lookup(sheet, "Capacity").await.expect("lookup");
        assert_eq!(kept.map(|r| r.html).as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn batch_lookup_keeps_alignment() {
        let storage = test_storage().await;
        let sheet = LedgerSheet::DataDictionary;
        storage.append(sheet, &record("B", "")).await.expect("append");

        let keys = vec!["A".to_string(), "B".to_string()];
        let found = storage.batch_lookup(sheet, &keys).await.expect("batch");
        assert_eq!(found.len(), 2);
        assert!(found[0].is_none());
        assert_eq!(found[1].as_ref().map(|r| r.key.as_str()), Some("B"));
    }

    #[tokio::test]
    async fn empty_key_is_rejected() {
        let storage = test_storage().await;
        let err = storage
            .lookup(LedgerSheet::DataDictionary, "  ")
            .await
            .unwrap_err();
        assert!(matches!(err, ChartDocError::Validation { .. }));
    }

    #[tokio::test]
    async fn response_cache() {
        let storage = test_storage().await;

        let cached = storage
            .get_cached_response("hash1", "gpt-4o")
            .await
            .expect("cache miss");
        assert!(cached.is_none());

        storage
            .set_cached_response("hash1", "gpt-4o", r#"{"human_name": "Capacity"}"#)
            .await
            .expect("set cache");
        storage
            .set_cached_response("hash1", "gpt-4o", r#"{"human_name": "System Capacity"}"#)
            .await
            .expect("overwrite cache");

        let cached = storage
            .get_cached_response("hash1", "gpt-4o")
            .await
            .expect("cache hit");
        assert_eq!(cached.as_deref(), Some(r#"{"human_name": "System Capacity"}"#));

        assert_eq!(storage.clear_response_cache().await.expect("clear"), 1);
    }

    #[tokio::test]
    async fn run_history_roundtrip() {
        let storage = test_storage().await;
        let now = Utc::now();
        let report = BatchReport {
            run_id: RunId::new(),
            mode: Mode::Preview,
            started_at: now,
            finished_at: now,
            articles: vec![ArticleReport {
                article_id: "42".into(),
                page: PageMetadata::default(),
                status: ItemStatus::Success,
                reason: None,
                charts: vec![],
                summary: None,
                links: LinkReport::default(),
            }],
        };

        storage.record_run(&report).await.expect("record run");
        let runs = storage.list_runs(10).await.expect("list runs");
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].run_id, report.run_id);
        assert_eq!(runs[0].mode, Mode::Preview);
        assert_eq!(runs[0].articles[0].article_id, "42");
    }

    #[tokio::test]
    async fn unreadable_history_row_is_an_error() {
        let storage = test_storage().await;
        storage
            .conn
            .execute(
                "INSERT INTO runs (id, mode, started_at, finished_at, report_json)
                 VALUES ('bad', 'create', '2026-01-01T00:00:00Z', '2026-01-01T00:00:00Z', 'not json')",
                params![],
            )
            .await
            .expect("insert bad row");

        let err = storage.list_runs(10).await.unwrap_err();
        assert!(matches!(err, ChartDocError::Storage(_)));
    }

    #[tokio::test]
    async fn readonly_rejects_writes() {
        let tmp = std::env::temp_dir().join(format!("cd_test_{}.db", Uuid::now_v7()));
        drop(Storage::open(&tmp).await.expect("create"));
        let storage = Storage::open_readonly(&tmp).await.expect("open readonly");
        let err = storage
            .append(LedgerSheet::DataDictionary, &record("x", ""))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("read-only"));
    }
}
