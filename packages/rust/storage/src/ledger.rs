//! The duplicate registry and rendered-content cache.

use async_trait::async_trait;
use tracing::warn;

use chartdoc_shared::{ChartDocError, LedgerSheet, PublishedRecord, Result};

/// Keyed record store, one logical table per [`LedgerSheet`].
///
/// Keys are canonical (pre-formatting) names, so display renames never
/// create a second row for the same item.
#[async_trait]
pub trait Ledger: Send + Sync {
    /// Find the record for `key`, if any.
    async fn lookup(&self, sheet: LedgerSheet, key: &str) -> Result<Option<PublishedRecord>>;

    /// Look up several keys at once. The result is aligned with `keys`.
    async fn batch_lookup(
        &self,
        sheet: LedgerSheet,
        keys: &[String],
    ) -> Result<Vec<Option<PublishedRecord>>> {
        let mut out = Vec::with_capacity(keys.len());
        for key in keys {
            out.push(self.lookup(sheet, key).await?);
        }
        Ok(out)
    }

    /// Add a record.
    async fn append(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()>;

    /// Remove the record for `key`. Returns whether one existed.
    async fn delete(&self, sheet: LedgerSheet, key: &str) -> Result<bool>;

    /// Swap the stored record for `record.key`.
    ///
    /// Backends without an atomic upsert fall back to delete-then-append.
    /// When the append fails the previous row is written back, so the key
    /// stays registered for the duplicate check.
    async fn replace(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
        let previous = self.lookup(sheet, &record.key).await?;
        self.delete(sheet, &record.key).await?;
        let Err(e) = self.append(sheet, record).await else {
            return Ok(());
        };
        if let Some(previous) = previous {
            if let Err(restore) = self.append(sheet, &previous).await {
                warn!(key = %record.key, error = %restore, "could not restore ledger row");
            }
        }
        Err(e)
    }
}

/// Reject blank keys before they reach a backend.
pub(crate) fn checked_key(key: &str) -> Result<&str> {
    let key = key.trim();
    if key.is_empty() {
        return Err(ChartDocError::validation("ledger key is empty"));
    }
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fails the first `failures` appends.
    #[derive(Default)]
    struct FlakyLedger {
        rows: Mutex<Vec<PublishedRecord>>,
        failures: AtomicUsize,
    }

    impl FlakyLedger {
        fn failing(failures: usize) -> Self {
            Self {
                rows: Mutex::default(),
                failures: AtomicUsize::new(failures),
            }
        }
    }

    #[async_trait]
    impl Ledger for FlakyLedger {
        async fn lookup(&self, _sheet: LedgerSheet, key: &str) -> Result<Option<PublishedRecord>> {
            let rows = self.rows.lock().expect("lock");
            Ok(rows.iter().find(|r| r.key == key).cloned())
        }

        async fn append(&self, _sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
            let left = self.failures.load(Ordering::SeqCst);
            if left > 0 {
                self.failures.store(left - 1, Ordering::SeqCst);
                return Err(ChartDocError::Storage("transient append failure".into()));
            }
            self.rows.lock().expect("lock").push(record.clone());
            Ok(())
        }

        async fn delete(&self, _sheet: LedgerSheet, key: &str) -> Result<bool> {
            let mut rows = self.rows.lock().expect("lock");
            let before = rows.len();
            rows.retain(|r| r.key != key);
            Ok(rows.len() != before)
        }
    }

    fn record(html: &str) -> PublishedRecord {
        PublishedRecord {
            key: "Capacity".into(),
            display_name: "Capacity".into(),
            url: "https://help.example.com/articles/7".into(),
            external_id: "7".into(),
            html: html.into(),
        }
    }

    #[tokio::test]
    async fn failed_replace_keeps_previous_row() {
        let ledger = FlakyLedger::default();
        let sheet = LedgerSheet::DataDictionary;
        ledger.append(sheet, &record("old")).await.expect("seed");
        ledger.failures.store(1, Ordering::SeqCst);

        let err = ledger.replace(sheet, &record("new")).await.unwrap_err();
        assert!(err.to_string().contains("transient append failure"));

        let kept = ledger.lookup(sheet, "Capacity").await.expect("lookup");
        assert_eq!(kept.map(|r| r.html).as_deref(), Some("old"));
    }

    #[tokio::test]
    async fn replace_swaps_row() {
        let ledger = FlakyLedger::failing(0);
        let sheet = LedgerSheet::ChartLibrary;
        ledger.append(sheet, &record("old")).await.expect("seed");
        ledger.replace(sheet, &record("new")).await.expect("replace");

        let rows = ledger.rows.lock().expect("lock").clone();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].html, "new");
    }
}
