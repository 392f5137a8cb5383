//! Spreadsheet web-app ledger backend.
//!
//! The web app exposes one endpoint:
//! - `GET ?sheet_name=S` returns every row of `S` as a JSON array of arrays
//!   (`[key, display_name, url, external_id, html]`), or `{"error": ...}`.
//! - `POST` with a row object appends it.
//! - `POST` with `{"action": "delete", ...}` removes the row for a key.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, instrument};

use chartdoc_shared::{ChartDocError, LedgerConfig, LedgerSheet, PublishedRecord, Result};

use crate::ledger::{Ledger, checked_key};

const USER_AGENT: &str = concat!("chartdoc/", env!("CARGO_PKG_VERSION"));

/// [`Ledger`] backed by the spreadsheet web app.
pub struct SheetsLedger {
    client: Client,
    url: String,
    config: LedgerConfig,
}

#[derive(Serialize)]
struct AppendRow<'a> {
    sheet_name: &'a str,
    original_name: &'a str,
    human_name: &'a str,
    intercom_url: &'a str,
    intercom_id: &'a str,
    #[serde(rename = "HTML")]
    html: &'a str,
}

#[derive(Serialize)]
struct DeleteRow<'a> {
    action: &'static str,
    sheet_name: &'a str,
    original_name: &'a str,
}

impl SheetsLedger {
    pub fn new(config: &LedgerConfig) -> Result<Self> {
        if config.sheets_url.trim().is_empty() {
            return Err(ChartDocError::config("ledger.sheets_url is not set"));
        }
        let client = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| ChartDocError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            url: config.sheets_url.trim().to_string(),
            config: config.clone(),
        })
    }

    /// Every row of a sheet, converted to records.
    #[instrument(skip_all, fields(sheet = %sheet))]
    pub async fn rows(&self, sheet: LedgerSheet) -> Result<Vec<PublishedRecord>> {
        let sheet_name = self.config.sheet_name(sheet);
        let response = self
            .client
            .get(&self.url)
            .query(&[("sheet_name", sheet_name)])
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("ledger {sheet_name}: {e}")))?;
        let body = read_json(response, sheet_name).await?;

        let Value::Array(rows) = body else {
            return Err(ChartDocError::parse(format!(
                "ledger {sheet_name}: expected a row array"
            )));
        };

        let records: Vec<PublishedRecord> = rows.iter().filter_map(row_to_record).collect();
        debug!(rows = records.len(), "ledger sheet read");
        Ok(records)
    }

    async fn post<T: Serialize + ?Sized>(&self, sheet_name: &str, body: &T) -> Result<Value> {
        let response = self
            .client
            .post(&self.url)
            .json(body)
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("ledger {sheet_name}: {e}")))?;
        read_json(response, sheet_name).await
    }
}

#[async_trait]
impl Ledger for SheetsLedger {
    async fn lookup(&self, sheet: LedgerSheet, key: &str) -> Result<Option<PublishedRecord>> {
        let key = checked_key(key)?;
        Ok(self.rows(sheet).await?.into_iter().find(|r| r.key == key))
    }

    /// One sheet read for the whole batch.
    async fn batch_lookup(
        &self,
        sheet: LedgerSheet,
        keys: &[String],
    ) -> Result<Vec<Option<PublishedRecord>>> {
        let rows = self.rows(sheet).await?;
        Ok(keys
            .iter()
            .map(|key| rows.iter().find(|r| r.key == key.trim()).cloned())
            .collect())
    }

    #[instrument(skip_all, fields(sheet = %sheet, key = %record.key))]
    async fn append(&self, sheet: LedgerSheet, record: &PublishedRecord) -> Result<()> {
        let key = checked_key(&record.key)?;
        let sheet_name = self.config.sheet_name(sheet);
        let row = AppendRow {
            sheet_name,
            original_name: key,
            human_name: record.display_name.trim(),
            intercom_url: record.url.trim(),
            intercom_id: record.external_id.trim(),
            html: &record.html,
        };
        self.post(sheet_name, &row).await?;
        Ok(())
    }

    #[instrument(skip_all, fields(sheet = %sheet))]
    async fn delete(&self, sheet: LedgerSheet, key: &str) -> Result<bool> {
        let key = checked_key(key)?;
        let sheet_name = self.config.sheet_name(sheet);
        let reply = self
            .post(
                sheet_name,
                &DeleteRow {
                    action: "delete",
                    sheet_name,
                    original_name: key,
                },
            )
            .await?;

        Ok(match reply.get("deleted") {
            Some(Value::Bool(deleted)) => *deleted,
            Some(Value::Number(n)) => n.as_u64().is_some_and(|n| n > 0),
            _ => true,
        })
    }
}

/// Check status and the app's `{"error"}` convention, then decode.
async fn read_json(response: Response, sheet_name: &str) -> Result<Value> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ChartDocError::Network(format!("ledger {sheet_name}: failed to read body: {e}")))?;

    if !status.is_success() {
        return Err(ChartDocError::Network(format!(
            "ledger {sheet_name}: HTTP {status}: {}",
            excerpt(&text)
        )));
    }
    if text.trim().is_empty() {
        return Ok(Value::Null);
    }

    let value: Value = serde_json::from_str(&text).map_err(|e| {
        ChartDocError::parse(format!("ledger {sheet_name}: invalid JSON reply: {e}"))
    })?;
    if let Some(error) = value.get("error") {
        return Err(ChartDocError::Storage(format!(
            "ledger {sheet_name}: script error: {}",
            cell(error)
        )));
    }
    Ok(value)
}

fn row_to_record(row: &Value) -> Option<PublishedRecord> {
    let cells = row.as_array()?;
    let at = |i: usize| cells.get(i).map(cell).unwrap_or_default();
    let key = at(0);
    if key.is_empty() {
        return None;
    }
    Some(PublishedRecord {
        key,
        display_name: at(1),
        url: at(2),
        external_id: at(3),
        html: cells
            .get(4)
            .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| cell(v)))
            .unwrap_or_default(),
    })
}

/// Spreadsheet cells come back as strings or numbers.
fn cell(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}
