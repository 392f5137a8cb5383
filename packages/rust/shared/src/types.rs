//! Core domain types shared by every chartdoc crate.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// RunId
// ---------------------------------------------------------------------------

/// A UUID v7 wrapper identifying one batch run (time-sortable).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub Uuid);

impl RunId {
    /// Generate a new time-sortable run identifier.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for RunId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

// ---------------------------------------------------------------------------
// Content extraction output
// ---------------------------------------------------------------------------

/// One chart found in a CMS article, in document order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChartDescriptor {
    /// Source-view identifier from the image's `view` attribute.
    pub view_id: String,
    /// Chart title (free text preceding the image).
    pub title: String,
    /// Absolute image URL.
    pub image_url: String,
    /// Workbook sheet name used to locate the view (`tabs` attribute).
    pub view_name: String,
    /// Descriptive caption text following the image.
    pub caption: String,
}

/// Page-level metadata mined from the article and its header image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageMetadata {
    pub title: String,
    pub category: String,
    pub technology: String,
    /// Image URL of the decorative header, when one was found.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub header_image: Option<String>,
}

// ---------------------------------------------------------------------------
// Ledger
// ---------------------------------------------------------------------------

/// Logical ledger table, one per publishable category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerSheet {
    DataDictionary,
    ChartLibrary,
    ArticleLibrary,
}

impl LedgerSheet {
    /// Default sheet/table name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::DataDictionary => "data_dictionary",
            Self::ChartLibrary => "chart_library",
            Self::ArticleLibrary => "article_library",
        }
    }
}

impl fmt::Display for LedgerSheet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LedgerSheet {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "data_dictionary" | "field" | "fields" => Ok(Self::DataDictionary),
            "chart_library" | "chart" | "charts" => Ok(Self::ChartLibrary),
            "article_library" | "article" | "articles" => Ok(Self::ArticleLibrary),
            other => Err(format!("unknown ledger sheet '{other}'")),
        }
    }
}

/// One published unit as persisted in the ledger.
///
/// `key` is always the pre-formatting canonical name so that display
/// renames never produce a second row.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublishedRecord {
    pub key: String,
    pub display_name: String,
    pub url: String,
    pub external_id: String,
    /// Cached rendered HTML.
    #[serde(default)]
    pub html: String,
}

// ---------------------------------------------------------------------------
// Batch request / mode
// ---------------------------------------------------------------------------

/// How a batch treats existing ledger records.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Mode {
    /// Publish new items, skip duplicates.
    #[default]
    Create,
    /// Render everything and diff against the cache; never mutate.
    #[serde(alias = "update-preview")]
    Preview,
    /// Update existing items in place, create missing ones.
    #[serde(alias = "update-apply")]
    Apply,
    /// Like `Apply`, restricted to operator-confirmed keys.
    #[serde(alias = "confirm")]
    ConfirmSubset,
}

impl Mode {
    /// Whether this mode writes to the help center or ledger.
    pub fn is_mutating(&self) -> bool {
        !matches!(self, Self::Preview)
    }

    /// Whether existing records are updated rather than skipped.
    pub fn updates_existing(&self) -> bool {
        matches!(self, Self::Preview | Self::Apply | Self::ConfirmSubset)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Preview => "preview",
            Self::Apply => "apply",
            Self::ConfirmSubset => "confirm-subset",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "create" => Ok(Self::Create),
            "preview" | "update-preview" => Ok(Self::Preview),
            "apply" | "update-apply" => Ok(Self::Apply),
            "confirm" | "confirm-subset" => Ok(Self::ConfirmSubset),
            other => Err(format!("unknown mode '{other}'")),
        }
    }
}

/// One trigger: a batch of CMS article IDs plus a mode flag.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchRequest {
    pub article_ids: Vec<String>,
    #[serde(default)]
    pub mode: Mode,
    /// Keys an operator approved after a preview (`confirm-subset` only).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub confirm: Vec<String>,
}

// ---------------------------------------------------------------------------
// State machine stages
// ---------------------------------------------------------------------------

/// Per-chart processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ChartStage {
    Pending,
    DuplicateCheck,
    WorkbookLookup,
    XmlFetch,
    AiChartAnalysis,
    FieldLoop,
    ChartPublish,
    Done,
}

impl ChartStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DuplicateCheck => "duplicate-check",
            Self::WorkbookLookup => "workbook-lookup",
            Self::XmlFetch => "xml-fetch",
            Self::AiChartAnalysis => "ai-chart-analysis",
            Self::FieldLoop => "field-loop",
            Self::ChartPublish => "chart-publish",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for ChartStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-field processing stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FieldStage {
    Pending,
    DuplicateCheck,
    ContextResolve,
    AiFieldAnalysis,
    NameResolve,
    HtmlFormat,
    Publish,
    Log,
    Done,
}

impl FieldStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::DuplicateCheck => "duplicate-check",
            Self::ContextResolve => "context-resolve",
            Self::AiFieldAnalysis => "ai-field-analysis",
            Self::NameResolve => "name-resolve",
            Self::HtmlFormat => "html-format",
            Self::Publish => "publish",
            Self::Log => "log",
            Self::Done => "done",
        }
    }
}

impl fmt::Display for FieldStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Outcomes
// ---------------------------------------------------------------------------

/// Terminal status of one item.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemStatus {
    Success,
    Skipped,
    Failed,
}

/// Old vs new rendered content for operator review.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentDiff {
    /// Cached content, `None` when the item would be created.
    pub old: Option<String>,
    pub new: String,
    pub changed: bool,
    /// Unified diff of `old` vs `new`, line-oriented.
    pub unified: String,
}

/// Uniform `{status, reason, payload}` record for every processed item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemOutcome {
    /// Ledger key (canonical name, view id, or article id).
    pub key: String,
    /// Display name.
    pub name: String,
    pub status: ItemStatus,
    /// Stage the item ended in.
    pub stage: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub preview: Option<ContentDiff>,
}

impl ItemOutcome {
    fn new(
        key: impl Into<String>,
        name: impl Into<String>,
        status: ItemStatus,
        stage: impl fmt::Display,
    ) -> Self {
        Self {
            key: key.into(),
            name: name.into(),
            status,
            stage: stage.to_string(),
            reason: None,
            url: None,
            external_id: None,
            preview: None,
        }
    }

    pub fn success(key: impl Into<String>, name: impl Into<String>, stage: impl fmt::Display) -> Self {
        Self::new(key, name, ItemStatus::Success, stage)
    }

    pub fn skipped(
        key: impl Into<String>,
        name: impl Into<String>,
        stage: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(key, name, ItemStatus::Skipped, stage).with_reason(reason)
    }

    pub fn failed(
        key: impl Into<String>,
        name: impl Into<String>,
        stage: impl fmt::Display,
        reason: impl Into<String>,
    ) -> Self {
        Self::new(key, name, ItemStatus::Failed, stage).with_reason(reason)
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        if !url.is_empty() {
            self.url = Some(url);
        }
        self
    }

    pub fn with_external_id(mut self, id: impl Into<String>) -> Self {
        let id = id.into();
        if !id.is_empty() {
            self.external_id = Some(id);
        }
        self
    }

    pub fn with_preview(mut self, diff: ContentDiff) -> Self {
        self.preview = Some(diff);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ItemStatus::Success
    }
}

/// One chart and the fields processed under it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChartReport {
    #[serde(flatten)]
    pub outcome: ItemOutcome,
    #[serde(default)]
    pub fields: Vec<ItemOutcome>,
}

/// Backlink section updates produced by the relationship linker.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinkReport {
    pub fields: Vec<ItemOutcome>,
    pub charts: Vec<ItemOutcome>,
}

/// Everything that happened for one CMS article.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArticleReport {
    pub article_id: String,
    #[serde(flatten)]
    pub page: PageMetadata,
    /// Article-level status (failed when the article itself could not be read).
    pub status: ItemStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub charts: Vec<ChartReport>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<ItemOutcome>,
    #[serde(default)]
    pub links: LinkReport,
}

/// Nested result of one batch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchReport {
    pub run_id: RunId,
    pub mode: Mode,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub articles: Vec<ArticleReport>,
}

/// Item counts by status across a whole report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct Totals {
    pub success: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl Totals {
    fn add(&mut self, status: ItemStatus) {
        match status {
            ItemStatus::Success => self.success += 1,
            ItemStatus::Skipped => self.skipped += 1,
            ItemStatus::Failed => self.failed += 1,
        }
    }
}

impl BatchReport {
    /// Count chart and field outcomes by status.
    pub fn totals(&self) -> (Totals, Totals) {
        let mut charts = Totals::default();
        let mut fields = Totals::default();
        for article in &self.articles {
            for chart in &article.charts {
                charts.add(chart.outcome.status);
                for field in &chart.fields {
                    fields.add(field.status);
                }
            }
        }
        (charts, fields)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_id_roundtrip() {
        let id = RunId::new();
        let parsed: RunId = id.to_string().parse().expect("parse RunId");
        assert_eq!(id, parsed);
    }

    #[test]
    fn mode_parsing_accepts_aliases() {
        assert_eq!("update-preview".parse::<Mode>(), Ok(Mode::Preview));
        assert_eq!("confirm".parse::<Mode>(), Ok(Mode::ConfirmSubset));
        assert!("delete".parse::<Mode>().is_err());
        assert!(!Mode::Preview.is_mutating());
        assert!(!Mode::Create.updates_existing());
    }

    #[test]
    fn batch_request_defaults_to_create() {
        let req: BatchRequest =
            serde_json::from_str(r#"{"article_ids": ["42"]}"#).expect("deserialize request");
        assert_eq!(req.mode, Mode::Create);
        assert!(req.confirm.is_empty());
    }

    #[test]
    fn outcome_serializes_uniform_shape() {
        let outcome = ItemOutcome::skipped("[Capacity]", "Capacity", FieldStage::DuplicateCheck, "duplicate")
            .with_url("https://help.example.com/a/1");
        let json = serde_json::to_value(&outcome).expect("serialize");
        assert_eq!(json["status"], "skipped");
        assert_eq!(json["stage"], "duplicate-check");
        assert_eq!(json["reason"], "duplicate");
        assert!(json.get("preview").is_none());
    }

    #[test]
    fn empty_url_is_not_recorded() {
        let outcome = ItemOutcome::success("k", "n", ChartStage::Done).with_url("");
        assert!(outcome.url.is_none());
    }

    #[test]
    fn ledger_sheet_names() {
        assert_eq!(LedgerSheet::ChartLibrary.as_str(), "chart_library");
        assert_eq!("fields".parse::<LedgerSheet>(), Ok(LedgerSheet::DataDictionary));
    }
}
