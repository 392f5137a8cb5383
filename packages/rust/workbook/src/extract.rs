//! View extraction: the worksheet(s) behind a published view, with shelf
//! and filter fields resolved to canonical names.

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use chartdoc_shared::{ChartDocError, Result};

use crate::document::{Workbook, Worksheet};
use crate::normalize::canonical_parts;

/// Filters rendered into the summary text.
const MAX_RENDERED_FILTERS: usize = 5;

/// Filter columns that are Tableau plumbing rather than data.
const PSEUDO_FILTERS: &[&str] = &["Action", "Measure Names"];

/// One worksheet, as seen by the language model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetSummary {
    pub sheet: String,
    pub title: String,
    pub rows: Vec<String>,
    pub cols: Vec<String>,
    pub filters: Vec<String>,
}

impl SheetSummary {
    fn render(&self) -> String {
        let filters: Vec<&str> = self
            .filters
            .iter()
            .take(MAX_RENDERED_FILTERS)
            .map(String::as_str)
            .collect();
        format!(
            "=== Chart: {} ===\nTitle: {}\nY-Axis: {}\nX-Axis: {}\nFilters: {}",
            self.sheet,
            self.title,
            or_none(&self.rows.join(", ")),
            or_none(&self.cols.join(", ")),
            or_none(&filters.join(", ")),
        )
    }

    /// Every field named on the sheet, rows first, deduplicated.
    pub fn fields(&self) -> Vec<&str> {
        let mut out: Vec<&str> = Vec::new();
        for name in self.rows.iter().chain(&self.cols).chain(&self.filters) {
            if !out.contains(&name.as_str()) {
                out.push(name);
            }
        }
        out
    }
}

/// Summary of every worksheet matching a view name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewSummary {
    pub view: String,
    pub sheets: Vec<SheetSummary>,
}

impl ViewSummary {
    /// Text block handed to the language model.
    pub fn render(&self) -> String {
        self.sheets
            .iter()
            .map(SheetSummary::render)
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}

/// Parse workbook bytes and summarize `target_view`.
pub fn extract(bytes: &[u8], target_view: &str) -> Result<(Workbook, ViewSummary)> {
    let workbook = Workbook::from_bytes(bytes)?;
    let summary = summarize_view(&workbook, target_view)?;
    Ok((workbook, summary))
}

/// Summarize `target_view` in an already-parsed workbook.
///
/// Worksheets match when their whitespace-free, lowercased name contains the
/// equally squashed target. Without a worksheet match, a dashboard of that
/// name contributes the worksheets placed in its zones.
#[instrument(skip_all, fields(view = %target_view))]
pub fn summarize_view(workbook: &Workbook, target_view: &str) -> Result<ViewSummary> {
    let target = squash(target_view);
    if target.is_empty() {
        return Err(ChartDocError::view_not_found(target_view));
    }

    let mut matched: Vec<&Worksheet> = workbook
        .worksheets
        .iter()
        .filter(|ws| squash(&ws.name).contains(&target))
        .collect();

    if matched.is_empty() {
        for dashboard in workbook
            .dashboards
            .iter()
            .filter(|d| squash(&d.name).contains(&target))
        {
            for zone in &dashboard.zones {
                if let Some(ws) = workbook.worksheet(zone) {
                    if !matched.iter().any(|m| m.name == ws.name) {
                        matched.push(ws);
                    }
                }
            }
        }
    }

    if matched.is_empty() {
        return Err(ChartDocError::view_not_found(target_view));
    }

    let sheets: Vec<SheetSummary> = matched
        .into_iter()
        .map(|ws| summarize_sheet(workbook, ws))
        .collect();
    debug!(sheets = sheets.len(), "view matched");

    Ok(ViewSummary {
        view: target_view.to_string(),
        sheets,
    })
}

fn summarize_sheet(workbook: &Workbook, ws: &Worksheet) -> SheetSummary {
    let shelf = |raw: &Option<String>| -> Vec<String> {
        raw.as_deref()
            .map(|text| canonical_parts(&workbook.translate_ids(text)))
            .unwrap_or_default()
    };

    let mut filters: Vec<String> = Vec::new();
    for column in &ws.filters {
        if PSEUDO_FILTERS.iter().any(|p| column.contains(p)) {
            continue;
        }
        for name in canonical_parts(&workbook.translate_ids(column)) {
            if !filters.contains(&name) {
                filters.push(name);
            }
        }
    }

    SheetSummary {
        sheet: ws.name.clone(),
        title: ws
            .title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| ws.name.clone()),
        rows: shelf(&ws.rows),
        cols: shelf(&ws.cols),
        filters,
    }
}

fn squash(s: &str) -> String {
    s.chars()
        .filter(|c| !c.is_whitespace())
        .flat_map(char::to_lowercase)
        .collect()
}

fn or_none(s: &str) -> &str {
    if s.is_empty() { "None" } else { s }
}
