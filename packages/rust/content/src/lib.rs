//! CMS article parsing for chartdoc.
//!
//! Reduces an article body to text with positional chart markers, then walks
//! the sections to recover the ordered chart list and the page metadata
//! carried by the decorative header image.

mod caption;
mod cleanup;

use std::sync::LazyLock;

use regex::Regex;
use tracing::{debug, instrument};
use url::Url;

use chartdoc_shared::{ChartDescriptor, PageMetadata};

pub use caption::{NO_DESCRIPTION, clean_caption};

use cleanup::{ANCHOR_PREFIX, Anchor, SECTION_DIVIDER, UNKNOWN_TITLE, UNKNOWN_VIEW};

/// Page title used when the article has no leading text section.
pub const DEFAULT_TITLE: &str = "Analysis Report";

static ANCHOR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\[\[CHART_ANCHOR\|(.*?)\|(.*?)\|(.*?)\|(.*?)\]\]").expect("valid regex")
});

/// Extract page metadata and the ordered chart list from article HTML.
///
/// `base_url` resolves relative image sources. The first qualifying image is
/// the page header and never appears in the chart list.
#[instrument(skip_all, fields(html_len = html.len()))]
pub fn extract(html: &str, base_url: Option<&Url>) -> (PageMetadata, Vec<ChartDescriptor>) {
    let text = cleanup::run_pipeline(html, base_url);
    let (page, charts) = walk_sections(&text);
    debug!(
        charts = charts.len(),
        category = %page.category,
        technology = %page.technology,
        "article extracted"
    );
    (page, charts)
}

fn walk_sections(text: &str) -> (PageMetadata, Vec<ChartDescriptor>) {
    let mut page = PageMetadata {
        title: DEFAULT_TITLE.to_string(),
        ..PageMetadata::default()
    };
    let mut charts = Vec::new();
    let mut header_view: Option<String> = None;

    for (index, section) in text.split(SECTION_DIVIDER).enumerate() {
        let section = section.trim();
        if section.is_empty() {
            continue;
        }

        let anchors: Vec<(regex::Match<'_>, Anchor)> = ANCHOR_RE
            .captures_iter(section)
            .filter_map(|caps| {
                let whole = caps.get(0)?;
                Some((
                    whole,
                    Anchor {
                        view_id: caps[1].to_string(),
                        image_url: caps[2].to_string(),
                        title: caps[3].to_string(),
                        tabs: caps[4].to_string(),
                    },
                ))
            })
            .collect();

        if anchors.is_empty() {
            if index == 0 {
                page.title = section.to_string();
            }
            continue;
        }

        for (i, (whole, anchor)) in anchors.iter().enumerate() {
            if !qualifies(anchor, header_view.as_deref()) {
                continue;
            }

            let before_start = if i == 0 { 0 } else { anchors[i - 1].0.end() };
            let before = &section[before_start..whole.start()];

            if header_view.is_none() {
                header_view = Some(anchor.view_id.clone());
                apply_header(&mut page, anchor);
                if let Some(line) = last_text_line(before) {
                    page.title = line.to_string();
                }
                continue;
            }

            let after_end = anchors
                .get(i + 1)
                .map(|(next, _)| next.start())
                .unwrap_or(section.len());
            let after = &section[whole.end()..after_end];

            charts.push(ChartDescriptor {
                view_id: anchor.view_id.clone(),
                title: last_text_line(before)
                    .map(str::to_string)
                    .unwrap_or_else(|| anchor.title.clone()),
                image_url: anchor.image_url.clone(),
                view_name: anchor.tabs.clone(),
                caption: clean_caption(after),
            });
        }
    }

    (page, charts)
}

/// Markers without a view, blob uploads, and repeats of the header are art.
fn qualifies(anchor: &Anchor, header_view: Option<&str>) -> bool {
    anchor.view_id != UNKNOWN_VIEW
        && !anchor.image_url.contains("blobid")
        && header_view.is_none_or(|header| header != anchor.view_id)
}

/// Header titles look like `Slide Header: Residential Solar PV`.
fn apply_header(page: &mut PageMetadata, anchor: &Anchor) {
    page.header_image = Some(anchor.image_url.clone());

    let raw = anchor.title.trim();
    if raw.is_empty() || raw == UNKNOWN_TITLE || raw.contains("Unknown") {
        return;
    }
    let name = match raw.split_once(':') {
        Some((_, rest)) => rest.trim().to_string(),
        None => raw.replace("Slide Header", "").trim().to_string(),
    };

    let mut words = name.split_whitespace();
    if let Some(first) = words.next() {
        page.category = first.to_string();
    }
    page.technology = words.collect::<Vec<_>>().join(" ");
}

fn last_text_line(text: &str) -> Option<&str> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.contains(ANCHOR_PREFIX))
        .last()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
