//! Backlink sections injected into already published documents.
//!
//! A field page lists the charts that use it ("Related Charts") and a chart
//! page lists the articles that embed it ("Related Articles"). Sections are
//! merged with whatever the cached content already lists, so repeated runs
//! converge on the same markup.

use std::sync::LazyLock;

use regex::Regex;
use tracing::{info, instrument, warn};

use chartdoc_clients::Publisher;
use chartdoc_shared::{ItemOutcome, LedgerSheet, Mode, PublishedRecord, Result};
use chartdoc_storage::Ledger;

use crate::formatter::{SPACER, escape_html, unescape_html};
use crate::preview::content_diff;

const STAGE: &str = "link";

static CHARTS_SECTION: LazyLock<Regex> = LazyLock::new(|| section_regex("Related Charts"));
static ARTICLES_SECTION: LazyLock<Regex> = LazyLock::new(|| section_regex("Related Articles"));
static LINK_ITEM: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?s)<li>\s*<a\s+href="([^"]*)"[^>]*>(.*?)</a>\s*</li>"#).expect("valid regex")
});

fn section_regex(heading: &str) -> Regex {
    Regex::new(&format!(
        r"(?s)<p><strong>{heading}:</strong></p>\s*<ul>(.*?)</ul>(?:\s*<p>&nbsp;</p>)?"
    ))
    .expect("valid regex")
}

/// Which backlink section a document carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Section {
    Charts,
    Articles,
}

impl Section {
    pub fn heading(&self) -> &'static str {
        match self {
            Self::Charts => "Related Charts",
            Self::Articles => "Related Articles",
        }
    }

    fn pattern(&self) -> &'static Regex {
        match self {
            Self::Charts => &CHARTS_SECTION,
            Self::Articles => &ARTICLES_SECTION,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelatedLink {
    pub title: String,
    pub url: String,
}

impl RelatedLink {
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
        }
    }
}

fn title_key(title: &str) -> String {
    title.trim().to_lowercase()
}

/// Links currently listed in `section` of `html`, in order.
pub fn parse_section(html: &str, section: Section) -> Vec<RelatedLink> {
    let Some(caps) = section.pattern().captures(html) else {
        return Vec::new();
    };
    LINK_ITEM
        .captures_iter(&caps[1])
        .map(|item| RelatedLink::new(unescape_html(item[2].trim()), unescape_html(&item[1])))
        .collect()
}

/// Set-union keyed on title. Previous entries keep their position and take
/// the newer URL; new titles follow in their given order.
pub fn merge(previous: &[RelatedLink], incoming: &[RelatedLink]) -> Vec<RelatedLink> {
    let mut merged: Vec<RelatedLink> = Vec::with_capacity(previous.len() + incoming.len());
    for link in previous.iter().chain(incoming) {
        if link.title.trim().is_empty() {
            continue;
        }
        let key = title_key(&link.title);
        match merged.iter_mut().find(|m| title_key(&m.title) == key) {
            Some(existing) => {
                if !link.url.is_empty() {
                    existing.url = link.url.clone();
                }
            }
            None => merged.push(link.clone()),
        }
    }
    merged
}

pub fn render_section(section: Section, links: &[RelatedLink]) -> String {
    if links.is_empty() {
        return String::new();
    }
    let mut out = format!("<p><strong>{}:</strong></p><ul>", section.heading());
    for link in links {
        out.push_str(&format!(
            "<li><a href=\"{}\" target=\"_blank\">{}</a></li>",
            escape_html(&link.url),
            escape_html(&link.title)
        ));
    }
    out.push_str("</ul>");
    out.push_str(SPACER);
    out
}

/// Replace `section` in `html`, or insert it before the trailing `<hr>`, or
/// append it.
pub fn inject_section(html: &str, section: Section, rendered: &str) -> String {
    if let Some(found) = section.pattern().find(html) {
        let mut out = String::with_capacity(html.len() + rendered.len());
        out.push_str(&html[..found.start()]);
        out.push_str(rendered);
        out.push_str(&html[found.end()..]);
        return out;
    }

    let trimmed = html.trim_end();
    if trimmed.ends_with("<hr>") {
        let at = trimmed.len() - "<hr>".len();
        return format!("{}{}{}", &html[..at], rendered, &html[at..]);
    }

    format!("{html}{rendered}")
}

/// Copy every backlink section present in `old` into a fresh rendering.
pub fn carry_sections(old: &str, fresh: &str) -> String {
    let mut out = fresh.to_string();
    for section in [Section::Charts, Section::Articles] {
        let previous = parse_section(old, section);
        if previous.is_empty() {
            continue;
        }
        let current = parse_section(&out, section);
        let rendered = render_section(section, &merge(&previous, &current));
        out = inject_section(&out, section, &rendered);
    }
    out
}

/// Backlinks to add to one published document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LinkRequest {
    pub sheet: LedgerSheet,
    pub section: Section,
    /// Ledger key of the document receiving the section.
    pub key: String,
    pub links: Vec<RelatedLink>,
}

impl LinkRequest {
    pub fn new(sheet: LedgerSheet, section: Section, key: impl Into<String>) -> Self {
        Self {
            sheet,
            section,
            key: key.into(),
            links: Vec::new(),
        }
    }

    /// Add a link unless its title is already present.
    pub fn push(&mut self, link: RelatedLink) {
        let key = title_key(&link.title);
        if !self.links.iter().any(|l| title_key(&l.title) == key) {
            self.links.push(link);
        }
    }
}

/// Apply every request in order. Each request yields exactly one outcome.
#[instrument(skip_all, fields(mode = %mode, requests = requests.len()))]
pub async fn link_all(
    ledger: &dyn Ledger,
    publisher: &dyn Publisher,
    mode: Mode,
    confirm: &[String],
    requests: &[LinkRequest],
) -> Vec<ItemOutcome> {
    let mut outcomes = Vec::with_capacity(requests.len());
    for request in requests {
        let outcome = match link_one(ledger, publisher, mode, confirm, request).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(key = %request.key, sheet = %request.sheet, error = %e, "backlink update failed");
                ItemOutcome::failed(&request.key, &request.key, STAGE, e.to_string())
            }
        };
        outcomes.push(outcome);
    }
    outcomes
}

async fn link_one(
    ledger: &dyn Ledger,
    publisher: &dyn Publisher,
    mode: Mode,
    confirm: &[String],
    request: &LinkRequest,
) -> Result<ItemOutcome> {
    let key = request.key.as_str();
    let Some(record) = ledger.lookup(request.sheet, key).await? else {
        return Ok(ItemOutcome::skipped(key, key, STAGE, "not published"));
    };
    let name = record.display_name.clone();
    if record.url.is_empty() || record.external_id.is_empty() {
        return Ok(ItemOutcome::skipped(key, name, STAGE, "no external url"));
    }

    let incoming: Vec<RelatedLink> = request
        .links
        .iter()
        .filter(|l| !l.url.is_empty())
        .cloned()
        .collect();
    if incoming.is_empty() {
        return Ok(ItemOutcome::skipped(key, name, STAGE, "no linkable items").with_url(&record.url));
    }

    let previous = parse_section(&record.html, request.section);
    let merged = merge(&previous, &incoming);
    let html = inject_section(
        &record.html,
        request.section,
        &render_section(request.section, &merged),
    );

    if html == record.html {
        return Ok(ItemOutcome::skipped(key, name, STAGE, "unchanged").with_url(&record.url));
    }

    if !mode.is_mutating() {
        return Ok(ItemOutcome::success(key, name, STAGE)
            .with_url(&record.url)
            .with_external_id(&record.external_id)
            .with_preview(content_diff(Some(&record.html), &html)));
    }

    if mode == Mode::ConfirmSubset && !confirm.iter().any(|c| c == key) {
        return Ok(ItemOutcome::skipped(key, name, STAGE, "not confirmed").with_url(&record.url));
    }

    let document = publisher
        .update(&record.external_id, &record.display_name, &html)
        .await?;
    ledger
        .replace(
            request.sheet,
            &PublishedRecord {
                key: record.key.clone(),
                display_name: record.display_name.clone(),
                url: document.url.clone(),
                external_id: document.id.clone(),
                html,
            },
        )
        .await?;

    info!(key, section = request.section.heading(), links = merged.len(), "backlinks updated");
    Ok(ItemOutcome::success(key, name, STAGE)
        .with_url(document.url)
        .with_external_id(document.id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MemoryLedger, RecordingPublisher};
    use chartdoc_shared::ItemStatus;

    fn field_record(html: &str) -> PublishedRecord {
        PublishedRecord {
            key: "Capacity".into(),
            display_name: "Installed Capacity".into(),
            url: "https://help.test/articles/f1".into(),
            external_id: "f1".into(),
            html: html.into(),
        }
    }

    fn request(links: &[(&str, &str)]) -> LinkRequest {
        let mut req = LinkRequest::new(LedgerSheet::DataDictionary, Section::Charts, "Capacity");
        for (title, url) in links {
            req.push(RelatedLink::new(*title, *url));
        }
        req
    }

    #[test]
    fn inject_before_trailing_rule() {
        let section = render_section(Section::Charts, &[RelatedLink::new("Monthly Output", "u1")]);
        let html = inject_section("<p>Definition</p><hr>", Section::Charts, &section);
        assert!(html.starts_with("<p>Definition</p><p><strong>Related Charts:</strong></p>"));
        assert!(html.ends_with("<p>&nbsp;</p><hr>"));
    }

    #[test]
    fn inject_appends_without_rule() {
        let section = render_section(Section::Articles, &[RelatedLink::new("Solar Q3", "u")]);
        let html = inject_section("<p>Chart</p>", Section::Articles, &section);
        assert_eq!(html, format!("<p>Chart</p>{section}"));
    }

    #[test]
    fn inject_replaces_existing_section() {
        let first = render_section(Section::Charts, &[RelatedLink::new("A", "u1")]);
        let html = inject_section("<p>x</p><hr>", Section::Charts, &first);
        let second = render_section(Section::Charts, &[RelatedLink::new("B", "u2")]);
        let html = inject_section(&html, Section::Charts, &second);
        assert_eq!(parse_section(&html, Section::Charts), vec![RelatedLink::new("B", "u2")]);
        assert_eq!(html.matches("Related Charts").count(), 1);
    }

    #[test]
    fn parse_reads_escaped_titles() {
        let section = render_section(Section::Charts, &[RelatedLink::new("Output & Losses", "https://h/a?x=1&y=2")]);
        let links = parse_section(&section, Section::Charts);
        assert_eq!(links, vec![RelatedLink::new("Output & Losses", "https://h/a?x=1&y=2")]);
    }

    #[test]
    fn merge_keeps_previous_order_and_dedupes_by_title() {
        let previous = vec![RelatedLink::new("A", "old-a"), RelatedLink::new("B", "b")];
        let incoming = vec![RelatedLink::new("C", "c"), RelatedLink::new("a", "new-a")];
        let merged = merge(&previous, &incoming);
        let titles: Vec<_> = merged.iter().map(|l| l.title.as_str()).collect();
        assert_eq!(titles, ["A", "B", "C"]);
        assert_eq!(merged[0].url, "new-a");
    }

    #[test]
    fn carry_sections_preserves_old_links() {
        let old = inject_section(
            "<p>v1</p><hr>",
            Section::Charts,
            &render_section(Section::Charts, &[RelatedLink::new("A", "ua")]),
        );
        let carried = carry_sections(&old, "<p>v2</p><hr>");
        assert!(carried.starts_with("<p>v2</p>"));
        assert_eq!(parse_section(&carried, Section::Charts).len(), 1);
    }

    #[test]
    fn request_push_ignores_repeated_titles() {
        let req = request(&[("A", "u1"), ("A", "u2"), ("B", "u3")]);
        assert_eq!(req.links.len(), 2);
    }

    #[tokio::test]
    async fn second_run_is_unchanged_and_skips_publisher() {
        let ledger = MemoryLedger::default().with(LedgerSheet::DataDictionary, field_record("<p>def</p><hr>"));
        let publisher = RecordingPublisher::default();
        let requests = vec![request(&[("Monthly Output", "u1"), ("Regional Split", "u2")])];

        let first = link_all(&ledger, &publisher, Mode::Create, &[], &requests).await;
        assert_eq!(first[0].status, ItemStatus::Success);
        let after_first = ledger.get(LedgerSheet::DataDictionary, "Capacity").expect("record").html;

        let second = link_all(&ledger, &publisher, Mode::Create, &[], &requests).await;
        assert_eq!(second[0].status, ItemStatus::Skipped);
        assert_eq!(second[0].reason.as_deref(), Some("unchanged"));

        let after_second = ledger.get(LedgerSheet::DataDictionary, "Capacity").expect("record").html;
        assert_eq!(after_first, after_second);
        assert_eq!(publisher.calls(), vec!["update:f1".to_string()]);
    }

    #[tokio::test]
    async fn preview_only_diffs() {
        let ledger = MemoryLedger::default().with(LedgerSheet::DataDictionary, field_record("<p>def</p><hr>"));
        let publisher = RecordingPublisher::default();
        let requests = vec![request(&[("Monthly Output", "u1")])];

        let outcomes = link_all(&ledger, &publisher, Mode::Preview, &[], &requests).await;
        let diff = outcomes[0].preview.as_ref().expect("diff");
        assert!(diff.changed);
        assert!(diff.new.contains("Monthly Output"));
        assert!(publisher.calls().is_empty());
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn unconfirmed_key_is_skipped() {
        let ledger = MemoryLedger::default().with(LedgerSheet::DataDictionary, field_record("<p>def</p><hr>"));
        let publisher = RecordingPublisher::default();
        let requests = vec![request(&[("Monthly Output", "u1")])];

        let outcomes =
            link_all(&ledger, &publisher, Mode::ConfirmSubset, &["Other".to_string()], &requests).await;
        assert_eq!(outcomes[0].reason.as_deref(), Some("not confirmed"));
        assert!(publisher.calls().is_empty());
    }

    #[tokio::test]
    async fn unknown_document_is_skipped() {
        let ledger = MemoryLedger::default();
        let publisher = RecordingPublisher::default();
        let outcomes = link_all(&ledger, &publisher, Mode::Create, &[], &[request(&[("A", "u")])]).await;
        assert_eq!(outcomes[0].reason.as_deref(), Some("not published"));
    }
}
