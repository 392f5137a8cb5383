//! Help-center HTML for data fields, charts, and article summary pages.

use std::collections::HashMap;

use chartdoc_workbook::{canonical_parts, norm_key};

use crate::analysis::{ChartFields, FieldAnalysis};

/// Empty paragraph the help center renders as vertical space.
pub const SPACER: &str = "<p>&nbsp;</p>";

/// Units and acronyms with a fixed spelling in titles.
const SPECIAL_CASES: &[(&str, &str)] = &[
    ("pv", "PV"),
    ("ess", "ESS"),
    ("kw", "kW"),
    ("kwh", "kWh"),
    ("mw", "MW"),
    ("gw", "GW"),
    ("dc", "DC"),
    ("ac", "AC"),
    ("bess", "BESS"),
    ("ev", "EV"),
    ("roi", "ROI"),
    ("yoy", "YoY"),
    ("qoq", "QoQ"),
    ("lcoe", "LCOE"),
];

const SMALL_WORDS: &[&str] = &[
    "a", "an", "the", "and", "but", "or", "nor", "at", "by", "for", "from", "in", "into", "of",
    "off", "on", "onto", "out", "over", "up", "with", "to", "as", "per",
];

pub fn escape_html(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            _ => out.push(c),
        }
    }
    out
}

pub fn unescape_html(text: &str) -> String {
    text.replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&amp;", "&")
}

/// Title case that keeps unit spellings and lowercases small words after the first.
pub fn smart_title(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut word = String::new();
    let mut first_word_done = false;

    let mut flush = |word: &mut String, out: &mut String| {
        if word.is_empty() {
            return;
        }
        let lower = word.to_lowercase();
        if let Some((_, fixed)) = SPECIAL_CASES.iter().find(|(k, _)| *k == lower) {
            out.push_str(fixed);
        } else if first_word_done && SMALL_WORDS.contains(&lower.as_str()) {
            out.push_str(&lower);
        } else {
            let mut chars = lower.chars();
            if let Some(first) = chars.next() {
                out.extend(first.to_uppercase());
                out.push_str(chars.as_str());
            }
        }
        first_word_done = true;
        word.clear();
    };

    for c in text.chars() {
        if c.is_whitespace() || c == '-' || c == '/' {
            flush(&mut word, &mut out);
            out.push(c);
        } else {
            word.push(c);
        }
    }
    flush(&mut word, &mut out);
    out
}

fn is_none(text: &str) -> bool {
    let text = text.trim();
    text.is_empty() || text.eq_ignore_ascii_case("none")
}

// ---------------------------------------------------------------------------
// Data field
// ---------------------------------------------------------------------------

pub fn field_html(term: &str, analysis: &FieldAnalysis) -> String {
    let mut parts = vec![
        format!("<p><strong>Term:</strong> {}</p>", escape_html(term)),
        SPACER.to_string(),
        "<p><strong>Definition:</strong></p>".to_string(),
        format!("<p>{}</p>", escape_html(&analysis.definition)),
        SPACER.to_string(),
        "<p><strong>Calculation:</strong></p>".to_string(),
        format!("<p>{}</p>", escape_html(&analysis.calculation_explanation)),
    ];

    let formula = analysis.pseudo_formula.trim();
    if !is_none(formula) && formula != term {
        parts.push(SPACER.to_string());
        parts.push(format!("<p><em>{}</em></p>", escape_html(formula)));
    }
    parts.push(SPACER.to_string());

    if !is_none(&analysis.considerations) {
        parts.push("<p><strong>Considerations:</strong></p>".to_string());
        parts.push(format!("<p>{}</p>", escape_html(&analysis.considerations)));
        parts.push(SPACER.to_string());
    }

    parts.push("<hr>".to_string());
    parts.concat()
}

// ---------------------------------------------------------------------------
// Chart
// ---------------------------------------------------------------------------

/// Display name and page URL of a documented field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldLink {
    pub name: String,
    pub url: Option<String>,
}

/// Field links keyed by [`norm_key`] of the canonical name.
pub type FieldLinks = HashMap<String, FieldLink>;

pub struct ChartPage<'a> {
    pub title: &'a str,
    pub image_url: &'a str,
    pub category: &'a str,
    pub availability: &'a str,
    pub shows: &'a str,
    /// Text for the sections that have no generated content yet.
    pub placeholder: &'a str,
    pub layout: &'a ChartFields,
    pub links: &'a FieldLinks,
}

fn linked_names(items: &[String], links: &FieldLinks) -> String {
    let mut out: Vec<String> = Vec::new();
    for item in items {
        for name in canonical_parts(item) {
            let rendered = match links.get(&norm_key(&name)) {
                Some(FieldLink {
                    name: display,
                    url: Some(url),
                }) => format!(
                    "<a href=\"{}\">{}</a>",
                    escape_html(url),
                    escape_html(display)
                ),
                Some(FieldLink { name: display, .. }) => escape_html(display),
                None => escape_html(&name),
            };
            if !out.contains(&rendered) {
                out.push(rendered);
            }
        }
    }
    out.join(", ")
}

pub fn chart_html(page: &ChartPage<'_>) -> String {
    let title = escape_html(page.title);
    let layout = page.layout;
    let mut parts = vec![
        format!("<p><span style=\"font-size: 24px;\"><strong>{title}</strong></span></p>"),
        SPACER.to_string(),
    ];

    if !page.image_url.is_empty() {
        parts.push("<p><strong>Chart Image:</strong></p>".to_string());
        parts.push(format!(
            "<p><img src=\"{}\" alt=\"{title}\" style=\"max-width: 100%; height: auto; border: 1px solid #e0e0e0; border-radius: 4px;\"></p>",
            escape_html(page.image_url)
        ));
        parts.push(SPACER.to_string());
    }

    for (label, value) in [
        ("Category", page.category),
        ("Availability", page.availability),
    ] {
        parts.push(format!("<p><strong>{label}:</strong> {}</p>", escape_html(value)));
        parts.push(SPACER.to_string());
    }

    for (label, value) in [
        ("Shows", page.shows),
        ("Best used for", page.placeholder),
        ("Considerations", page.placeholder),
    ] {
        parts.push(format!("<p><strong>{label}:</strong></p>"));
        parts.push(format!("<p>{}</p>", escape_html(value)));
        parts.push(SPACER.to_string());
    }

    parts.push("<p><strong>Axes:</strong></p>".to_string());
    parts.push(format!(
        "<ul><li><strong>Vertical:</strong> {}</li><li><strong>Horizontal:</strong> {}</li></ul>",
        linked_names(&layout.vertical, page.links),
        linked_names(&layout.horizontal, page.links)
    ));
    parts.push(SPACER.to_string());

    parts.push(format!(
        "<p><strong>Dimensions:</strong> {}</p>",
        linked_names(&layout.dimensions, page.links)
    ));
    parts.push(SPACER.to_string());
    parts.push(format!(
        "<p><strong>Measures:</strong> {}</p>",
        linked_names(&layout.measures, page.links)
    ));
    parts.push(SPACER.to_string());

    if !layout.unclassified.is_empty() {
        parts.push(format!(
            "<p><strong>Fields:</strong> {}</p>",
            linked_names(&layout.unclassified, page.links)
        ));
        parts.push(SPACER.to_string());
    }

    parts.concat()
}

// ---------------------------------------------------------------------------
// Article summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SummaryChart {
    pub title: String,
    pub image_url: String,
    pub shows: String,
    pub url: Option<String>,
}

pub fn summary_html(category: &str, technology: &str, charts: &[SummaryChart]) -> String {
    let mut parts = Vec::new();
    for (label, value) in [("Category", category), ("Technology", technology)] {
        if !value.trim().is_empty() {
            parts.push(format!("<p><strong>{label}:</strong> {}</p>", escape_html(value)));
            parts.push(SPACER.to_string());
        }
    }

    for chart in charts {
        let title = escape_html(&chart.title);
        if !title.is_empty() {
            match &chart.url {
                Some(url) => parts.push(format!(
                    "<p><strong><a href=\"{}\">{title}</a></strong></p>",
                    escape_html(url)
                )),
                None => parts.push(format!("<p><strong>{title}</strong></p>")),
            }
            parts.push(SPACER.to_string());
        }
        if !chart.image_url.is_empty() {
            parts.push(format!(
                "<p><img src=\"{}\" alt=\"{title}\" style=\"max-width: 100%; height: auto;\"></p>",
                escape_html(&chart.image_url)
            ));
            parts.push(SPACER.to_string());
        }
        parts.push("<p><strong>Shows:</strong></p>".to_string());
        parts.push(format!("<p>{}</p>", escape_html(&chart.shows)));
        parts.push(SPACER.repeat(2));
    }
    parts.concat()
}
