//! Markup reduction for CMS article bodies.
//!
//! Each pass is a function `&str -> String` applied in sequence. The output
//! is plain text where every section break is a divider marker and every
//! image is a chart anchor marker carrying its attributes.

use std::sync::LazyLock;

use regex::Regex;
use scraper::{Html, Selector};
use url::Url;

/// Text inserted for every `<hr>`.
pub(crate) const SECTION_DIVIDER: &str = "[[SECTION_DIVIDER]]";

/// Prefix of every image marker.
pub(crate) const ANCHOR_PREFIX: &str = "[[CHART_ANCHOR";

pub(crate) const UNKNOWN_VIEW: &str = "Unknown_View";
pub(crate) const UNKNOWN_TITLE: &str = "Unknown_Title";
pub(crate) const UNKNOWN_TABS: &str = "Unknown_Tabs";

/// Attributes carried by one image marker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Anchor {
    pub view_id: String,
    pub image_url: String,
    pub title: String,
    pub tabs: String,
}

impl Anchor {
    fn marker(&self) -> String {
        format!(
            "\n\n{ANCHOR_PREFIX}|{}|{}|{}|{}]]\n\n",
            self.view_id, self.image_url, self.title, self.tabs
        )
    }
}

/// Run every pass over raw article HTML.
pub(crate) fn run_pipeline(html: &str, base_url: Option<&Url>) -> String {
    let mut result = strip_scripts(html);
    result = strip_prompt_blocks(&result);
    result = mark_dividers(&result);
    result = anchor_images(&result, base_url);
    result = break_blocks(&result);
    result = strip_tags(&result);
    result = decode_entities(&result);
    collapse_whitespace(&result)
}

// ---------------------------------------------------------------------------
// Pass 1: Scripts and styles
// ---------------------------------------------------------------------------

fn strip_scripts(html: &str) -> String {
    static SCRIPT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<script\b.*?>.*?</script>").expect("valid regex")
    });
    static STYLE_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)<style\b.*?>.*?</style>").expect("valid regex")
    });

    let text = SCRIPT_RE.replace_all(html, "");
    STYLE_RE.replace_all(&text, "").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 2: Editorial prompt blocks
// ---------------------------------------------------------------------------

/// Authors leave generation prompts in the article body between these markers.
fn strip_prompt_blocks(html: &str) -> String {
    static PROMPT_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?is)GPT PROMPT.*?END GPT \(with replace\)").expect("valid regex")
    });

    PROMPT_RE.replace_all(html, "").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 3: Section dividers
// ---------------------------------------------------------------------------

fn mark_dividers(html: &str) -> String {
    static HR_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<hr\b[^>]*>").expect("valid regex"));

    HR_RE
        .replace_all(html, format!("\n\n{SECTION_DIVIDER}\n\n").as_str())
        .into_owned()
}

// ---------------------------------------------------------------------------
// Pass 4: Images to anchor markers
// ---------------------------------------------------------------------------

fn anchor_images(html: &str, base_url: Option<&Url>) -> String {
    static IMG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)<img\b[^>]*>").expect("valid regex"));

    IMG_RE
        .replace_all(html, |caps: &regex::Captures| {
            parse_image(&caps[0], base_url)
                .map(|anchor| anchor.marker())
                .unwrap_or_default()
        })
        .into_owned()
}

/// Read one `<img>` tag. Returns `None` for tags without a usable source.
pub(crate) fn parse_image(tag: &str, base_url: Option<&Url>) -> Option<Anchor> {
    let selector = Selector::parse("img").ok()?;
    let fragment = Html::parse_fragment(tag);
    let img = fragment.select(&selector).next()?;
    let attr = |name: &str, fallback: &str| {
        img.value()
            .attr(name)
            .map(sanitize)
            .filter(|v| !v.is_empty())
            .unwrap_or_else(|| fallback.to_string())
    };

    let src = img.value().attr("src")?.trim();
    if src.is_empty() || src.starts_with("data:") {
        return None;
    }

    Some(Anchor {
        view_id: attr("view", UNKNOWN_VIEW),
        image_url: sanitize(&resolve_url(src, base_url)),
        title: attr("title", UNKNOWN_TITLE),
        tabs: attr("tabs", UNKNOWN_TABS),
    })
}

fn resolve_url(src: &str, base_url: Option<&Url>) -> String {
    if src.starts_with("http://") || src.starts_with("https://") {
        return src.to_string();
    }
    match base_url.map(|base| base.join(src)) {
        Some(Ok(resolved)) => resolved.to_string(),
        _ => src.to_string(),
    }
}

/// Marker fields are `|`-delimited and end at `]]`.
fn sanitize(value: &str) -> String {
    value.trim().replace('|', "/").replace("]]", "] ]")
}

// ---------------------------------------------------------------------------
// Pass 5: Block elements to line breaks
// ---------------------------------------------------------------------------

fn break_blocks(html: &str) -> String {
    static OPEN_RE: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"(?i)<(?:div|p|br|h[1-6]|li)\b[^>]*>").expect("valid regex")
    });
    static CLOSE_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"(?i)</(?:div|p|h[1-6]|li)>").expect("valid regex"));

    let text = OPEN_RE.replace_all(html, "\n");
    CLOSE_RE.replace_all(&text, "\n").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 6: Remaining tags
// ---------------------------------------------------------------------------

fn strip_tags(html: &str) -> String {
    static TAG_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"<[^>]+>").expect("valid regex"));

    TAG_RE.replace_all(html, " ").into_owned()
}

// ---------------------------------------------------------------------------
// Pass 7: Entities
// ---------------------------------------------------------------------------

fn decode_entities(text: &str) -> String {
    text.replace("&nbsp;", " ")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&amp;", "&")
}

// ---------------------------------------------------------------------------
// Pass 8: Whitespace
// ---------------------------------------------------------------------------

/// Collapse runs of spaces/tabs and drop blank lines.
fn collapse_whitespace(text: &str) -> String {
    static SPACES_RE: LazyLock<Regex> =
        LazyLock::new(|| Regex::new(r"[ \t\u{a0}]+").expect("valid regex"));

    let text = SPACES_RE.replace_all(text, " ");
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join("\n")
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Url {
        Url::parse("https://cms.example.com/").expect("base url")
    }

    #[test]
    fn scripts_and_styles_are_removed() {
        let input = "<p>Keep</p><script type=\"text/javascript\">var x = 1;</script><style>\np { color: red }\n</style>";
        let result = strip_scripts(input);
        assert_eq!(result, "<p>Keep</p>");
    }

    #[test]
    fn prompt_blocks_are_removed_across_lines() {
        let input = "Intro\nGPT PROMPT: describe\nthe chart\nEND GPT (with replace)\nOutro";
        assert_eq!(strip_prompt_blocks(input), "Intro\n\nOutro");
    }

    #[test]
    fn hr_becomes_divider() {
        let result = mark_dividers("a<hr class=\"x\" />b<HR>c");
        assert_eq!(result.matches(SECTION_DIVIDER).count(), 2);
        assert!(!result.contains("<hr"));
    }

    #[test]
    fn image_attributes_are_captured() {
        let anchor = parse_image(
            r#"<img src="/images/charts/output.png" view="views/Solar/Monthly" title="Monthly Output" tabs="Monthly Output" alt="">"#,
            Some(&base()),
        )
        .expect("anchor");
        assert_eq!(anchor.view_id, "views/Solar/Monthly");
        assert_eq!(anchor.image_url, "https://cms.example.com/images/charts/output.png");
        assert_eq!(anchor.title, "Monthly Output");
        assert_eq!(anchor.tabs, "Monthly Output");
    }

    #[test]
    fn missing_attributes_use_placeholders() {
        let anchor = parse_image(r#"<img src="https://img.example.com/a.png">"#, None)
            .expect("anchor");
        assert_eq!(anchor.view_id, UNKNOWN_VIEW);
        assert_eq!(anchor.title, UNKNOWN_TITLE);
        assert_eq!(anchor.tabs, UNKNOWN_TABS);
        assert_eq!(anchor.image_url, "https://img.example.com/a.png");
    }

    #[test]
    fn data_uris_are_dropped() {
        let result = anchor_images(r#"before<img src="data:image/png;base64,AAAA">after"#, None);
        assert_eq!(result, "beforeafter");
    }

    #[test]
    fn pipe_in_title_does_not_break_marker() {
        let anchor = parse_image(r#"<img src="a.png" title="Output | 2024">"#, Some(&base()))
            .expect("anchor");
        assert_eq!(anchor.title, "Output / 2024");
    }

    #[test]
    fn full_pipeline_yields_lines_and_markers() {
        let input = "<h2>Title&nbsp;Here</h2><p>Intro &amp; more</p><hr><p><img src=\"x.png\" view=\"v1\"></p><p>This chart shows <b>growth</b>.</p>";
        let result = run_pipeline(input, Some(&base()));
        let lines: Vec<&str> = result.lines().collect();
        assert_eq!(lines[0], "Title Here");
        assert_eq!(lines[1], "Intro & more");
        assert_eq!(lines[2], SECTION_DIVIDER);
        assert_eq!(
            lines[3],
            "[[CHART_ANCHOR|v1|https://cms.example.com/x.png|Unknown_Title|Unknown_Tabs]]"
        );
        assert_eq!(lines[4], "This chart shows growth .");
    }
}
