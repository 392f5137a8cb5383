//! Old-vs-new content diffs for preview runs.

use similar::TextDiff;

use chartdoc_shared::ContentDiff;

/// One tag per line so diffs of single-line HTML stay readable.
fn html_lines(html: &str) -> String {
    let mut out = html.replace("><", ">\n<");
    if !out.ends_with('\n') {
        out.push('\n');
    }
    out
}

/// Diff cached content (`None` when the item would be created) against a
/// fresh rendering.
pub fn content_diff(old: Option<&str>, new: &str) -> ContentDiff {
    let old_lines = old.map(html_lines).unwrap_or_default();
    let new_lines = html_lines(new);
    let changed = old != Some(new);

    let unified = if changed {
        TextDiff::from_lines(&old_lines, &new_lines)
            .unified_diff()
            .context_radius(2)
            .header("cached", "rendered")
            .to_string()
    } else {
        String::new()
    };

    ContentDiff {
        old: old.map(str::to_string),
        new: new.to_string(),
        changed,
        unified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_content_is_unchanged() {
        let diff = content_diff(Some("<p>a</p><hr>"), "<p>a</p><hr>");
        assert!(!diff.changed);
        assert!(diff.unified.is_empty());
    }

    #[test]
    fn changed_line_appears_in_unified_diff() {
        let diff = content_diff(Some("<p>a</p><p>b</p>"), "<p>a</p><p>c</p>");
        assert!(diff.changed);
        assert!(diff.unified.contains("--- cached"));
        assert!(diff.unified.contains("-<p>b</p>"));
        assert!(diff.unified.contains("+<p>c</p>"));
    }

    #[test]
    fn new_item_diffs_against_nothing() {
        let diff = content_diff(None, "<p>new</p>");
        assert!(diff.changed);
        assert!(diff.old.is_none());
        assert!(diff.unified.contains("+<p>new</p>"));
    }
}
