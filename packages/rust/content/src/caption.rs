//! Chart description cleanup.
//!
//! The text after a chart image mixes the author's description with
//! navigation crumbs, licence boilerplate and follow-on headings. The
//! description starts at the first lead-in phrase and stops at the first
//! boilerplate heading.

/// Returned when nothing usable is left.
pub const NO_DESCRIPTION: &str = "No description provided.";

/// Shortest description kept.
const MIN_LEN: usize = 5;

/// Lines containing any of these are dropped outright.
const JUNK_LINES: &[&str] = &[
    "Key Insights",
    "Recommendations",
    "Customers Stopped",
    "|",
    "---",
    "Dec 2024",
    "Jan 2025",
];

/// Phrases that open a real description (matched case-insensitively).
const LEAD_INS: &[&str] = &[
    "This chart shows",
    "This graph shows",
    "The chart displays",
    "This visual highlights",
    "Here we see",
    "The data indicates",
    "Th is chart shows",
    "This map shows",
];

/// Headings after which everything is boilerplate (matched case-insensitively).
const CUTOFFS: &[&str] = &[
    "SunWiz License Terms",
    "Ownership Rights",
    "Quick Summary",
    "You MAY:",
    "Copyright",
    "Disclaimer",
    "Commentary by AI",
    "Interpreting this data",
    "Applying this data",
    "Key Insights",
    "Analysis:",
    "Recommendations:",
    "Next Steps:",
];

/// Clean the raw text that follows a chart marker.
pub fn clean_caption(raw: &str) -> String {
    let kept: Vec<&str> = raw
        .lines()
        .map(|line| {
            let line = line.trim();
            if line.starts_with('>') || line.starts_with("->") {
                line.trim_start_matches(['-', '>']).trim()
            } else {
                line
            }
        })
        .filter(|line| !line.is_empty())
        .filter(|line| !JUNK_LINES.iter().any(|junk| line.contains(junk)))
        .collect();
    let block = kept.join("\n");

    let start = earliest(&block, LEAD_INS).unwrap_or(0);
    let block = &block[start..];
    let end = earliest(block, CUTOFFS).unwrap_or(block.len());

    let text = block[..end].split_whitespace().collect::<Vec<_>>().join(" ");
    if text.chars().count() < MIN_LEN {
        NO_DESCRIPTION.to_string()
    } else {
        text
    }
}

/// Byte offset of the first occurrence of any needle, ignoring ASCII case.
fn earliest(haystack: &str, needles: &[&str]) -> Option<usize> {
    let lower = haystack.to_ascii_lowercase();
    needles
        .iter()
        .filter_map(|needle| lower.find(&needle.to_ascii_lowercase()))
        .min()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_lead_in_phrase() {
        let raw = "Source: internal\nThis chart shows monthly installs\nacross all states.";
        assert_eq!(
            clean_caption(raw),
            "This chart shows monthly installs across all states."
        );
    }

    #[test]
    fn lead_in_match_ignores_case() {
        assert_eq!(
            clean_caption("intro text. HERE WE SEE a spike in March"),
            "HERE WE SEE a spike in March"
        );
    }

    #[test]
    fn stops_at_boilerplate() {
        let raw = "This chart shows output growth.\nCopyright 2025 Example\nmore legal text";
        assert_eq!(clean_caption(raw), "This chart shows output growth.");
    }

    #[test]
    fn drops_junk_lines_and_quote_markers() {
        let raw = "-> This chart shows exports\n| Col | Col |\nDec 2024 figures\n> by region";
        assert_eq!(clean_caption(raw), "This chart shows exports by region");
    }

    #[test]
    fn short_or_empty_gets_default() {
        assert_eq!(clean_caption(""), NO_DESCRIPTION);
        assert_eq!(clean_caption("Hi"), NO_DESCRIPTION);
        assert_eq!(clean_caption("Key Insights\nCopyright"), NO_DESCRIPTION);
    }

    #[test]
    fn without_lead_in_keeps_whole_text() {
        assert_eq!(
            clean_caption("Battery attach rates by quarter."),
            "Battery attach rates by quarter."
        );
    }
}
