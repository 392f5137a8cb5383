//! Field-name normalization.
//!
//! The single place where raw Tableau identifiers become canonical names.
//! Every caller that compares field names goes through [`normalize`],
//! [`canonical_parts`], or [`norm_key`].

use std::sync::LazyLock;

use regex::Regex;

/// Aggregation and date-bucket prefixes Tableau writes before a colon.
///
/// Matched case-insensitively. Lowercase prefixes outside this list are
/// stripped generically as well; the list exists for upper/mixed-case
/// variants such as `SUM:`.
pub const AGGREGATION_PREFIXES: &[&str] = &[
    "sum", "none", "avg", "min", "max", "attr", "usr", "tmn", "pcto", "win", "med", "pcdf", "mn",
    "yr", "qr", "wk", "dy", "tyr", "tqr", "twk", "tdy", "cnt", "cntd", "ctd",
];

/// `[federated.123abc].` style datasource qualifiers.
static NAMESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[[^\]]+\.[^\]]+\]\.").expect("valid regex"));

/// Known prefixes, any case, possibly stacked (`sum:usr:`).
static KNOWN_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    let alternation = AGGREGATION_PREFIXES.join("|");
    Regex::new(&format!(r"(?i)\b(?:(?:{alternation}):)+")).expect("valid regex")
});

/// Any lowercase word + colon at the start of a token.
static GENERIC_PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(^|[\s\[("',*/])(?:[a-z]+:)+"#).expect("valid regex")
});

/// Type/role suffixes: `:qk`, `:nk`, `:ok`.
static ROLE_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i):(?:qk|nk|ok)\b").expect("valid regex"));

/// Numeric instance suffixes: `:1`, `:2`.
static NUMERIC_SUFFIX_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r":[0-9]+").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// Normalize a raw identifier or shelf expression into canonical names.
///
/// Composite expressions (`A * B`, `A / B`) decompose into their parts,
/// which are deduplicated and joined with `", "`.
pub fn normalize(raw: &str) -> String {
    canonical_parts(raw).join(", ")
}

/// Same as [`normalize`] but returns the individual names.
pub fn canonical_parts(raw: &str) -> Vec<String> {
    let text = strip_decorations(raw);

    let mut parts: Vec<String> = Vec::new();
    for piece in text.split(['*', '/']) {
        let piece = WHITESPACE_RE.replace_all(piece.trim(), " ").into_owned();
        if !piece.is_empty() && !parts.contains(&piece) {
            parts.push(piece);
        }
    }
    parts
}

/// Remove `[datasource.id].` qualifiers, leaving the bracketed field after them.
pub fn strip_qualifiers(text: &str) -> String {
    NAMESPACE_RE.replace_all(text, "").into_owned()
}

/// Comparison key: lowercase, no spaces, no hyphens, no brackets.
pub fn norm_key(name: &str) -> String {
    name.chars()
        .filter(|c| !matches!(c, ' ' | '-' | '[' | ']'))
        .flat_map(char::to_lowercase)
        .collect()
}

/// Apply [`strip_once`] until nothing changes, so removing a wrapper can
/// never expose a prefix that a second call would strip.
fn strip_decorations(raw: &str) -> String {
    let mut text = raw.trim().to_string();
    for _ in 0..8 {
        let next = strip_once(&text);
        if next == text {
            break;
        }
        text = next;
    }
    text
}

fn strip_once(raw: &str) -> String {
    let text = NAMESPACE_RE.replace_all(raw, "");
    let text = GENERIC_PREFIX_RE.replace_all(&text, "$1");
    let text = KNOWN_PREFIX_RE.replace_all(&text, "");
    let text = ROLE_SUFFIX_RE.replace_all(&text, "");
    let text = NUMERIC_SUFFIX_RE.replace_all(&text, "");

    text.chars()
        .filter(|c| !matches!(c, '[' | ']' | '"' | '(' | ')'))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_namespace_prefix_and_suffix() {
        assert_eq!(
            normalize("[federated.0x1abc].[sum:Capacity (kW):qk]"),
            "Capacity kW"
        );
        assert_eq!(normalize("[none:State:nk]"), "State");
        assert_eq!(normalize("tmn:Date First Seen:ok"), "Date First Seen");
    }

    #[test]
    fn decomposes_composite_shelves() {
        assert_eq!(
            normalize("([federated.a].[usr:INDEX:qk] * [federated.a].[sum:Capacity:qk])"),
            "INDEX, Capacity"
        );
        assert_eq!(normalize("Region / State / Region"), "Region, State");
        assert_eq!(canonical_parts("A * B"), vec!["A", "B"]);
    }

    #[test]
    fn unknown_lowercase_prefixes_are_stripped_generically() {
        assert_eq!(normalize("xyz:Installer"), "Installer");
        assert_eq!(normalize("[pcto:twk:Share:1]"), "Share");
    }

    #[test]
    fn known_prefixes_any_case() {
        assert_eq!(normalize("SUM:Capacity"), "Capacity");
        assert_eq!(normalize("Attr:Brand"), "Brand");
    }

    #[test]
    fn idempotent() {
        let samples = [
            "[federated.0x1].[sum:sum:Capacity:qk]",
            "\"usr:Rank\"",
            "INDEX * Capacity",
            "  Date   First Seen ",
            "[Calculation_123:1]",
            "",
            "Segment, State",
            "(yr:Date:ok) / [none:Brand:nk]",
            "[a]b:c",
        ];
        for raw in samples {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn every_known_prefix_is_removed() {
        for prefix in AGGREGATION_PREFIXES {
            for name in ["Capacity", "[Date First Seen]", "Brand Share"] {
                assert_eq!(
                    normalize(&format!("{prefix}:{name}")),
                    normalize(name),
                    "prefix {prefix} on {name}"
                );
                let upper = prefix.to_uppercase();
                assert_eq!(normalize(&format!("{upper}:{name}")), normalize(name));
            }
        }
    }

    #[test]
    fn qualifiers_are_removed_from_formulas() {
        assert_eq!(
            strip_qualifiers("SUM([federated.0a].[kW]) + [Parameters].[Rate]"),
            "SUM([kW]) + [Parameters].[Rate]"
        );
    }

    #[test]
    fn norm_key_ignores_spacing_case_and_hyphens() {
        assert_eq!(norm_key("PV kW-DC Segment"), "pvkwdcsegment");
        assert_eq!(norm_key("[Capacity]"), norm_key("capacity"));
    }
}
