//! Field dependency resolution.
//!
//! Builds the context tree for a field: calculated fields expand into the
//! fields their formula references, native fields carry whatever values the
//! workbook's filters reveal. The tree is rendered to indented text and used
//! as grounding for the field-analysis prompt.

use std::collections::{HashMap, HashSet};
use std::fmt::Write as _;
use std::sync::LazyLock;

use percent_encoding::percent_decode_str;
use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::document::{FieldMetadata, Workbook};
use crate::normalize::{norm_key, normalize, strip_qualifiers};

/// Deepest level expanded below the root.
pub const MAX_DEPTH: usize = 5;

/// Categorical values listed before truncating with `...`.
const MAX_CATEGORIES: usize = 15;

/// Member value Tableau uses for nulls.
const NULL_MEMBER: &str = "%null%";

static FIELD_REF_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[([^\[\]]+)\]").expect("valid regex"));

static WHITESPACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\s+").expect("valid regex"));

/// What a node in the context tree stands for.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NodeKind {
    Native { datatype: String },
    Calculated,
    /// Referenced but absent from the workbook.
    NotFound,
    /// Already being resolved higher up this path.
    Circular,
    /// Below [`MAX_DEPTH`].
    MaxDepth,
}

/// Values sampled for a native field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ValueSummary {
    /// Distinct filter members, sorted, truncated with `...`.
    Categories { values: Vec<String> },
    /// Bounds of a quantitative filter.
    Range { min: String, max: String },
    /// Numeric measure without any range filter.
    NoRange,
    /// Nothing found.
    NoValues,
}

/// A field and everything it depends on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldContextNode {
    pub name: String,
    #[serde(flatten)]
    pub kind: NodeKind,
    /// Formula with captions substituted for internal ids.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub children: Vec<FieldContextNode>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub values: Option<ValueSummary>,
}

impl FieldContextNode {
    fn leaf(name: &str, kind: NodeKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
            formula: None,
            children: Vec::new(),
            values: None,
        }
    }

    /// True when the subtree depends on the path it was resolved along.
    fn path_dependent(&self) -> bool {
        matches!(self.kind, NodeKind::Circular | NodeKind::MaxDepth)
            || self.children.iter().any(Self::path_dependent)
    }

    /// Indented text form, one `└─ ` step per level.
    pub fn render(&self) -> String {
        let mut out = String::new();
        self.render_into(&mut out, 0);
        out.trim_end().to_string()
    }

    fn render_into(&self, out: &mut String, depth: usize) {
        let indent = "  ".repeat(depth);
        let branch = if depth > 0 { "└─ " } else { "" };
        let head = format!("{indent}{branch}FIELD: [{}]", self.name);
        let detail = format!("{indent}   ");

        match &self.kind {
            NodeKind::NotFound => {
                let _ = writeln!(out, "{head} - Field not found in metadata");
            }
            NodeKind::Circular => {
                let _ = writeln!(out, "{head} (Recursive reference loop)");
            }
            NodeKind::MaxDepth => {
                let _ = writeln!(out, "{head} (Max depth reached)");
            }
            NodeKind::Calculated => {
                let _ = writeln!(out, "{head} (Calculation)");
                if let Some(formula) = &self.formula {
                    let _ = writeln!(out, "{detail}Formula: {formula}");
                }
            }
            NodeKind::Native { datatype } => {
                let _ = writeln!(out, "{head} (Native {datatype})");
            }
        }

        match &self.values {
            Some(ValueSummary::Categories { values }) => {
                let _ = writeln!(out, "{detail}Categories: {}", values.join(", "));
            }
            Some(ValueSummary::Range { min, max }) => {
                let _ = writeln!(out, "{detail}Filter Range Found: Min: {min}, Max: {max}");
            }
            Some(ValueSummary::NoRange) => {
                let _ = writeln!(
                    out,
                    "{detail}Values: (Numeric Measure - No hardcoded filter range found)"
                );
            }
            Some(ValueSummary::NoValues) => {
                let _ = writeln!(out, "{detail}Values: (No explicit filter values)");
            }
            None => {}
        }

        for child in &self.children {
            child.render_into(out, depth + 1);
        }
    }
}

/// Resolve `field_name` against `workbook` into a context tree.
#[instrument(skip_all, fields(field = %field_name))]
pub fn resolve_context(field_name: &str, workbook: &Workbook) -> FieldContextNode {
    let mut resolver = Resolver {
        workbook,
        memo: HashMap::new(),
    };
    let mut path = HashSet::new();
    let node = resolver.resolve(field_name, 0, &mut path);
    debug!(children = node.children.len(), "resolved field context");
    node
}

/// Bracketed identifiers in `formula`, first-referenced order, deduplicated.
pub fn formula_references(formula: &str) -> Vec<String> {
    let mut refs: Vec<String> = Vec::new();
    for cap in FIELD_REF_RE.captures_iter(formula) {
        let name = cap[1].trim().to_string();
        if !name.is_empty() && !refs.contains(&name) {
            refs.push(name);
        }
    }
    refs
}

struct Resolver<'a> {
    workbook: &'a Workbook,
    /// Path-independent subtrees by norm key.
    memo: HashMap<String, FieldContextNode>,
}

impl<'a> Resolver<'a> {
    fn resolve(&mut self, name: &str, depth: usize, path: &mut HashSet<String>) -> FieldContextNode {
        let key = norm_key(name);
        if path.contains(&key) {
            return FieldContextNode::leaf(name, NodeKind::Circular);
        }
        if depth > MAX_DEPTH {
            return FieldContextNode::leaf(name, NodeKind::MaxDepth);
        }
        if let Some(node) = self.memo.get(&key) {
            return node.clone();
        }

        let Some(field) = self.lookup(name) else {
            return FieldContextNode::leaf(name, NodeKind::NotFound);
        };

        let node = match &field.formula {
            Some(raw) => {
                let formula = self.translate_formula(raw);
                path.insert(key.clone());
                let children = formula_references(&formula)
                    .iter()
                    .map(|child| self.resolve(child, depth + 1, path))
                    .collect();
                path.remove(&key);
                FieldContextNode {
                    name: name.to_string(),
                    kind: NodeKind::Calculated,
                    formula: Some(formula),
                    children,
                    values: None,
                }
            }
            None => FieldContextNode {
                name: name.to_string(),
                kind: NodeKind::Native {
                    datatype: field.datatype.clone(),
                },
                formula: None,
                children: Vec::new(),
                values: Some(self.sample_values(field, name)),
            },
        };

        if !node.path_dependent() {
            self.memo.insert(key, node.clone());
        }
        node
    }

    fn lookup(&self, name: &str) -> Option<&'a FieldMetadata> {
        self.workbook
            .field(name)
            .or_else(|| self.workbook.field_by_id(name))
            .or_else(|| self.workbook.field(&normalize(name)))
    }

    fn translate_formula(&self, raw: &str) -> String {
        let translated = self.workbook.translate_ids(raw);
        let stripped = strip_qualifiers(&translated);
        WHITESPACE_RE.replace_all(stripped.trim(), " ").into_owned()
    }

    fn sample_values(&self, field: &FieldMetadata, name: &str) -> ValueSummary {
        let needles: Vec<String> = [name, field.name.as_str(), field.id.trim_matches(['[', ']'])]
            .iter()
            .filter(|s| !s.is_empty())
            .map(|s| s.to_lowercase())
            .collect();
        let mentions = |text: &str| {
            let text = text.to_lowercase();
            needles.iter().any(|n| text.contains(n.as_str()))
        };

        let mut categories: Vec<String> = self
            .workbook
            .members
            .iter()
            .filter(|m| mentions(&m.level))
            .filter_map(|m| clean_member(&m.member))
            .collect();
        categories.sort();
        categories.dedup();

        if !categories.is_empty() {
            if categories.len() > MAX_CATEGORIES {
                categories.truncate(MAX_CATEGORIES);
                categories.push("...".to_string());
            }
            return ValueSummary::Categories { values: categories };
        }

        if field.is_numeric_measure() {
            return self
                .workbook
                .range_filters
                .iter()
                .find(|f| (f.min.is_some() || f.max.is_some()) && mentions(&f.column))
                .map(|f| ValueSummary::Range {
                    min: f.min.clone().unwrap_or_else(|| "-Inf".to_string()),
                    max: f.max.clone().unwrap_or_else(|| "Inf".to_string()),
                })
                .unwrap_or(ValueSummary::NoRange);
        }

        ValueSummary::NoValues
    }
}

fn clean_member(raw: &str) -> Option<String> {
    if raw.trim() == NULL_MEMBER {
        return None;
    }
    let unquoted = raw.trim().trim_matches('"');
    let decoded = percent_decode_str(unquoted).decode_utf8_lossy().trim().to_string();
    (!decoded.is_empty()).then_some(decoded)
}
