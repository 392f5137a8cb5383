//! Tableau workbook handling for chartdoc.
//!
//! Parses `.twb`/`.twbx` documents, summarizes views for the chart-analysis
//! prompt, and resolves calculated fields into dependency trees.

pub mod document;
pub mod extract;
pub mod normalize;
pub mod resolve;

pub use document::{FieldMetadata, FieldRole, Workbook, unpack};
pub use extract::{SheetSummary, ViewSummary, extract, summarize_view};
pub use normalize::{AGGREGATION_PREFIXES, canonical_parts, norm_key, normalize};
pub use resolve::{FieldContextNode, NodeKind, ValueSummary, resolve_context};
