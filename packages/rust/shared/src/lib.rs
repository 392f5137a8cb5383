//! Shared types, error model, and configuration for chartdoc.
//!
//! Every other chartdoc crate depends on this one. It provides:
//! - [`ChartDocError`], the unified error type
//! - Domain types ([`ChartDescriptor`], [`PublishedRecord`], [`ItemOutcome`], [`BatchReport`])
//! - Configuration ([`AppConfig`] and config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, CmsConfig, CollectionsConfig, DefaultsConfig, HelpCenterConfig, LedgerBackend,
    LedgerConfig, LlmConfig, ServerConfig, TableauConfig, config_dir, config_file_path,
    expand_home, init_config, load_config, load_config_from, resolve_secret, validate_secrets,
};
pub use error::{ChartDocError, Result};
pub use types::{
    ArticleReport, BatchReport, BatchRequest, ChartDescriptor, ChartReport, ChartStage,
    ContentDiff, FieldStage, ItemOutcome, ItemStatus, LedgerSheet, LinkReport, Mode,
    PageMetadata, PublishedRecord, RunId, Totals,
};
