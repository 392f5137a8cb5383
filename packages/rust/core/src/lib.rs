//! Core pipeline orchestration and domain logic for chartdoc.
//!
//! This crate ties together article extraction, workbook analysis, the
//! language model, and the help center into one batch run (see
//! [`Orchestrator::run_batch`]).

pub mod analysis;
pub mod formatter;
pub mod linker;
pub mod orchestrator;
pub mod preview;

#[cfg(test)]
pub(crate) mod testing;

pub use analysis::{CachedModel, ChartAnswer, ChartFields, FieldAnalysis, prompt_hash};
pub use orchestrator::{BatchProgress, Orchestrator, Services, Settings, SilentProgress};
