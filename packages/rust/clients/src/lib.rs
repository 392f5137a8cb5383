//! HTTP clients for the services chartdoc talks to.
//!
//! Each upstream sits behind a small `async-trait` interface so the
//! orchestrator can be driven by in-memory fakes in tests:
//! - [`ArticleSource`]: CMS article bodies
//! - [`WorkbookSource`]: Tableau view search and workbook download
//! - [`LanguageModel`]: chat completions
//! - [`Publisher`]: help-center documents

mod cms;
mod helpcenter;
mod http;
mod llm;
mod tableau;

pub use cms::{ArticleSource, CmsClient, SourceArticle};
pub use helpcenter::{IntercomClient, NewDocument, PublishedDocument, Publisher};
pub use llm::{CompletionRequest, LanguageModel, OpenAiClient, strip_code_fences};
pub use tableau::{TableauClient, TableauSession, WorkbookSource};
