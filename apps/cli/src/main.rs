//! chartdoc CLI: document BI charts embedded in CMS articles.
//!
//! Pulls articles, reads the Tableau workbooks behind their charts, asks a
//! language model to explain each chart and field, and publishes the result
//! to the help center.

mod commands;
mod server;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
