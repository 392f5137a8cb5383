//! CLI command definitions, routing, and tracing setup.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use color_eyre::eyre::{Result, eyre};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;

use chartdoc_clients::{CmsClient, IntercomClient, LanguageModel, OpenAiClient, Publisher, TableauClient};
use chartdoc_core::{BatchProgress, CachedModel, Orchestrator, Services, Settings};
use chartdoc_shared::{
    AppConfig, BatchReport, BatchRequest, ItemOutcome, ItemStatus, LedgerBackend, LedgerSheet,
    Mode, expand_home, init_config, load_config, validate_secrets,
};
use chartdoc_storage::{Ledger, SheetsLedger, Storage};

// ---------------------------------------------------------------------------
// CLI structure
// ---------------------------------------------------------------------------

/// chartdoc: publish help-center documentation for BI charts.
#[derive(Parser)]
#[command(
    name = "chartdoc",
    version,
    about = "Document the Tableau charts embedded in CMS articles and publish them to the help center.",
    long_about = None,
)]
pub(crate) struct Cli {
    /// Log format: text (default) or json.
    #[arg(long, default_value = "text", global = true)]
    pub log_format: LogFormat,

    /// Verbosity level (-v, -vv).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

/// Log output format.
#[derive(Clone, Debug, clap::ValueEnum)]
pub(crate) enum LogFormat {
    Text,
    Json,
}

/// Top-level CLI subcommands.
#[derive(Subcommand)]
pub(crate) enum Command {
    /// Process a batch of CMS articles.
    Run {
        /// CMS article IDs, processed in order.
        #[arg(required = true)]
        article_ids: Vec<String>,

        /// create, preview, apply, or confirm-subset (defaults to config).
        #[arg(short, long)]
        mode: Option<String>,

        /// Keys approved for confirm-subset (repeatable).
        #[arg(long)]
        confirm: Vec<String>,

        /// Print the full report as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Serve the webhook trigger over HTTP.
    Serve {
        /// Bind address (defaults to config).
        #[arg(long)]
        host: Option<String>,

        /// Port (defaults to config).
        #[arg(long)]
        port: Option<u16>,
    },

    /// Summarize a view and resolve a field from a local workbook file.
    Inspect {
        /// Path to a .twb or .twbx file.
        path: PathBuf,

        /// View (worksheet or dashboard) name.
        #[arg(long)]
        view: String,

        /// Field to resolve into a context tree.
        #[arg(long)]
        field: Option<String>,
    },

    /// Delete a published document and its ledger row.
    Unpublish {
        /// Ledger sheet: data_dictionary, chart_library, or article_library.
        #[arg(long)]
        sheet: String,

        /// Ledger key (canonical field name, view id, or article id).
        #[arg(long)]
        key: String,

        /// Actually delete; without it only the target is shown.
        #[arg(long)]
        yes: bool,
    },

    /// List recent batch runs.
    History {
        /// Number of runs to show.
        #[arg(short, long, default_value = "10")]
        limit: u32,

        /// Print the stored reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Language-model answer cache.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Configuration management.
    Config {
        /// Config subcommand.
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
pub(crate) enum CacheAction {
    /// Drop every cached answer.
    Clear,
}

/// Config subcommands.
#[derive(Subcommand)]
pub(crate) enum ConfigAction {
    /// Initialize config file with defaults.
    Init,
    /// Show resolved configuration.
    Show,
}

// ---------------------------------------------------------------------------
// Tracing setup
// ---------------------------------------------------------------------------

/// Initialize tracing based on CLI flags.
pub(crate) fn init_tracing(cli: &Cli) {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = match cli.verbose {
        0 => "chartdoc=info",
        1 => "chartdoc=debug",
        _ => "chartdoc=trace",
    };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(filter));

    match cli.log_format {
        LogFormat::Text => {
            fmt()
                .with_env_filter(env_filter)
                .with_target(false)
                .with_writer(std::io::stderr)
                .init();
        }
        LogFormat::Json => {
            fmt()
                .json()
                .with_env_filter(env_filter)
                .with_writer(std::io::stderr)
                .init();
        }
    }
}

// ---------------------------------------------------------------------------
// Command dispatch
// ---------------------------------------------------------------------------

/// Run the CLI command.
pub(crate) async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::Run {
            article_ids,
            mode,
            confirm,
            json,
        } => cmd_run(article_ids, mode.as_deref(), confirm, json).await,
        Command::Serve { host, port } => cmd_serve(host, port).await,
        Command::Inspect { path, view, field } => cmd_inspect(&path, &view, field.as_deref()),
        Command::Unpublish { sheet, key, yes } => cmd_unpublish(&sheet, &key, yes).await,
        Command::History { limit, json } => cmd_history(limit, json).await,
        Command::Cache { action } => match action {
            CacheAction::Clear => cmd_cache_clear().await,
        },
        Command::Config { action } => match action {
            ConfigAction::Init => cmd_config_init(),
            ConfigAction::Show => cmd_config_show(),
        },
    }
}

// ---------------------------------------------------------------------------
// Setup
// ---------------------------------------------------------------------------

async fn open_storage(config: &AppConfig) -> Result<Arc<Storage>> {
    let path = expand_home(&config.ledger.db_path);
    Ok(Arc::new(Storage::open(&path).await?))
}

fn open_ledger(config: &AppConfig, storage: &Arc<Storage>) -> Result<Arc<dyn Ledger>> {
    let ledger: Arc<dyn Ledger> = match config.ledger.backend {
        LedgerBackend::Sheets => Arc::new(SheetsLedger::new(&config.ledger)?),
        LedgerBackend::Local => storage.clone(),
    };
    Ok(ledger)
}

/// Validate secrets, sign in to Tableau, and wire every client.
///
/// Any failure here aborts the run before a single item is attempted.
pub(crate) async fn build_orchestrator(config: &AppConfig) -> Result<Orchestrator> {
    validate_secrets(config)?;

    let storage = open_storage(config).await?;
    let session = TableauClient::new(&config.tableau)?.sign_in().await?;

    let llm: Arc<dyn LanguageModel> = Arc::new(OpenAiClient::new(&config.llm)?);
    let cache = config.llm.cache.then(|| storage.clone());

    let services = Services {
        articles: Arc::new(CmsClient::new(&config.cms)?),
        workbooks: Arc::new(session),
        model: Arc::new(CachedModel::new(llm, cache)),
        publisher: Arc::new(IntercomClient::new(&config.help_center)?),
        ledger: open_ledger(config, &storage)?,
    };

    Ok(Orchestrator::new(services, Settings::from_config(config)).with_history(storage))
}

fn parse_mode(mode: &str) -> Result<Mode> {
    mode.parse::<Mode>().map_err(|e| eyre!(e))
}

// ---------------------------------------------------------------------------
// run
// ---------------------------------------------------------------------------

async fn cmd_run(
    article_ids: Vec<String>,
    mode: Option<&str>,
    confirm: Vec<String>,
    json: bool,
) -> Result<()> {
    let config = load_config()?;
    let mode = parse_mode(mode.unwrap_or(&config.defaults.mode))?;
    if mode != Mode::ConfirmSubset && !confirm.is_empty() {
        return Err(eyre!("--confirm only applies to --mode confirm-subset"));
    }

    let request = BatchRequest {
        article_ids,
        mode,
        confirm,
    };
    info!(mode = %request.mode, articles = request.article_ids.len(), "starting batch");

    let orchestrator = build_orchestrator(&config).await?;
    let reporter = CliProgress::new();
    let report = orchestrator.run_batch(&request, &reporter).await;

    if json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// CLI progress reporter
// ---------------------------------------------------------------------------

/// CLI progress reporter using an indicatif spinner.
struct CliProgress {
    spinner: ProgressBar,
}

impl CliProgress {
    fn new() -> Self {
        let spinner = ProgressBar::new_spinner();
        let style = ProgressStyle::with_template("{spinner:.cyan} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner())
            .tick_strings(&["⠋", "⠙", "⠹", "⠸", "⠼", "⠴", "⠦", "⠧", "⠇", "⠏"]);
        spinner.set_style(style);
        spinner.enable_steady_tick(std::time::Duration::from_millis(80));
        Self { spinner }
    }
}

impl BatchProgress for CliProgress {
    fn article_started(&self, article_id: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Article [{current}/{total}] {article_id}"));
    }

    fn chart_started(&self, title: &str, current: usize, total: usize) {
        self.spinner
            .set_message(format!("Chart [{current}/{total}] {title}"));
    }

    fn item_finished(&self, outcome: &ItemOutcome) {
        self.spinner
            .set_message(format!("{} {}", glyph(outcome.status), outcome.name));
    }

    fn done(&self, _report: &BatchReport) {
        self.spinner.finish_and_clear();
    }
}

fn glyph(status: ItemStatus) -> &'static str {
    match status {
        ItemStatus::Success => "✓",
        ItemStatus::Skipped => "-",
        ItemStatus::Failed => "✗",
    }
}

fn outcome_line(outcome: &ItemOutcome) -> String {
    let detail = match (outcome.status, &outcome.reason, &outcome.url) {
        (ItemStatus::Failed, Some(reason), _) => format!("failed at {}: {reason}", outcome.stage),
        (ItemStatus::Skipped, Some(reason), _) => format!("skipped: {reason}"),
        (_, _, Some(url)) => url.clone(),
        _ => String::new(),
    };
    format!("{} {:<40} {detail}", glyph(outcome.status), outcome.name)
}

fn print_diff(outcome: &ItemOutcome, indent: &str) {
    if let Some(diff) = &outcome.preview {
        if diff.changed {
            for line in diff.unified.lines() {
                println!("{indent}{line}");
            }
        } else {
            println!("{indent}(no change)");
        }
    }
}

fn print_report(report: &BatchReport) {
    println!();
    println!("  Run {} ({})", report.run_id, report.mode);
    for article in &report.articles {
        println!();
        println!(
            "  Article {}  {}  [{} / {}]",
            article.article_id, article.page.title, article.page.category, article.page.technology
        );
        if let Some(reason) = &article.reason {
            println!("    ✗ {reason}");
            continue;
        }
        for chart in &article.charts {
            println!("    {}", outcome_line(&chart.outcome));
            for field in &chart.fields {
                println!("        {}", outcome_line(field));
                print_diff(field, "          ");
            }
            print_diff(&chart.outcome, "      ");
        }
        if let Some(summary) = &article.summary {
            println!("    summary {}", outcome_line(summary));
            print_diff(summary, "      ");
        }
        for link in article.links.fields.iter().chain(&article.links.charts) {
            println!("    link {}", outcome_line(link));
            print_diff(link, "      ");
        }
    }

    let (charts, fields) = report.totals();
    println!();
    println!(
        "  Charts: {} ok, {} skipped, {} failed",
        charts.success, charts.skipped, charts.failed
    );
    println!(
        "  Fields: {} ok, {} skipped, {} failed",
        fields.success, fields.skipped, fields.failed
    );
    println!(
        "  Time:   {:.1}s",
        (report.finished_at - report.started_at).num_milliseconds() as f64 / 1000.0
    );
    println!();
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn cmd_serve(host: Option<String>, port: Option<u16>) -> Result<()> {
    let config = load_config()?;
    validate_secrets(&config)?;
    let host = host.unwrap_or_else(|| config.server.host.clone());
    let port = port.unwrap_or(config.server.port);
    crate::server::serve(config, &host, port).await
}

// ---------------------------------------------------------------------------
// inspect
// ---------------------------------------------------------------------------

fn cmd_inspect(path: &std::path::Path, view: &str, field: Option<&str>) -> Result<()> {
    let bytes =
        std::fs::read(path).map_err(|e| eyre!("cannot read '{}': {e}", path.display()))?;
    let (workbook, summary) = chartdoc_workbook::extract(&bytes, view)?;

    println!("{}", summary.render());
    if let Some(field) = field {
        println!();
        println!("{}", chartdoc_workbook::resolve_context(field, &workbook).render());
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// unpublish
// ---------------------------------------------------------------------------

async fn cmd_unpublish(sheet: &str, key: &str, yes: bool) -> Result<()> {
    let sheet: LedgerSheet = sheet.parse().map_err(|e: String| eyre!(e))?;
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let ledger = open_ledger(&config, &storage)?;

    let record = ledger
        .lookup(sheet, key)
        .await?
        .ok_or_else(|| eyre!("no {sheet} row for key '{key}'"))?;

    println!("  {} -> {} ({})", record.key, record.url, record.display_name);
    if !yes {
        println!("  Re-run with --yes to delete it.");
        return Ok(());
    }

    if !record.external_id.is_empty() {
        let publisher = IntercomClient::new(&config.help_center)?;
        publisher.delete(&record.external_id).await?;
    }
    ledger.delete(sheet, key).await?;
    info!(%sheet, key, "unpublished");
    println!("  Deleted.");
    Ok(())
}

// ---------------------------------------------------------------------------
// history / cache
// ---------------------------------------------------------------------------

async fn cmd_history(limit: u32, json: bool) -> Result<()> {
    let config = load_config()?;
    let storage = Storage::open_readonly(&expand_home(&config.ledger.db_path)).await?;
    let runs = storage.list_runs(limit).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&runs)?);
        return Ok(());
    }
    if runs.is_empty() {
        println!("No runs recorded yet.");
        return Ok(());
    }
    for run in &runs {
        let (charts, fields) = run.totals();
        println!(
            "{}  {:<14} {}  articles={} charts={}/{}/{} fields={}/{}/{}",
            run.run_id,
            run.mode,
            run.started_at.format("%Y-%m-%d %H:%M"),
            run.articles.len(),
            charts.success,
            charts.skipped,
            charts.failed,
            fields.success,
            fields.skipped,
            fields.failed,
        );
    }
    Ok(())
}

async fn cmd_cache_clear() -> Result<()> {
    let config = load_config()?;
    let storage = open_storage(&config).await?;
    let removed = storage.clear_response_cache().await?;
    println!("Removed {removed} cached answers.");
    Ok(())
}

// ---------------------------------------------------------------------------
// config
// ---------------------------------------------------------------------------

fn cmd_config_init() -> Result<()> {
    let path = init_config()?;
    println!("Config initialized at: {}", path.display());
    Ok(())
}

fn cmd_config_show() -> Result<()> {
    let config: AppConfig = load_config()?;
    let toml_str = toml::to_string_pretty(&config)?;
    println!("{toml_str}");
    Ok(())
}
