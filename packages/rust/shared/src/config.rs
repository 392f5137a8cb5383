//! Application configuration for chartdoc.
//!
//! User config lives at `~/.chartdoc/chartdoc.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are never stored here; each section names the environment
//! variable that holds its credential.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ChartDocError, Result};
use crate::types::LedgerSheet;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "chartdoc.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".chartdoc";

// ---------------------------------------------------------------------------
// Config structs (matching chartdoc.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Content-management system (article source).
    #[serde(default)]
    pub cms: CmsConfig,

    /// Tableau REST API.
    #[serde(default)]
    pub tableau: TableauConfig,

    /// Language model (OpenAI-compatible chat completions).
    #[serde(default)]
    pub llm: LlmConfig,

    /// Help-center publishing target.
    #[serde(default)]
    pub help_center: HelpCenterConfig,

    /// Duplicate-check ledger and HTML cache.
    #[serde(default)]
    pub ledger: LedgerConfig,

    /// Webhook server.
    #[serde(default)]
    pub server: ServerConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Batch mode used when a trigger does not name one.
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Text for the chart page's Availability line.
    #[serde(default = "default_availability")]
    pub availability: String,

    /// Placeholder for chart sections without generated content.
    #[serde(default = "default_placeholder")]
    pub placeholder: String,

    /// Category used when the article header carries none.
    #[serde(default = "default_category")]
    pub category: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            mode: default_mode(),
            availability: default_availability(),
            placeholder: default_placeholder(),
            category: default_category(),
        }
    }
}

fn default_mode() -> String {
    "create".into()
}
fn default_availability() -> String {
    "Global".into()
}
fn default_placeholder() -> String {
    "TBC".into()
}
fn default_category() -> String {
    "General".into()
}

/// `[cms]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CmsConfig {
    /// Site root, also used to resolve relative image URLs.
    #[serde(default)]
    pub base_url: String,

    /// Articles API path appended to `base_url`.
    #[serde(default = "default_cms_endpoint")]
    pub endpoint: String,

    /// Env var holding the API token (optional for public endpoints).
    #[serde(default = "default_cms_token_env")]
    pub token_env: String,

    #[serde(default = "default_timeout_short")]
    pub timeout_secs: u64,
}

impl Default for CmsConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            endpoint: default_cms_endpoint(),
            token_env: default_cms_token_env(),
            timeout_secs: default_timeout_short(),
        }
    }
}

fn default_cms_endpoint() -> String {
    "/api/index.php/v1/content/articles".into()
}
fn default_cms_token_env() -> String {
    "CMS_API_TOKEN".into()
}
fn default_timeout_short() -> u64 {
    30
}
fn default_timeout_long() -> u64 {
    60
}

/// `[tableau]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableauConfig {
    #[serde(default)]
    pub server_url: String,

    #[serde(default)]
    pub username: String,

    /// Env var holding the sign-in password.
    #[serde(default = "default_tableau_password_env")]
    pub password_env: String,

    /// Site content URL (empty for the default site).
    #[serde(default)]
    pub site: String,

    /// Project whose workbooks are authoritative when a view name is ambiguous.
    #[serde(default)]
    pub project_id: String,

    /// REST API version for view search and workbook download.
    #[serde(default = "default_tableau_api_version")]
    pub api_version: String,

    /// REST API version for sign-in.
    #[serde(default = "default_tableau_signin_version")]
    pub signin_api_version: String,

    #[serde(default = "default_timeout_long")]
    pub timeout_secs: u64,
}

impl Default for TableauConfig {
    fn default() -> Self {
        Self {
            server_url: String::new(),
            username: String::new(),
            password_env: default_tableau_password_env(),
            site: String::new(),
            project_id: String::new(),
            api_version: default_tableau_api_version(),
            signin_api_version: default_tableau_signin_version(),
            timeout_secs: default_timeout_long(),
        }
    }
}

fn default_tableau_password_env() -> String {
    "TABLEAU_PASSWORD".into()
}
fn default_tableau_api_version() -> String {
    "3.20".into()
}
fn default_tableau_signin_version() -> String {
    "3.19".into()
}

/// `[llm]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    #[serde(default = "default_llm_base_url")]
    pub base_url: String,

    #[serde(default = "default_llm_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_llm_api_key_env")]
    pub api_key_env: String,

    #[serde(default = "default_timeout_long")]
    pub timeout_secs: u64,

    /// Cache answers locally keyed by prompt hash.
    #[serde(default = "default_true")]
    pub cache: bool,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: default_llm_base_url(),
            model: default_llm_model(),
            api_key_env: default_llm_api_key_env(),
            timeout_secs: default_timeout_long(),
            cache: true,
        }
    }
}

fn default_llm_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn default_llm_model() -> String {
    "gpt-4o".into()
}
fn default_llm_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_true() -> bool {
    true
}

/// `[help_center]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HelpCenterConfig {
    #[serde(default = "default_help_center_url")]
    pub base_url: String,

    #[serde(default = "default_help_center_token_env")]
    pub token_env: String,

    /// Value of the `Intercom-Version` header.
    #[serde(default = "default_help_center_api_version")]
    pub api_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author_id: Option<String>,

    /// Publication state for new documents.
    #[serde(default = "default_publish_state")]
    pub state: String,

    #[serde(default)]
    pub collections: CollectionsConfig,

    #[serde(default = "default_timeout_short")]
    pub timeout_secs: u64,
}

impl Default for HelpCenterConfig {
    fn default() -> Self {
        Self {
            base_url: default_help_center_url(),
            token_env: default_help_center_token_env(),
            api_version: default_help_center_api_version(),
            author_id: None,
            state: default_publish_state(),
            collections: CollectionsConfig::default(),
            timeout_secs: default_timeout_short(),
        }
    }
}

fn default_help_center_url() -> String {
    "https://api.intercom.io".into()
}
fn default_help_center_token_env() -> String {
    "INTERCOM_API_TOKEN".into()
}
fn default_help_center_api_version() -> String {
    "2.14".into()
}
fn default_publish_state() -> String {
    "published".into()
}

/// `[help_center.collections]`: one collection per publishable category.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CollectionsConfig {
    /// Fallback for any category without its own collection.
    #[serde(default)]
    pub default: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dictionary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub charts: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub articles: Option<String>,
}

impl CollectionsConfig {
    /// Collection ID for documents logged in `sheet`.
    pub fn for_sheet(&self, sheet: LedgerSheet) -> &str {
        let specific = match sheet {
            LedgerSheet::DataDictionary => self.data_dictionary.as_deref(),
            LedgerSheet::ChartLibrary => self.charts.as_deref(),
            LedgerSheet::ArticleLibrary => self.articles.as_deref(),
        };
        specific
            .filter(|id| !id.is_empty())
            .unwrap_or(&self.default)
    }
}

/// Which ledger implementation backs duplicate checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LedgerBackend {
    /// Spreadsheet web-app endpoint.
    #[default]
    Sheets,
    /// Local libSQL database at `ledger.db_path`.
    Local,
}

/// `[ledger]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerConfig {
    #[serde(default)]
    pub backend: LedgerBackend,

    /// Spreadsheet web-app URL (`sheets` backend).
    #[serde(default)]
    pub sheets_url: String,

    #[serde(default = "default_data_dictionary_sheet")]
    pub data_dictionary: String,

    #[serde(default = "default_chart_library_sheet")]
    pub chart_library: String,

    #[serde(default = "default_article_library_sheet")]
    pub article_library: String,

    /// Local database: ledger (`local` backend), answer cache, run history.
    #[serde(default = "default_db_path")]
    pub db_path: String,

    #[serde(default = "default_timeout_short")]
    pub timeout_secs: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            backend: LedgerBackend::default(),
            sheets_url: String::new(),
            data_dictionary: default_data_dictionary_sheet(),
            chart_library: default_chart_library_sheet(),
            article_library: default_article_library_sheet(),
            db_path: default_db_path(),
            timeout_secs: default_timeout_short(),
        }
    }
}

impl LedgerConfig {
    /// Configured sheet name for a logical ledger table.
    pub fn sheet_name(&self, sheet: LedgerSheet) -> &str {
        match sheet {
            LedgerSheet::DataDictionary => &self.data_dictionary,
            LedgerSheet::ChartLibrary => &self.chart_library,
            LedgerSheet::ArticleLibrary => &self.article_library,
        }
    }
}

fn default_data_dictionary_sheet() -> String {
    LedgerSheet::DataDictionary.as_str().into()
}
fn default_chart_library_sheet() -> String {
    LedgerSheet::ChartLibrary.as_str().into()
}
fn default_article_library_sheet() -> String {
    LedgerSheet::ArticleLibrary.as_str().into()
}
fn default_db_path() -> String {
    "~/.chartdoc/chartdoc.db".into()
}

/// `[server]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".into()
}
fn default_port() -> u16 {
    5000
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.chartdoc/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ChartDocError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.chartdoc/chartdoc.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ChartDocError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| ChartDocError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ChartDocError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ChartDocError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ChartDocError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~/` to the user's home directory.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

/// Read a secret from the named environment variable.
pub fn resolve_secret(var_name: &str) -> Result<String> {
    match std::env::var(var_name) {
        Ok(val) if !val.trim().is_empty() => Ok(val),
        _ => Err(ChartDocError::config(format!(
            "secret not found. Set the {var_name} environment variable."
        ))),
    }
}

/// Check every required secret and endpoint before a batch starts.
///
/// Collects all problems into a single error so an operator can fix them in one go.
pub fn validate_secrets(config: &AppConfig) -> Result<()> {
    let mut missing = Vec::new();

    for var in [
        &config.llm.api_key_env,
        &config.tableau.password_env,
        &config.help_center.token_env,
    ] {
        if resolve_secret(var).is_err() {
            missing.push(format!("env {var}"));
        }
    }
    if config.cms.base_url.trim().is_empty() {
        missing.push("cms.base_url".into());
    }
    if config.tableau.server_url.trim().is_empty() {
        missing.push("tableau.server_url".into());
    }
    if config.ledger.backend == LedgerBackend::Sheets && config.ledger.sheets_url.trim().is_empty()
    {
        missing.push("ledger.sheets_url".into());
    }

    if missing.is_empty() {
        Ok(())
    } else {
        Err(ChartDocError::config(format!(
            "incomplete configuration, missing: {}",
            missing.join(", ")
        )))
    }
}
