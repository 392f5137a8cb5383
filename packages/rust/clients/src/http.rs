//! Shared reqwest plumbing.

use std::time::Duration;

use reqwest::{Client, Response};

use chartdoc_shared::{ChartDocError, Result};

/// User-Agent string for every upstream request.
pub(crate) const USER_AGENT: &str = concat!("chartdoc/", env!("CARGO_PKG_VERSION"));

pub(crate) fn build_client(timeout_secs: u64) -> Result<Client> {
    Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(timeout_secs))
        .build()
        .map_err(|e| ChartDocError::Network(format!("failed to build HTTP client: {e}")))
}

/// Fail on a non-success status, otherwise return the body text.
pub(crate) async fn read_text(response: Response, context: &str) -> Result<String> {
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|e| ChartDocError::Network(format!("{context}: failed to read body: {e}")))?;

    if !status.is_success() {
        return Err(ChartDocError::Network(format!(
            "{context}: HTTP {status}: {}",
            excerpt(&text)
        )));
    }
    Ok(text)
}

/// Like [`read_text`], decoding the body as JSON.
pub(crate) async fn read_json<T: serde::de::DeserializeOwned>(
    response: Response,
    context: &str,
) -> Result<T> {
    let text = read_text(response, context).await?;
    serde_json::from_str(&text)
        .map_err(|e| ChartDocError::parse(format!("{context}: unexpected reply: {e}")))
}

pub(crate) fn excerpt(text: &str) -> String {
    text.chars().take(200).collect()
}

pub(crate) fn trim_slash(url: &str) -> String {
    url.trim().trim_end_matches('/').to_string()
}
