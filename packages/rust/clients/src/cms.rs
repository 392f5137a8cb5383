//! CMS article source (Joomla JSON:API).

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, instrument};
use url::Url;

use chartdoc_shared::{ChartDocError, CmsConfig, Result, resolve_secret};

use crate::http::{build_client, read_json, trim_slash};

/// An article body as stored in the CMS.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceArticle {
    pub id: String,
    /// Title with any trailing parenthesised note removed.
    pub title: String,
    pub html: String,
    /// Site root for resolving relative image sources.
    pub base_url: Option<Url>,
}

#[async_trait]
pub trait ArticleSource: Send + Sync {
    async fn fetch_article(&self, id: &str) -> Result<SourceArticle>;
}

/// Reqwest-backed [`ArticleSource`].
pub struct CmsClient {
    client: Client,
    base_url: String,
    endpoint: String,
    token: Option<String>,
}

#[derive(Deserialize)]
struct JsonApiReply {
    #[serde(default)]
    data: Option<JsonApiData>,
}

#[derive(Deserialize)]
struct JsonApiData {
    #[serde(default)]
    attributes: ArticleAttributes,
}

#[derive(Default, Deserialize)]
struct ArticleAttributes {
    #[serde(default)]
    title: String,
    #[serde(default)]
    text: String,
}

impl CmsClient {
    /// The token is optional; public endpoints work without one.
    pub fn new(config: &CmsConfig) -> Result<Self> {
        if config.base_url.trim().is_empty() {
            return Err(ChartDocError::config("cms.base_url is not set"));
        }
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: trim_slash(&config.base_url),
            endpoint: config.endpoint.trim().to_string(),
            token: resolve_secret(&config.token_env).ok(),
        })
    }
}

#[async_trait]
impl ArticleSource for CmsClient {
    #[instrument(skip_all, fields(article_id = %id))]
    async fn fetch_article(&self, id: &str) -> Result<SourceArticle> {
        let id = id.trim();
        if id.is_empty() {
            return Err(ChartDocError::validation("article id is empty"));
        }

        let url = format!("{}{}/{id}", self.base_url, self.endpoint);
        let mut request = self
            .client
            .get(&url)
            .query(&[("format", "jsonapi")])
            .header("Accept", "application/vnd.api+json");
        if let Some(token) = &self.token {
            request = request.header("X-Joomla-Token", token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("article {id}: {e}")))?;
        let reply: JsonApiReply = read_json(response, &format!("article {id}")).await?;
        let attributes = reply
            .data
            .ok_or_else(|| ChartDocError::parse(format!("article {id}: reply has no data")))?
            .attributes;

        debug!(html_len = attributes.text.len(), "article downloaded");
        Ok(SourceArticle {
            id: id.to_string(),
            title: short_title(&attributes.title),
            html: attributes.text,
            base_url: Url::parse(&format!("{}/", self.base_url)).ok(),
        })
    }
}

/// `"Solar Update (internal)"` becomes `"Solar Update"`.
fn short_title(raw: &str) -> String {
    raw.split('(').next().unwrap_or_default().trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> CmsClient {
        let config = CmsConfig {
            base_url: server.uri(),
            token_env: "CD_TEST_NONEXISTENT_CMS_TOKEN".into(),
            ..CmsConfig::default()
        };
        CmsClient::new(&config).expect("client")
    }

    #[tokio::test]
    async fn fetches_body_and_trims_title() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/index.php/v1/content/articles/42"))
            .and(query_param("format", "jsonapi"))
            .and(header("Accept", "application/vnd.api+json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"attributes": {"title": "Solar Update (Q3 draft)", "text": "<p>body</p>"}}
            })))
            .mount(&server)
            .await;

        let article = client_for(&server).fetch_article("42").await.expect("fetch");
        assert_eq!(article.title, "Solar Update");
        assert_eq!(article.html, "<p>body</p>");
        let base = article.base_url.expect("base url");
        assert_eq!(
            base.join("/images/a.png").expect("join").as_str(),
            format!("{}/images/a.png", server.uri())
        );
    }

    #[tokio::test]
    async fn missing_article_is_network_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404).set_body_string("not found"))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_article("7").await.unwrap_err();
        assert!(matches!(err, ChartDocError::Network(ref m) if m.contains("404")));
    }

    #[tokio::test]
    async fn reply_without_data_is_parse_error() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"errors": []})))
            .mount(&server)
            .await;

        let err = client_for(&server).fetch_article("7").await.unwrap_err();
        assert!(matches!(err, ChartDocError::Parse { .. }));
    }

    #[test]
    fn title_without_note_is_unchanged() {
        assert_eq!(short_title("  Battery Storage "), "Battery Storage");
        assert_eq!(short_title(""), "");
    }
}
