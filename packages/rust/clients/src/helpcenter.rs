//! Help-center publishing (Intercom articles API).

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, instrument};

use chartdoc_shared::{ChartDocError, HelpCenterConfig, Result, resolve_secret};

use crate::http::{build_client, read_json, read_text, trim_slash};

/// A document to create in a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewDocument {
    pub title: String,
    pub body: String,
    /// Empty means "no parent collection".
    pub collection_id: String,
}

/// Identity of a published document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedDocument {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn create(&self, doc: &NewDocument) -> Result<PublishedDocument>;

    async fn update(&self, id: &str, title: &str, body: &str) -> Result<PublishedDocument>;

    async fn delete(&self, id: &str) -> Result<()>;
}

/// Reqwest-backed [`Publisher`].
pub struct IntercomClient {
    client: Client,
    base_url: String,
    token: String,
    api_version: String,
    author_id: Option<String>,
    state: String,
}

#[derive(Serialize)]
struct CreateArticle<'a> {
    title: &'a str,
    body: &'a str,
    state: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    author_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    parent_type: Option<&'static str>,
}

#[derive(Serialize)]
struct UpdateArticle<'a> {
    title: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct ArticleReply {
    #[serde(default)]
    id: Value,
    #[serde(default)]
    url: Option<String>,
}

impl IntercomClient {
    pub fn new(config: &HelpCenterConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: trim_slash(&config.base_url),
            token: resolve_secret(&config.token_env)?,
            api_version: config.api_version.clone(),
            author_id: config.author_id.clone().filter(|a| !a.trim().is_empty()),
            state: config.state.clone(),
        })
    }

    fn authed(&self, request: RequestBuilder) -> RequestBuilder {
        request
            .bearer_auth(&self.token)
            .header("Accept", "application/json")
            .header("Intercom-Version", &self.api_version)
    }
}

impl ArticleReply {
    fn into_document(self, fallback_id: Option<&str>) -> Result<PublishedDocument> {
        let id = match self.id {
            Value::String(s) => s,
            Value::Number(n) => n.to_string(),
            _ => fallback_id.unwrap_or_default().to_string(),
        };
        if id.is_empty() {
            return Err(ChartDocError::Publish("reply carries no article id".into()));
        }
        let url = self
            .url
            .filter(|u| !u.trim().is_empty())
            .unwrap_or_else(|| format!("https://help.intercom.com/articles/{id}"));
        Ok(PublishedDocument { id, url })
    }
}

#[async_trait]
impl Publisher for IntercomClient {
    #[instrument(skip_all, fields(title = %doc.title, collection = %doc.collection_id))]
    async fn create(&self, doc: &NewDocument) -> Result<PublishedDocument> {
        let collection = Some(doc.collection_id.trim()).filter(|c| !c.is_empty());
        let body = CreateArticle {
            title: &doc.title,
            body: &doc.body,
            state: &self.state,
            author_id: self.author_id.as_deref(),
            parent_id: collection,
            parent_type: collection.map(|_| "collection"),
        };

        let response = self
            .authed(self.client.post(format!("{}/articles", self.base_url)))
            .json(&body)
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("create article: {e}")))?;
        let reply: ArticleReply = read_json(response, "create article").await?;
        let document = reply.into_document(None)?;

        info!(id = %document.id, url = %document.url, "article created");
        Ok(document)
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn update(&self, id: &str, title: &str, body: &str) -> Result<PublishedDocument> {
        let response = self
            .authed(self.client.put(format!("{}/articles/{id}", self.base_url)))
            .json(&UpdateArticle { title, body })
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("update article {id}: {e}")))?;
        let reply: ArticleReply = read_json(response, &format!("update article {id}")).await?;
        let document = reply.into_document(Some(id))?;

        info!(url = %document.url, "article updated");
        Ok(document)
    }

    #[instrument(skip_all, fields(id = %id))]
    async fn delete(&self, id: &str) -> Result<()> {
        let response = self
            .authed(self.client.delete(format!("{}/articles/{id}", self.base_url)))
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("delete article {id}: {e}")))?;
        read_text(response, &format!("delete article {id}")).await?;
        info!("article deleted");
        Ok(())
    }
}
