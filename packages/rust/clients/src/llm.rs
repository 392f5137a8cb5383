//! OpenAI-compatible chat completions.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use chartdoc_shared::{ChartDocError, LlmConfig, Result, resolve_secret};

use crate::http::{build_client, read_json, trim_slash};

/// One prompt: system message, user text, and an optional image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompletionRequest {
    pub system: String,
    pub user: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub max_tokens: u32,
}

#[async_trait]
pub trait LanguageModel: Send + Sync {
    /// Model identifier, part of every cache key.
    fn model(&self) -> &str;

    /// Reply text with any markdown code fence removed.
    async fn complete(&self, request: &CompletionRequest) -> Result<String>;
}

/// Reqwest-backed [`LanguageModel`].
pub struct OpenAiClient {
    client: Client,
    base_url: String,
    model: String,
    api_key: String,
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<ChatMessage<'a>>,
    max_tokens: u32,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: MessageContent<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum MessageContent<'a> {
    Text(&'a str),
    Parts(Vec<ContentPart<'a>>),
}

#[derive(Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentPart<'a> {
    Text { text: &'a str },
    ImageUrl { image_url: ImageRef<'a> },
}

#[derive(Serialize)]
struct ImageRef<'a> {
    url: &'a str,
}

#[derive(Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ChoiceMessage,
}

#[derive(Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

impl OpenAiClient {
    pub fn new(config: &LlmConfig) -> Result<Self> {
        Ok(Self {
            client: build_client(config.timeout_secs)?,
            base_url: trim_slash(&config.base_url),
            model: config.model.clone(),
            api_key: resolve_secret(&config.api_key_env)?,
        })
    }
}

fn chat_body<'a>(model: &'a str, request: &'a CompletionRequest) -> ChatRequest<'a> {
    let user = match request.image_url.as_deref() {
        Some(url) => MessageContent::Parts(vec![
            ContentPart::Text {
                text: &request.user,
            },
            ContentPart::ImageUrl {
                image_url: ImageRef { url },
            },
        ]),
        None => MessageContent::Text(&request.user),
    };
    ChatRequest {
        model,
        messages: vec![
            ChatMessage {
                role: "system",
                content: MessageContent::Text(&request.system),
            },
            ChatMessage {
                role: "user",
                content: user,
            },
        ],
        max_tokens: request.max_tokens,
    }
}

#[async_trait]
impl LanguageModel for OpenAiClient {
    fn model(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(model = %self.model, image = request.image_url.is_some()))]
    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&chat_body(&self.model, request))
            .send()
            .await
            .map_err(|e| ChartDocError::Network(format!("chat completion: {e}")))?;
        let reply: ChatResponse = read_json(response, "chat completion").await?;

        let content = reply
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| ChartDocError::Llm("reply has no message content".into()))?;
        debug!(reply_len = content.len(), "completion received");
        Ok(strip_code_fences(&content))
    }
}

/// Remove a surrounding ```` ``` ```` / ```` ```json ```` fence, if present.
pub fn strip_code_fences(text: &str) -> String {
    let text = text.trim();
    if !text.starts_with("```") {
        return text.to_string();
    }
    let mut lines: Vec<&str> = text.lines().skip(1).collect();
    if lines.last().is_some_and(|l| l.trim() == "```") {
        lines.pop();
    }
    lines.join("\n").trim().to_string()
}
