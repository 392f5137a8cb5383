//! Language-model prompts, the local answer cache, and tolerant answer parsing.
//!
//! Every call goes through [`CachedModel`], so a preview run and the apply run
//! that follows it see byte-identical answers.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use tracing::{debug, instrument, warn};

use chartdoc_clients::{CompletionRequest, LanguageModel};
use chartdoc_shared::{ChartDocError, Result};
use chartdoc_storage::Storage;
use chartdoc_workbook::{canonical_parts, norm_key};

// ---------------------------------------------------------------------------
// Prompts
// ---------------------------------------------------------------------------

const CHART_SYSTEM: &str = "You extract raw data structure from Tableau charts. \
Report field names exactly as they appear in the metadata, without translating or simplifying them.";

const FIELD_SYSTEM: &str = "You are a senior data analyst documenting Tableau dashboards. \
Answer with strict JSON and no markdown wrapper.";

const RENAME_SYSTEM: &str = "You are a data steward for a business-intelligence platform. \
Turn technical field names into clean business names. Answer with JSON only.";

fn chart_prompt(view_summary: &str) -> String {
    format!(
        r#"Map every chart in the attached image to the metadata fields below.

Metadata:

{view_summary}

Rules:
- Copy field names verbatim from the metadata. Never rename them.
- Axes built from several fields (A * B, A / B) list every field involved.
- Merge the axes of every sub-chart in the image into one list.
- Ignore charts titled "no title" or showing only a logo.
- Dimensions are categories, dates, locations, indexes, or colour legends. Measures are values.
- Ignore filters that apply to the whole view.

Return a single JSON object and nothing else:
{{"Vertical": "comma-separated Y-axis fields", "Horizontal": "comma-separated X-axis fields", "Dimensions": ["..."], "Measures": ["..."]}}"#
    )
}

fn field_prompt(field: &str, context: &str) -> String {
    format!(
        r#"Document this field.

Field name: {field}
Technical context:

{context}

Keys:
- "definition": one plain-English sentence on what the field measures.
- "calculation_explanation": how it is computed. Native fields: "Direct value from the database."
- "pseudo_formula": a readable formula with descriptive names and no Tableau syntax, or "None" for native fields.
- "considerations": the listed categories for strings, the filter range for numeric measures, otherwise "None".

Return only:
{{"definition": "...", "calculation_explanation": "...", "pseudo_formula": "...", "considerations": "..."}}"#
    )
}

fn rename_prompt(field: &str, context: &str) -> String {
    let context = if context.trim().is_empty() {
        "No additional context provided."
    } else {
        context
    };
    format!(
        r#"Rename this Tableau field for business readers.

Original name: {field}
Technical context:

{context}

- Title Case, no underscores, ids, or "(copy)" noise.
- Flags read "Is ..." or "Has ..."; INDEX() or RANK() logic is "Rank".
- Keep units such as kW, MW, YTD, YoY.
- At most five words.

Return only: {{"human_name": "..."}}"#
    )
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Cache key for one request against one model.
pub fn prompt_hash(model: &str, request: &CompletionRequest) -> String {
    let mut hasher = Sha256::new();
    for part in [
        model,
        request.system.as_str(),
        request.user.as_str(),
        request.image_url.as_deref().unwrap_or_default(),
    ] {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

/// [`LanguageModel`] decorator that answers repeats from the local cache.
pub struct CachedModel {
    inner: Arc<dyn LanguageModel>,
    cache: Option<Arc<Storage>>,
}

impl CachedModel {
    /// `cache: None` disables caching.
    pub fn new(inner: Arc<dyn LanguageModel>, cache: Option<Arc<Storage>>) -> Self {
        Self { inner, cache }
    }
}

#[async_trait]
impl LanguageModel for CachedModel {
    fn model(&self) -> &str {
        self.inner.model()
    }

    async fn complete(&self, request: &CompletionRequest) -> Result<String> {
        let Some(cache) = &self.cache else {
            return self.inner.complete(request).await;
        };

        let hash = prompt_hash(self.model(), request);
        if let Some(hit) = cache.get_cached_response(&hash, self.model()).await? {
            debug!(hash = %&hash[..12], "answer cache hit");
            return Ok(hit);
        }

        let answer = self.inner.complete(request).await?;
        if let Err(e) = cache
            .set_cached_response(&hash, self.model(), &answer)
            .await
        {
            warn!(error = %e, "failed to cache answer");
        }
        Ok(answer)
    }
}

// ---------------------------------------------------------------------------
// Chart answer
// ---------------------------------------------------------------------------

/// Field layout of a chart as reported by the model. Items are verbatim.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ChartFields {
    pub vertical: Vec<String>,
    pub horizontal: Vec<String>,
    pub dimensions: Vec<String>,
    pub measures: Vec<String>,
    /// Names from a list or delimited answer, role unknown.
    pub unclassified: Vec<String>,
}

/// The shapes a chart answer is accepted in, tried in this order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChartAnswer {
    Structured(ChartFields),
    List(Vec<String>),
    Delimited(Vec<String>),
}

const LAYOUT_KEYS: [&str; 4] = ["Vertical", "Horizontal", "Dimensions", "Measures"];

impl ChartAnswer {
    pub fn parse(text: &str) -> Result<Self> {
        let text = text.trim();
        match serde_json::from_str::<Value>(text) {
            Ok(Value::Object(map)) => Ok(Self::from_object(&map)),
            Ok(Value::Array(items)) => Ok(Self::List(items.iter().flat_map(items_of).collect())),
            Ok(Value::String(s)) => Self::delimited(&s),
            Ok(_) => Err(ChartDocError::parse("chart answer is not an object, list, or string")),
            Err(_) => Self::delimited(text),
        }
    }

    fn from_object(map: &Map<String, Value>) -> Self {
        let get = |key: &str| -> Vec<String> {
            map.iter()
                .find(|(k, _)| k.eq_ignore_ascii_case(key))
                .map(|(_, v)| items_of(v))
                .unwrap_or_default()
        };
        if LAYOUT_KEYS
            .iter()
            .any(|key| map.keys().any(|k| k.eq_ignore_ascii_case(key)))
        {
            return Self::Structured(ChartFields {
                vertical: get("Vertical"),
                horizontal: get("Horizontal"),
                dimensions: get("Dimensions"),
                measures: get("Measures"),
                unclassified: Vec::new(),
            });
        }
        // Older answers: any object whose list values are field names.
        Self::List(
            map.values()
                .filter(|v| v.is_array())
                .flat_map(items_of)
                .collect(),
        )
    }

    /// A bare `A, B, C` line. Prose or broken JSON is rejected.
    fn delimited(text: &str) -> Result<Self> {
        let text = text.trim();
        if text.is_empty() || text.contains(['\n', '{', '[']) {
            return Err(ChartDocError::parse(format!(
                "unrecognised chart answer: {}",
                text.chars().take(120).collect::<String>()
            )));
        }
        Ok(Self::Delimited(split_items(text)))
    }

    pub fn layout(&self) -> ChartFields {
        match self {
            Self::Structured(fields) => fields.clone(),
            Self::List(items) | Self::Delimited(items) => ChartFields {
                unclassified: items.clone(),
                ..ChartFields::default()
            },
        }
    }

    /// Canonical field names: dimensions, measures, vertical, horizontal,
    /// deduplicated by norm key in that order.
    pub fn field_names(&self) -> Vec<String> {
        let layout = self.layout();
        let mut seen = Vec::new();
        let mut names = Vec::new();
        for raw in layout
            .dimensions
            .iter()
            .chain(&layout.measures)
            .chain(&layout.vertical)
            .chain(&layout.horizontal)
            .chain(&layout.unclassified)
        {
            for name in canonical_parts(raw) {
                let key = norm_key(&name);
                if key.is_empty() || key == "none" || seen.contains(&key) {
                    continue;
                }
                seen.push(key);
                names.push(name);
            }
        }
        names
    }
}

fn split_items(text: &str) -> Vec<String> {
    text.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
        .map(str::to_string)
        .collect()
}

fn items_of(value: &Value) -> Vec<String> {
    match value {
        Value::String(s) => split_items(s),
        Value::Array(items) => items
            .iter()
            .filter_map(|v| match v {
                Value::String(s) => Some(s.trim().to_string()),
                Value::Number(n) => Some(n.to_string()),
                _ => None,
            })
            .filter(|s| !s.is_empty() && !s.eq_ignore_ascii_case("none"))
            .collect(),
        _ => Vec::new(),
    }
}

// ---------------------------------------------------------------------------
// Field answer
// ---------------------------------------------------------------------------

/// Documentation for one data field.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldAnalysis {
    pub definition: String,
    pub calculation_explanation: String,
    pub pseudo_formula: String,
    pub considerations: String,
}

impl FieldAnalysis {
    pub fn parse(text: &str) -> Result<Self> {
        let value: Value = serde_json::from_str(text.trim())
            .map_err(|e| ChartDocError::parse(format!("field answer is not JSON: {e}")))?;
        let Value::Object(map) = value else {
            return Err(ChartDocError::parse("field answer is not an object"));
        };

        let get = |key: &str| map.get(key).map(text_of).unwrap_or_default();
        let analysis = Self {
            definition: get("definition"),
            calculation_explanation: get("calculation_explanation"),
            pseudo_formula: get("pseudo_formula"),
            considerations: get("considerations"),
        };
        if analysis.definition.is_empty() && analysis.calculation_explanation.is_empty() {
            return Err(ChartDocError::parse("field answer has no definition"));
        }
        Ok(analysis)
    }
}

fn text_of(value: &Value) -> String {
    match value {
        Value::String(s) => s.trim().to_string(),
        Value::Null => String::new(),
        Value::Array(items) => items.iter().map(text_of).collect::<Vec<_>>().join(", "),
        other => other.to_string(),
    }
}

/// `{"human_name": ..}`, else the bare reply, else `fallback`.
pub fn parse_human_name(reply: &str, fallback: &str) -> String {
    let reply = reply.trim();
    if let Ok(Value::Object(map)) = serde_json::from_str::<Value>(reply) {
        return map
            .get("human_name")
            .map(text_of)
            .filter(|name| !name.is_empty())
            .unwrap_or_else(|| fallback.to_string());
    }
    let bare = reply.trim_matches(['"', '\'']).trim();
    if bare.is_empty() || bare.contains('\n') {
        fallback.to_string()
    } else {
        bare.to_string()
    }
}

// ---------------------------------------------------------------------------
// Calls
// ---------------------------------------------------------------------------

#[instrument(skip_all, fields(image = %image_url))]
pub async fn analyze_chart(
    model: &dyn LanguageModel,
    image_url: &str,
    view_summary: &str,
) -> Result<ChartAnswer> {
    let request = CompletionRequest {
        system: CHART_SYSTEM.into(),
        user: chart_prompt(view_summary),
        image_url: Some(image_url.to_string()).filter(|u| !u.is_empty()),
        max_tokens: 2000,
    };
    let reply = model.complete(&request).await?;
    ChartAnswer::parse(&reply)
}

#[instrument(skip_all, fields(field = %field))]
pub async fn analyze_field(
    model: &dyn LanguageModel,
    field: &str,
    context: &str,
) -> Result<FieldAnalysis> {
    let request = CompletionRequest {
        system: FIELD_SYSTEM.into(),
        user: field_prompt(field, context),
        image_url: None,
        max_tokens: 1500,
    };
    let reply = model.complete(&request).await?;
    FieldAnalysis::parse(&reply)
}

/// Business name for `field`. Never fails; falls back to the canonical name.
#[instrument(skip_all, fields(field = %field))]
pub async fn human_name(model: &dyn LanguageModel, field: &str, context: &str) -> String {
    let request = CompletionRequest {
        system: RENAME_SYSTEM.into(),
        user: rename_prompt(field, context),
        image_url: None,
        max_tokens: 150,
    };
    match model.complete(&request).await {
        Ok(reply) => parse_human_name(&reply, field),
        Err(e) => {
            warn!(error = %e, "rename failed, keeping canonical name");
            field.to_string()
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
