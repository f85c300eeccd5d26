//! Vertex AI Gemini client grounded on a Vertex AI Search data store.
//!
//! Every `generateContent` call carries the same retrieval tool, generation
//! parameters and safety settings; only `contents` changes between turns.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::auth::TokenProvider;
use crate::http::ensure_success;
use crate::retry::{with_retry, RetryPolicy};
use crate::{Error, Result};

pub const DEFAULT_MODEL_ID: &str = "gemini-1.5-flash-002";

const SERVICE: &str = "aiplatform";

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub max_output_tokens: u32,
    pub temperature: f32,
    pub top_p: f32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            max_output_tokens: 8192,
            temperature: 1.0,
            top_p: 0.95,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HarmCategory {
    #[serde(rename = "HARM_CATEGORY_HATE_SPEECH")]
    HateSpeech,
    #[serde(rename = "HARM_CATEGORY_DANGEROUS_CONTENT")]
    DangerousContent,
    #[serde(rename = "HARM_CATEGORY_SEXUALLY_EXPLICIT")]
    SexuallyExplicit,
    #[serde(rename = "HARM_CATEGORY_HARASSMENT")]
    Harassment,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HarmBlockThreshold {
    BlockNone,
    BlockOnlyHigh,
    BlockMediumAndAbove,
    BlockLowAndAbove,
}

impl HarmBlockThreshold {
    pub fn as_str(&self) -> &'static str {
        match self {
            HarmBlockThreshold::BlockNone => "BLOCK_NONE",
            HarmBlockThreshold::BlockOnlyHigh => "BLOCK_ONLY_HIGH",
            HarmBlockThreshold::BlockMediumAndAbove => "BLOCK_MEDIUM_AND_ABOVE",
            HarmBlockThreshold::BlockLowAndAbove => "BLOCK_LOW_AND_ABOVE",
        }
    }
}

impl fmt::Display for HarmBlockThreshold {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for HarmBlockThreshold {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "BLOCK_NONE" => Ok(HarmBlockThreshold::BlockNone),
            "BLOCK_ONLY_HIGH" => Ok(HarmBlockThreshold::BlockOnlyHigh),
            "BLOCK_MEDIUM_AND_ABOVE" => Ok(HarmBlockThreshold::BlockMediumAndAbove),
            "BLOCK_LOW_AND_ABOVE" => Ok(HarmBlockThreshold::BlockLowAndAbove),
            other => Err(format!("unknown harm block threshold '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SafetySetting {
    pub category: HarmCategory,
    pub threshold: HarmBlockThreshold,
}

/// Per-category blocking thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SafetyThresholds {
    pub hate_speech: HarmBlockThreshold,
    pub dangerous_content: HarmBlockThreshold,
    pub sexually_explicit: HarmBlockThreshold,
    pub harassment: HarmBlockThreshold,
}

impl Default for SafetyThresholds {
    fn default() -> Self {
        Self {
            hate_speech: HarmBlockThreshold::BlockMediumAndAbove,
            dangerous_content: HarmBlockThreshold::BlockOnlyHigh,
            sexually_explicit: HarmBlockThreshold::BlockMediumAndAbove,
            harassment: HarmBlockThreshold::BlockMediumAndAbove,
        }
    }
}

impl SafetyThresholds {
    pub fn to_settings(&self) -> Vec<SafetySetting> {
        vec![
            SafetySetting {
                category: HarmCategory::HateSpeech,
                threshold: self.hate_speech,
            },
            SafetySetting {
                category: HarmCategory::DangerousContent,
                threshold: self.dangerous_content,
            },
            SafetySetting {
                category: HarmCategory::SexuallyExplicit,
                threshold: self.sexually_explicit,
            },
            SafetySetting {
                category: HarmCategory::Harassment,
                threshold: self.harassment,
            },
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct VertexAiSearch {
    pub datastore: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Retrieval {
    pub vertex_ai_search: VertexAiSearch,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Tool {
    pub retrieval: Retrieval,
}

impl Tool {
    /// Retrieval tool that grounds answers on a data store.
    pub fn vertex_ai_search(data_store_path: impl Into<String>) -> Self {
        Self {
            retrieval: Retrieval {
                vertex_ai_search: VertexAiSearch {
                    datastore: data_store_path.into(),
                },
            },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Part {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Content {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub parts: Vec<Part>,
}

impl Content {
    pub fn text(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.to_string(),
            parts: vec![Part {
                text: Some(text.into()),
            }],
        }
    }
}

/// Body of `:generateContent`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentRequest {
    pub contents: Vec<Content>,
    pub tools: Vec<Tool>,
    pub generation_config: GenerationConfig,
    pub safety_settings: Vec<SafetySetting>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerateContentResponse {
    #[serde(default)]
    pub candidates: Vec<Candidate>,
    #[serde(default)]
    pub prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Candidate {
    #[serde(default)]
    pub content: Option<Content>,
    #[serde(default)]
    pub finish_reason: Option<String>,
    #[serde(default)]
    pub grounding_metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PromptFeedback {
    #[serde(default)]
    pub block_reason: Option<String>,
}

impl GenerateContentResponse {
    /// Text of the first part of the first candidate.
    pub fn first_text(&self) -> Result<String> {
        let candidate = self.candidates.first().ok_or_else(|| {
            let reason = self
                .prompt_feedback
                .as_ref()
                .and_then(|f| f.block_reason.clone())
                .unwrap_or_else(|| "none given".to_string());
            Error::MalformedResponse(format!("no candidates (block reason: {})", reason))
        })?;

        let text = candidate
            .content
            .as_ref()
            .and_then(|content| content.parts.first())
            .and_then(|part| part.text.as_deref())
            .filter(|text| !text.trim().is_empty())
            .ok_or_else(|| {
                Error::MalformedResponse(format!(
                    "candidate has no text (finish reason: {})",
                    candidate.finish_reason.as_deref().unwrap_or("unknown")
                ))
            })?;

        Ok(text.to_string())
    }
}

/// Everything that fixes how the chat model behaves.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSettings {
    pub project_id: String,
    pub region: String,
    pub model_id: String,
    pub data_store_path: String,
    pub generation: GenerationConfig,
    pub safety: SafetyThresholds,
}

/// A hosted generative model bound to its tools and settings.
#[async_trait]
pub trait GenerativeModel: Send + Sync {
    async fn generate_content(&self, contents: Vec<Content>) -> Result<GenerateContentResponse>;
}

/// Builds one model handle per chat session.
pub trait ModelFactory: Send + Sync {
    fn create(&self) -> Result<Arc<dyn GenerativeModel>>;
}

/// REST client for Vertex AI `generateContent`.
pub struct VertexModelClient {
    http_client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    url: String,
    tools: Vec<Tool>,
    generation: GenerationConfig,
    safety_settings: Vec<SafetySetting>,
    retry: RetryPolicy,
}

impl VertexModelClient {
    pub fn new(
        http_client: reqwest::Client,
        tokens: Arc<TokenProvider>,
        settings: &ModelSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http_client,
            tokens,
            url: generate_content_url(settings),
            tools: vec![Tool::vertex_ai_search(settings.data_store_path.clone())],
            generation: settings.generation,
            safety_settings: settings.safety.to_settings(),
            retry,
        }
    }

    fn request(&self, contents: Vec<Content>) -> GenerateContentRequest {
        GenerateContentRequest {
            contents,
            tools: self.tools.clone(),
            generation_config: self.generation,
            safety_settings: self.safety_settings.clone(),
        }
    }

    async fn send_once(&self, body: &GenerateContentRequest) -> Result<GenerateContentResponse> {
        let token = self.tokens.access_token().await?;

        let response = self
            .http_client
            .post(&self.url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await?;

        Ok(ensure_success(SERVICE, response).await?.json().await?)
    }
}

#[async_trait]
impl GenerativeModel for VertexModelClient {
    async fn generate_content(&self, contents: Vec<Content>) -> Result<GenerateContentResponse> {
        let body = self.request(contents);
        let body = &body;
        with_retry(&self.retry, "generateContent", move || self.send_once(body)).await
    }
}

/// Model endpoint for the configured region.
pub fn generate_content_url(settings: &ModelSettings) -> String {
    let host = if settings.region == "global" {
        "aiplatform.googleapis.com".to_string()
    } else {
        format!("{}-aiplatform.googleapis.com", settings.region)
    };

    format!(
        "https://{}/v1/projects/{}/locations/{}/publishers/google/models/{}:generateContent",
        host, settings.project_id, settings.region, settings.model_id
    )
}

/// Creates [`VertexModelClient`]s that share one HTTP client and token cache.
pub struct VertexModelFactory {
    http_client: reqwest::Client,
    tokens: Arc<TokenProvider>,
    settings: ModelSettings,
    retry: RetryPolicy,
}

impl VertexModelFactory {
    pub fn new(
        http_client: reqwest::Client,
        tokens: Arc<TokenProvider>,
        settings: ModelSettings,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            http_client,
            tokens,
            settings,
            retry,
        }
    }
}

impl ModelFactory for VertexModelFactory {
    fn create(&self) -> Result<Arc<dyn GenerativeModel>> {
        info!(
            model_id = %self.settings.model_id,
            data_store = %self.settings.data_store_path,
            "Initialising grounded model"
        );

        Ok(Arc::new(VertexModelClient::new(
            self.http_client.clone(),
            Arc::clone(&self.tokens),
            &self.settings,
            self.retry,
        )))
    }
}
