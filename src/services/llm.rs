use async_trait::async_trait;
use anyhow::{anyhow, Context, Result};
use log::debug;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::Debug;
use url::Url;

use crate::core::config::Config;
use crate::core::error::GatewayError;
use crate::utils::json::parse_object;

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct LlmConfig {
    #[serde(default = "default_provider")]
    pub provider: String, // "openai", "ollama" or "gemini"
    pub openai: Option<OpenAIConfig>,
    pub ollama: Option<OllamaConfig>,
    pub gemini: Option<GeminiConfig>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            openai: None,
            ollama: None,
            gemini: None,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OpenAIConfig {
    #[serde(default)]
    pub api_key: String,
    #[serde(default = "default_openai_model")]
    pub model: String,
    pub base_url: Option<String>,
    #[serde(default = "default_image_model")]
    pub image_model: String,
    #[serde(default = "default_image_size")]
    pub image_size: String,
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            model: default_openai_model(),
            base_url: None,
            image_model: default_image_model(),
            image_size: default_image_size(),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
pub struct GeminiConfig {
    #[serde(default)]
    pub api_key: String,
    pub model: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct OllamaConfig {
    pub base_url: String,
    pub model: String,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_openai_model() -> String {
    "gpt-4.1".to_string()
}
fn default_image_model() -> String {
    "dall-e-3".to_string()
}
fn default_image_size() -> String {
    "1024x1024".to_string()
}

impl LlmConfig {
    pub fn requires_credential(&self) -> bool {
        self.provider != "ollama"
    }

    /// The configured key for the active provider. Ollama runs without one.
    pub fn credential(&self) -> Option<&str> {
        let key = match self.provider.as_str() {
            "openai" => self.openai.as_ref().map(|c| c.api_key.as_str()),
            "gemini" => self.gemini.as_ref().map(|c| c.api_key.as_str()),
            "ollama" => return self.ollama.as_ref().map(|_| ""),
            _ => None,
        };
        key.filter(|k| !k.is_empty())
    }

    pub fn set_credential(&mut self, api_key: &str) {
        match self.provider.as_str() {
            "openai" => self.openai.get_or_insert_with(Default::default).api_key = api_key.to_string(),
            "gemini" => self.gemini.get_or_insert_with(Default::default).api_key = api_key.to_string(),
            _ => {}
        }
    }
}

/// A chat-completion capability that answers every prompt with one JSON object.
#[async_trait]
pub trait ModelGateway: Send + Sync + Debug {
    async fn complete(&self, prompt: &str) -> Result<Value, GatewayError>;

    /// Returns a URL (or data URL) of one generated image.
    async fn generate_image(&self, _prompt: &str) -> Result<String, GatewayError> {
        Err(GatewayError::Unsupported(self.provider()))
    }

    fn provider(&self) -> &'static str;
}

pub fn create_gateway(config: &Config) -> Result<Box<dyn ModelGateway>> {
    match config.llm.provider.as_str() {
        "openai" => {
            let cfg = config.llm.openai.as_ref().context("OpenAI config missing")?;
            Ok(Box::new(OpenAIClient::new(cfg)?))
        }
        "ollama" => {
            let cfg = config.llm.ollama.as_ref().context("Ollama config missing")?;
            Ok(Box::new(OllamaClient::new(&cfg.base_url, &cfg.model)?))
        }
        "gemini" => {
            let cfg = config.llm.gemini.as_ref().context("Gemini config missing")?;
            Ok(Box::new(GeminiClient::new(&cfg.api_key, &cfg.model)))
        }
        _ => Err(anyhow!("Unknown LLM provider: {}", config.llm.provider)),
    }
}

fn validated_base(base_url: &str) -> Result<String> {
    let trimmed = base_url.trim_end_matches('/');
    Url::parse(trimmed).with_context(|| format!("Invalid base URL: {}", base_url))?;
    Ok(trimmed.to_string())
}

#[derive(Deserialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ErrorBody {
    Object { message: String },
    Text(String),
}

/// Pulls `error.message` (or a plain `error` string) out of a failed response body.
fn upstream_error(provider: &'static str, status: StatusCode, body: &str) -> GatewayError {
    let message = match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(ErrorEnvelope { error: ErrorBody::Object { message } }) => message,
        Ok(ErrorEnvelope { error: ErrorBody::Text(message) }) => message,
        Err(_) if body.trim().is_empty() => status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string(),
        Err(_) => body.trim().to_string(),
    };
    GatewayError::Upstream {
        provider,
        status: status.as_u16(),
        message,
    }
}

// --- OpenAI ---

#[derive(Debug)]
struct OpenAIClient {
    api_key: String,
    model: String,
    image_model: String,
    image_size: String,
    base_url: String,
    client: reqwest::Client,
}

impl OpenAIClient {
    fn new(cfg: &OpenAIConfig) -> Result<Self> {
        Ok(Self {
            api_key: cfg.api_key.clone(),
            model: cfg.model.clone(),
            image_model: cfg.image_model.clone(),
            image_size: cfg.image_size.clone(),
            base_url: validated_base(cfg.base_url.as_deref().unwrap_or("https://api.openai.com/v1"))?,
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    response_format: ResponseFormat,
}

#[derive(Serialize)]
struct ResponseFormat {
    #[serde(rename = "type")]
    kind: &'static str,
}

#[derive(Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OpenAIResponse {
    choices: Vec<OpenAIChoice>,
}

#[derive(Deserialize)]
struct OpenAIChoice {
    message: OpenAIMessageResponse,
}

#[derive(Deserialize)]
struct OpenAIMessageResponse {
    content: Option<String>,
}

#[derive(Serialize)]
struct OpenAIImageRequest {
    model: String,
    prompt: String,
    n: u8,
    size: String,
}

#[derive(Deserialize)]
struct OpenAIImageResponse {
    data: Vec<OpenAIImage>,
}

#[derive(Deserialize)]
struct OpenAIImage {
    url: Option<String>,
    b64_json: Option<String>,
}

#[async_trait]
impl ModelGateway for OpenAIClient {
    async fn complete(&self, prompt: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/chat/completions", self.base_url);

        let request_body = OpenAIRequest {
            model: self.model.clone(),
            messages: vec![OpenAIMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            response_format: ResponseFormat { kind: "json_object" },
        };

        debug!("OpenAI completion ({} chars, model {})", prompt.len(), self.model);
        let resp = self.client.post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(self.provider(), status, &body));
        }

        let result: OpenAIResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidJson(format!("{}. Body: {}", e, body)))?;
        let content = result
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(GatewayError::Empty)?;

        parse_object(&content)
    }

    async fn generate_image(&self, prompt: &str) -> Result<String, GatewayError> {
        let url = format!("{}/images/generations", self.base_url);
        let request_body = OpenAIImageRequest {
            model: self.image_model.clone(),
            prompt: prompt.to_string(),
            n: 1,
            size: self.image_size.clone(),
        };

        debug!("OpenAI image generation (model {}, size {})", self.image_model, self.image_size);
        let resp = self.client.post(&url)
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(self.provider(), status, &body));
        }

        let result: OpenAIImageResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidJson(format!("{}. Body: {}", e, body)))?;
        image_reference(result)
    }

    fn provider(&self) -> &'static str {
        "OpenAI"
    }
}

fn image_reference(result: OpenAIImageResponse) -> Result<String, GatewayError> {
    let image = result.data.into_iter().next().ok_or(GatewayError::Empty)?;
    match (image.url, image.b64_json) {
        (Some(url), _) => Ok(url),
        (None, Some(b64)) => Ok(format!("data:image/png;base64,{}", b64)),
        (None, None) => Err(GatewayError::missing("data[0].url")),
    }
}

// --- Ollama ---

#[derive(Debug)]
struct OllamaClient {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaClient {
    fn new(base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            base_url: validated_base(base_url)?,
            model: model.to_string(),
            client: reqwest::Client::new(),
        })
    }
}

#[derive(Serialize)]
struct OllamaRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
    format: &'static str,
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OllamaMessageResponse,
}

#[derive(Deserialize)]
struct OllamaMessageResponse {
    content: String,
}

#[async_trait]
impl ModelGateway for OllamaClient {
    async fn complete(&self, prompt: &str) -> Result<Value, GatewayError> {
        let url = format!("{}/api/chat", self.base_url);

        let request_body = OllamaRequest {
            model: self.model.clone(),
            messages: vec![OllamaMessage {
                role: "user".to_string(),
                content: prompt.to_string(),
            }],
            stream: false,
            format: "json",
        };

        debug!("Ollama completion ({} chars, model {})", prompt.len(), self.model);
        let resp = self.client.post(&url)
            .json(&request_body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(self.provider(), status, &body));
        }

        let result: OllamaResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidJson(format!("{}. Body: {}", e, body)))?;
        parse_object(&result.message.content)
    }

    fn provider(&self) -> &'static str {
        "Ollama"
    }
}

// --- Gemini ---

#[derive(Debug)]
struct GeminiClient {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl GeminiClient {
    fn new(api_key: &str, model: &str) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::new(),
        }
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
    generation_config: GeminiGenerationConfig,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GeminiGenerationConfig {
    response_mime_type: &'static str,
}

#[derive(Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Deserialize)]
struct GeminiResponse {
    candidates: Option<Vec<GeminiCandidate>>,
}

#[derive(Deserialize)]
struct GeminiCandidate {
    content: Option<GeminiContentResponse>,
    #[serde(rename = "finishReason")]
    finish_reason: Option<String>,
}

#[derive(Deserialize)]
struct GeminiContentResponse {
    #[serde(default)]
    parts: Vec<GeminiPartResponse>,
}

#[derive(Deserialize)]
struct GeminiPartResponse {
    text: String,
}

#[async_trait]
impl ModelGateway for GeminiClient {
    async fn complete(&self, prompt: &str) -> Result<Value, GatewayError> {
        let endpoint = format!(
            "https://generativelanguage.googleapis.com/v1beta/models/{}:generateContent",
            self.model
        );
        let url = Url::parse_with_params(&endpoint, &[("key", self.api_key.as_str())])
            .map_err(|e| GatewayError::Shape(format!("invalid Gemini endpoint: {}", e)))?;

        let request_body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart { text: prompt.to_string() }],
            }],
            generation_config: GeminiGenerationConfig {
                response_mime_type: "application/json",
            },
        };

        debug!("Gemini completion ({} chars, model {})", prompt.len(), self.model);
        let resp = self.client.post(url)
            .json(&request_body)
            .send()
            .await?;

        let status = resp.status();
        let body = resp.text().await?;
        if !status.is_success() {
            return Err(upstream_error(self.provider(), status, &body));
        }

        let result: GeminiResponse = serde_json::from_str(&body)
            .map_err(|e| GatewayError::InvalidJson(format!("{}. Body: {}", e, body)))?;
        parse_object(&gemini_text(result)?)
    }

    fn provider(&self) -> &'static str {
        "Gemini"
    }
}

fn gemini_text(result: GeminiResponse) -> Result<String, GatewayError> {
    let first = result
        .candidates
        .and_then(|c| c.into_iter().next())
        .ok_or(GatewayError::Empty)?;
    let reason = first.finish_reason.unwrap_or_else(|| "UNKNOWN".to_string());
    first
        .content
        .and_then(|c| c.parts.into_iter().next())
        .map(|p| p.text)
        .ok_or_else(|| GatewayError::Shape(format!("no content parts (finish reason {})", reason)))
}
