use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, de::DeserializeOwned};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::AiSettings;

/// Sampling temperature used for every chat-completion request.
pub const CHAT_TEMPERATURE: f64 = 0.7;

const ERROR_BODY_PREVIEW: usize = 500;

/// Individual chat message, compatible with OpenAI compliant providers.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: MessageRole,
    pub text: String,
}

impl ChatMessage {
    pub fn new(role: MessageRole, text: impl Into<String>) -> Self {
        Self {
            role,
            text: text.into(),
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new(MessageRole::System, text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, text)
    }
}

/// Supported chat roles passed to providers.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum MessageRole {
    System,
    User,
}

impl MessageRole {
    fn as_str(&self) -> &'static str {
        match self {
            MessageRole::System => "system",
            MessageRole::User => "user",
        }
    }
}

/// Failure calling the chat-completion endpoint.
#[derive(Debug, Error)]
pub enum ModelCallError {
    #[error("AI 接口返回错误 (HTTP {status}): {body}")]
    Status { status: u16, body: String },
    #[error("AI 接口请求失败: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("AI 接口响应格式异常: {0}")]
    MalformedResponse(String),
}

/// One chat-completion round trip. Implemented by [`LlmClient`] and by test fakes.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn complete(
        &self,
        settings: &AiSettings,
        messages: &[ChatMessage],
    ) -> Result<String, ModelCallError>;
}

/// Stateless HTTP client for OpenAI-compatible `/chat/completions` endpoints.
#[derive(Clone, Default)]
pub struct LlmClient {
    http: Client,
}

impl LlmClient {
    pub fn new(http: Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl ChatModel for LlmClient {
    async fn complete(
        &self,
        settings: &AiSettings,
        messages: &[ChatMessage],
    ) -> Result<String, ModelCallError> {
        let payload = serde_json::json!({
            "model": settings.model,
            "messages": messages
                .iter()
                .map(|msg| serde_json::json!({
                    "role": msg.role.as_str(),
                    "content": msg.text,
                }))
                .collect::<Vec<_>>(),
            "temperature": CHAT_TEMPERATURE,
        });

        let url = endpoint_url(&settings.api_endpoint, "chat/completions");
        debug!(%url, model = %settings.model, messages = messages.len(), "calling chat completion");

        let response = self
            .http
            .post(&url)
            .bearer_auth(&settings.api_key)
            .json(&payload)
            .send()
            .await?;

        let status = response.status();
        let response_text = response.text().await?;
        if !status.is_success() {
            warn!(%status, "chat completion returned non-success status");
            return Err(status_error(status, &response_text));
        }

        extract_message_text(&response_text)
    }
}

/// Join a configured base URL and a path without doubling slashes.
pub fn endpoint_url(base: &str, path: &str) -> String {
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

fn status_error(status: StatusCode, body: &str) -> ModelCallError {
    ModelCallError::Status {
        status: status.as_u16(),
        body: preview(body),
    }
}

fn preview(text: &str) -> String {
    if text.chars().count() > ERROR_BODY_PREVIEW {
        let head: String = text.chars().take(ERROR_BODY_PREVIEW).collect();
        format!("{head}...")
    } else {
        text.to_string()
    }
}

fn extract_message_text(body: &str) -> Result<String, ModelCallError> {
    let chat: OpenAiChatCompletionPayload = serde_json::from_str(body).map_err(|err| {
        ModelCallError::MalformedResponse(format!("{err}; body: {}", preview(body)))
    })?;

    chat.choices
        .into_iter()
        .find_map(|choice| choice.message.content)
        .ok_or_else(|| ModelCallError::MalformedResponse("响应中没有 choices[0].message.content".to_string()))
}

/// Remove surrounding Markdown code fences (```` ```json ```` / ```` ``` ````).
pub fn strip_code_fences(raw: &str) -> &str {
    let mut text = raw.trim();
    if let Some(rest) = text.strip_prefix("```") {
        // Drop the info string (e.g. `json`) up to the first newline.
        text = match rest.find('\n') {
            Some(idx) => &rest[idx + 1..],
            None => rest.trim_start_matches(|c: char| c.is_ascii_alphabetic()),
        };
    }
    if let Some(rest) = text.trim_end().strip_suffix("```") {
        text = rest;
    }
    text.trim()
}

/// Parse a JSON value out of free-form model text.
///
/// Fences are stripped first; if that still fails, the outermost object span
/// and the outermost array span are each tried, earliest first, before the
/// original error is returned.
pub fn parse_model_json<T: DeserializeOwned>(raw: &str) -> Result<T, serde_json::Error> {
    let stripped = strip_code_fences(raw);
    let err = match serde_json::from_str::<T>(stripped) {
        Ok(value) => return Ok(value),
        Err(err) => err,
    };

    let mut spans: Vec<(usize, &str)> = [('{', '}'), ('[', ']')]
        .into_iter()
        .filter_map(|(open, close)| outermost_span(stripped, open, close))
        .filter(|(_, span)| span.len() < stripped.len())
        .collect();
    spans.sort_by_key(|(start, _)| *start);

    spans
        .into_iter()
        .find_map(|(_, span)| serde_json::from_str::<T>(span).ok())
        .ok_or(err)
}

/// Parse model JSON, logging and substituting `fallback` when it is unusable.
pub fn parse_model_json_or<T, F>(raw: &str, context: &str, fallback: F) -> T
where
    T: DeserializeOwned,
    F: FnOnce() -> T,
{
    match parse_model_json(raw) {
        Ok(value) => value,
        Err(err) => {
            warn!(?err, context, preview = %preview(raw), "model output is not valid JSON, using fallback");
            fallback()
        }
    }
}

fn outermost_span(text: &str, open: char, close: char) -> Option<(usize, &str)> {
    let start = text.find(open)?;
    let end = text.rfind(close)?;
    (end > start).then(|| (start, &text[start..=end]))
}

#[derive(Debug, Deserialize)]
struct OpenAiChatCompletionPayload {
    #[serde(default)]
    choices: Vec<OpenAiChoice>,
}

#[derive(Debug, Deserialize)]
struct OpenAiChoice {
    message: OpenAiChatMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAiChatMessage {
    #[serde(default)]
    content: Option<String>,
}
