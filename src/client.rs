use std::fmt;

use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::record::{LogProbs, ResponseOutput, Usage};

pub const DEFAULT_BASE_URL: &str = "https://api.together.xyz/v1";
pub const API_KEY_ENV: &str = "TOGETHER_API_KEY";
pub const BASE_URL_ENV: &str = "TOGETHER_BASE_URL";

/// Sampling parameters forwarded verbatim to the completion service. A
/// logprob depth switches the request from free-text sampling to per-token
/// alternative probabilities.
#[derive(Debug, Clone, Copy)]
pub struct GenerationParams {
    pub temperature: f32,
    pub max_tokens: u32,
    pub logprobs: Option<u32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

/// One role-tagged turn in a chat request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }
}

/// Normalized result of one completion round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub output: ResponseOutput,
    pub model: String,
    pub finish_reason: Option<String>,
    pub usage: Usage,
}

/// Failure of a single completion call. `Api` carries the HTTP status the
/// service rejected with so the caller can classify transient failures; the
/// client itself never retries.
#[derive(Debug)]
pub enum ClientError {
    Api { status: u16, message: String },
    Transport(reqwest::Error),
    InvalidResponse(String),
}

impl ClientError {
    pub fn status(&self) -> Option<u16> {
        match self {
            ClientError::Api { status, .. } => Some(*status),
            ClientError::Transport(_) | ClientError::InvalidResponse(_) => None,
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::Api { status, message } => {
                write!(f, "API error (status {status}): {message}")
            }
            ClientError::Transport(error) => write!(f, "Transport error: {error}"),
            ClientError::InvalidResponse(message) => write!(f, "Invalid response: {message}"),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Transport(error) => Some(error),
            ClientError::Api { .. } | ClientError::InvalidResponse(_) => None,
        }
    }
}

/// Abstraction over the remote chat-completion service.
#[async_trait]
pub trait CompletionClient: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion, ClientError>;
}

/// Concrete [`CompletionClient`] for Together's OpenAI-compatible
/// `/chat/completions` endpoint.
pub struct TogetherClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl TogetherClient {
    /// Builds a client against the default base URL (or `TOGETHER_BASE_URL`
    /// when set, e.g. for self-hosted gateways and tests).
    pub fn new(api_key: impl Into<String>) -> Result<Self> {
        let base_url = std::env::var(BASE_URL_ENV).unwrap_or_else(|_| DEFAULT_BASE_URL.to_string());
        Self::with_base_url(api_key, base_url)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(anyhow!("API key may not be empty"));
        }
        Ok(Self {
            http: build_http_client()?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key,
        })
    }
}

impl fmt::Debug for TogetherClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TogetherClient")
            .field("base_url", &self.base_url)
            .finish()
    }
}

#[async_trait]
impl CompletionClient for TogetherClient {
    async fn complete(
        &self,
        model: &str,
        messages: &[Message],
        params: &GenerationParams,
    ) -> Result<Completion, ClientError> {
        let request = ChatCompletionRequest {
            model,
            messages,
            temperature: params.temperature,
            max_tokens: params.max_tokens,
            logprobs: params.logprobs.map(|_| true),
            top_logprobs: params.logprobs,
        };
        debug!(model, messages = messages.len(), "Sending completion request");

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await
            .map_err(ClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Api {
                status: status.as_u16(),
                message: extract_api_error(&body),
            });
        }

        let body: ChatCompletionResponse =
            response.json().await.map_err(ClientError::Transport)?;
        normalize(body, params.logprobs.is_some())
    }
}

#[derive(Debug, Serialize)]
struct ChatCompletionRequest<'a> {
    model: &'a str,
    messages: &'a [Message],
    temperature: f32,
    max_tokens: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    logprobs: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    top_logprobs: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionResponse {
    model: String,
    choices: Vec<Choice>,
    #[serde(default)]
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ChoiceMessage,
    #[serde(default)]
    finish_reason: Option<String>,
    #[serde(default)]
    logprobs: Option<LogProbs>,
}

#[derive(Debug, Deserialize)]
struct ChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: ApiErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ApiErrorDetail {
    message: String,
}

/// Maps the first choice onto the normalized [`Completion`]: the logprob
/// payload when a depth was requested, the generated text otherwise.
fn normalize(body: ChatCompletionResponse, want_logprobs: bool) -> Result<Completion, ClientError> {
    let choice = body.choices.into_iter().next().ok_or_else(|| {
        ClientError::InvalidResponse("response contained no choices".to_string())
    })?;
    let output = if want_logprobs {
        let logprobs = choice.logprobs.ok_or_else(|| {
            ClientError::InvalidResponse(
                "logprobs were requested but missing from the response".to_string(),
            )
        })?;
        ResponseOutput::LogProbs(logprobs)
    } else {
        ResponseOutput::Text(choice.message.content.unwrap_or_default())
    };
    Ok(Completion {
        output,
        model: body.model,
        finish_reason: choice.finish_reason,
        usage: body.usage.unwrap_or_default(),
    })
}

fn extract_api_error(body: &str) -> String {
    match serde_json::from_str::<ApiErrorBody>(body) {
        Ok(parsed) => parsed.error.message,
        Err(_) if body.trim().is_empty() => "no error body".to_string(),
        Err(_) => body.trim().to_string(),
    }
}

fn build_http_client() -> Result<reqwest::Client> {
    // reqwest::Client::default() can consult OS-level proxy settings, which
    // has been observed to misbehave in sandboxed environments. Opt back in
    // with PROMPTBATCH_ENABLE_SYSTEM_PROXY=1.
    let mut builder = reqwest::Client::builder();
    if std::env::var_os("PROMPTBATCH_ENABLE_SYSTEM_PROXY").is_none() {
        builder = builder.no_proxy();
    }
    builder
        .build()
        .map_err(|err| anyhow!("Failed to build HTTP client: {err}"))
}
