// quill/src/backend.rs
//!
//! Generation backends: where streamed text comes from.
//!
//! Architecture:
//! - GenerationBackend trait: one streaming call per job, cancellable
//! - OpenAiCompatibleBackend: chat-completions over server-sent events
//! - StubBackend: replays a fixed response in chunks (tests, offline runs)

use crate::settings::GenerationSettings;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::io::{BufRead, BufReader};
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

/// Token usage statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.prompt_tokens + self.completion_tokens
    }
}

/// Final result of a streaming call.
#[derive(Debug, Clone, PartialEq)]
pub struct Generation {
    pub text: String,
    /// Provider-reported usage, when the provider reports it.
    pub usage: Option<TokenUsage>,
}

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("request was cancelled")]
    Cancelled,
    #[error("{provider} API error (HTTP {code}): {message}")]
    Status {
        provider: String,
        code: u16,
        message: String,
    },
    #[error("{0}")]
    Provider(String),
    #[error("failed to reach {provider}: {message}")]
    Transport { provider: String, message: String },
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Cooperative cancellation handle for one job.
///
/// Clones share the same flag. Two tokens are the *same* token only when
/// they come from the same [`CancellationToken::new`] call; see
/// [`CancellationToken::same_as`].
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Identity comparison: true when both handles belong to one job.
    pub fn same_as(&self, other: &CancellationToken) -> bool {
        Arc::ptr_eq(&self.cancelled, &other.cancelled)
    }
}

/// One streaming request.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub prompt: String,
    pub json_mode: bool,
    pub settings: Option<GenerationSettings>,
    pub cancellation: CancellationToken,
}

/// A text-generation backend.
pub trait GenerationBackend: Send + Sync {
    /// Stream a completion for `request`.
    ///
    /// `on_chunk(latest_chunk, cumulative_text)` is called zero or more times
    /// before the call returns the final cumulative text. Implementations
    /// should check `request.cancellation` between chunks and return
    /// [`BackendError::Cancelled`] once it is signalled.
    fn stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut dyn FnMut(&str, &str),
    ) -> Result<Generation, BackendError>;

    /// Get the provider name
    fn provider_name(&self) -> &str;
}

// ============================================================================
// OpenAI-Compatible Backend (DeepSeek, OpenAI, Groq, ...)
// ============================================================================

pub struct OpenAiCompatibleBackend {
    provider: String,
    api_base: String,
    api_key: Option<String>,
    model: String,
    timeout: Duration,
}

impl OpenAiCompatibleBackend {
    pub fn new(api_base: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            provider: "OpenAI-Compatible".to_string(),
            api_base: api_base.into().trim_end_matches('/').to_string(),
            api_key: None,
            model: model.into(),
            timeout: Duration::from_secs(120),
        }
    }

    pub fn from_config(config: &crate::config::EngineConfig) -> Self {
        let mut backend = Self::new(config.api_base.clone(), config.model.clone())
            .with_timeout(Duration::from_secs(config.request_timeout_secs));
        if let Some(key) = config.api_key() {
            backend = backend.with_api_key(key);
        }
        if config.api_base.contains("deepseek") {
            backend = backend.with_provider_name("DeepSeek");
        }
        backend
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_provider_name(mut self, provider: impl Into<String>) -> Self {
        self.provider = provider.into();
        self
    }

    fn payload(&self, request: &GenerationRequest) -> Value {
        let settings = request.settings.clone().unwrap_or_default();
        let model = settings.model.as_deref().unwrap_or(&self.model);

        let mut payload = serde_json::json!({
            "model": model,
            "messages": [{
                "role": "user",
                "content": request.prompt
            }],
            "stream": true,
            "stream_options": { "include_usage": true },
            "temperature": settings.temperature,
            "max_tokens": settings.max_tokens,
        });
        if request.json_mode {
            // Tagged prose plus JSON is not valid json_object output, so the
            // provider's JSON mode is only requested for bare-JSON prompts.
            if !request.prompt.contains(crate::stream_tags::PAYLOAD_START) {
                payload["response_format"] = serde_json::json!({ "type": "json_object" });
            }
        }
        payload
    }
}

impl GenerationBackend for OpenAiCompatibleBackend {
    fn stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut dyn FnMut(&str, &str),
    ) -> Result<Generation, BackendError> {
        let client = ureq::builder().timeout(self.timeout).build();
        let url = format!("{}/chat/completions", self.api_base);

        let mut call = client
            .post(&url)
            .set("Content-Type", "application/json")
            .set("Accept", "text/event-stream");
        if let Some(key) = &self.api_key {
            call = call.set("Authorization", &format!("Bearer {key}"));
        }

        tracing::debug!(provider = %self.provider, url = %url, "opening completion stream");
        let response = match call.send_json(self.payload(request)) {
            Ok(resp) => resp,
            Err(ureq::Error::Status(code, resp)) => {
                let error_body: Result<Value, _> = resp.into_json();
                let message = match error_body {
                    Ok(json) => json["error"]["message"]
                        .as_str()
                        .unwrap_or("Unknown API error")
                        .to_string(),
                    Err(_) => format!("HTTP {code} error"),
                };
                return Err(BackendError::Status {
                    provider: self.provider.clone(),
                    code,
                    message,
                });
            }
            Err(e) => {
                return Err(BackendError::Transport {
                    provider: self.provider.clone(),
                    message: e.to_string(),
                });
            }
        };

        let reader = BufReader::new(response.into_reader());
        let mut full_text = String::new();
        let mut usage = None;

        for line in reader.lines() {
            if request.cancellation.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            let line = line?;
            match process_event_line(&line)? {
                StreamEvent::Delta(delta) => {
                    full_text.push_str(&delta);
                    on_chunk(&delta, &full_text);
                }
                StreamEvent::Usage(reported) => usage = Some(reported),
                StreamEvent::Done => break,
                StreamEvent::Skip => {}
            }
        }

        if request.cancellation.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        Ok(Generation {
            text: full_text,
            usage,
        })
    }

    fn provider_name(&self) -> &str {
        &self.provider
    }
}

#[derive(Debug, PartialEq)]
enum StreamEvent {
    Delta(String),
    Usage(TokenUsage),
    Done,
    Skip,
}

fn process_event_line(line: &str) -> Result<StreamEvent, BackendError> {
    let line = line.trim_end_matches(['\r', '\n']);
    let Some(data) = line.strip_prefix("data:") else {
        // Comments (": keep-alive"), event names and blank separators.
        return Ok(StreamEvent::Skip);
    };
    let data = data.trim();
    if data == "[DONE]" {
        return Ok(StreamEvent::Done);
    }
    if data.is_empty() {
        return Ok(StreamEvent::Skip);
    }

    let value: Value = serde_json::from_str(data)
        .map_err(|e| BackendError::Provider(format!("malformed stream event: {e}")))?;

    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str())
            .unwrap_or("Unknown API error");
        return Err(BackendError::Provider(message.to_string()));
    }

    if let Some(delta) = value["choices"][0]["delta"]["content"].as_str() {
        if !delta.is_empty() {
            return Ok(StreamEvent::Delta(delta.to_string()));
        }
    }

    if value["usage"].is_object() {
        return Ok(StreamEvent::Usage(TokenUsage {
            prompt_tokens: value["usage"]["prompt_tokens"].as_u64().unwrap_or(0),
            completion_tokens: value["usage"]["completion_tokens"].as_u64().unwrap_or(0),
        }));
    }

    Ok(StreamEvent::Skip)
}

// ============================================================================
// Stub Backend
// ============================================================================

/// Replays a fixed response in character chunks.
#[derive(Debug, Clone)]
pub struct StubBackend {
    response: String,
    chunk_chars: usize,
    usage: Option<TokenUsage>,
}

impl StubBackend {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            chunk_chars: 16,
            usage: None,
        }
    }

    pub fn with_chunk_chars(mut self, chunk_chars: usize) -> Self {
        self.chunk_chars = chunk_chars.max(1);
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

impl GenerationBackend for StubBackend {
    fn stream(
        &self,
        request: &GenerationRequest,
        on_chunk: &mut dyn FnMut(&str, &str),
    ) -> Result<Generation, BackendError> {
        let chars: Vec<char> = self.response.chars().collect();
        let mut full_text = String::with_capacity(self.response.len());

        for piece in chars.chunks(self.chunk_chars) {
            if request.cancellation.is_cancelled() {
                return Err(BackendError::Cancelled);
            }
            let chunk: String = piece.iter().collect();
            full_text.push_str(&chunk);
            on_chunk(&chunk, &full_text);
        }

        if request.cancellation.is_cancelled() {
            return Err(BackendError::Cancelled);
        }

        Ok(Generation {
            text: full_text,
            usage: self.usage,
        })
    }

    fn provider_name(&self) -> &str {
        "Stub"
    }
}
