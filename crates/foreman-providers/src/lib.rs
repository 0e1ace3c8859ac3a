use std::collections::VecDeque;
use std::pin::Pin;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use foreman_types::ErrorKind;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationParams {
    pub model: String,
    pub max_tokens: u32,
    pub temperature: f32,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            model: "default".to_string(),
            max_tokens: 1024,
            temperature: 0.7,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
}

#[derive(Debug, Clone)]
pub enum StreamChunk {
    TextDelta(String),
    Done {
        finish_reason: String,
        usage: Option<TokenUsage>,
    },
}

/// Classified provider failure. Only rate limits, timeouts, and server-side
/// errors are retriable.
#[derive(Debug, Clone, PartialEq)]
pub enum ProviderFailure {
    RateLimit { retry_after_seconds: f64 },
    Timeout,
    Auth(String),
    Server(String),
    BadRequest(String),
}

impl ProviderFailure {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProviderFailure::RateLimit { .. } => ErrorKind::RateLimited,
            ProviderFailure::Timeout => ErrorKind::Timeout,
            ProviderFailure::Auth(_) => ErrorKind::AuthFailed,
            ProviderFailure::Server(_) => ErrorKind::ServerError,
            ProviderFailure::BadRequest(_) => ErrorKind::BadRequest,
        }
    }

    pub fn is_retriable(&self) -> bool {
        self.kind().is_retriable()
    }
}

impl std::fmt::Display for ProviderFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProviderFailure::RateLimit {
                retry_after_seconds,
            } => write!(f, "rate limited, retry after {retry_after_seconds}s"),
            ProviderFailure::Timeout => f.write_str("request timed out"),
            ProviderFailure::Auth(detail) => write!(f, "authentication failed: {detail}"),
            ProviderFailure::Server(detail) => write!(f, "server error: {detail}"),
            ProviderFailure::BadRequest(detail) => write!(f, "bad request: {detail}"),
        }
    }
}

impl std::error::Error for ProviderFailure {}

pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<StreamChunk, ProviderFailure>> + Send>>;

/// Provider-reported quota state. `None` fields mean the provider does not
/// expose that window.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitState {
    pub requests_remaining_minute: Option<u64>,
    pub tokens_remaining_minute: Option<u64>,
    pub requests_remaining_day: Option<u64>,
    pub tokens_remaining_day: Option<u64>,
    pub retry_after_seconds: Option<f64>,
    pub monthly_budget_remaining: Option<f64>,
}

impl RateLimitState {
    pub fn is_rate_limited(&self) -> bool {
        self.retry_after_seconds.is_some()
            || self.requests_remaining_minute == Some(0)
            || self.tokens_remaining_minute == Some(0)
    }

    /// Whether callers should back off, and for how long.
    pub fn throttle_hint(&self) -> (bool, f64) {
        if let Some(wait) = self.retry_after_seconds {
            return (true, wait.max(1.0));
        }
        if self.requests_remaining_minute == Some(0) || self.tokens_remaining_minute == Some(0) {
            return (true, 5.0);
        }
        if self.monthly_budget_remaining.map(|b| b <= 0.0).unwrap_or(false) {
            return (true, 60.0);
        }
        (false, 0.0)
    }
}

/// Abstract language-model capability consumed by the supervisor. Wire-level
/// providers live outside the core; this crate ships test doubles only.
#[async_trait]
pub trait ModelClient: Send + Sync {
    fn id(&self) -> &str;

    async fn generate(
        &self,
        messages: &[ChatMessage],
        params: &GenerationParams,
    ) -> Result<String, ProviderFailure>;

    async fn stream(
        &self,
        messages: Vec<ChatMessage>,
        params: GenerationParams,
        _cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderFailure> {
        let text = self.generate(&messages, &params).await?;
        let stream = futures::stream::iter(vec![
            Ok(StreamChunk::TextDelta(text)),
            Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: None,
            }),
        ]);
        Ok(Box::pin(stream))
    }

    fn rate_limit(&self) -> RateLimitState {
        RateLimitState::default()
    }

    /// Consulted before dispatch; `(true, delay_seconds)` asks the caller to
    /// wait before issuing the next request.
    fn should_throttle(&self) -> (bool, f64) {
        self.rate_limit().throttle_hint()
    }
}

/// Echoes the last user message. Fallback client for wiring without any
/// provider configured.
pub struct EchoModelClient;

#[async_trait]
impl ModelClient for EchoModelClient {
    fn id(&self) -> &str {
        "echo"
    }

    async fn generate(
        &self,
        messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<String, ProviderFailure> {
        let last = messages
            .iter()
            .rev()
            .find(|m| m.role == "user")
            .map(|m| m.content.as_str())
            .unwrap_or_default();
        Ok(format!("Echo: {last}"))
    }
}

/// Deterministic scripted client: returns queued outcomes in order, then
/// repeats the final outcome. Used throughout the integration tests.
pub struct ScriptedModelClient {
    id: String,
    script: Mutex<VecDeque<Result<String, ProviderFailure>>>,
    last: Mutex<Option<Result<String, ProviderFailure>>>,
    rate_limit: RateLimitState,
}

impl ScriptedModelClient {
    pub fn new(outcomes: Vec<Result<String, ProviderFailure>>) -> Self {
        Self {
            id: "scripted".to_string(),
            script: Mutex::new(outcomes.into_iter().collect()),
            last: Mutex::new(None),
            rate_limit: RateLimitState::default(),
        }
    }

    pub fn always(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    pub fn with_rate_limit(mut self, state: RateLimitState) -> Self {
        self.rate_limit = state;
        self
    }

    fn next_outcome(&self) -> Result<String, ProviderFailure> {
        let mut script = self.script.lock().expect("script lock");
        if let Some(outcome) = script.pop_front() {
            *self.last.lock().expect("last lock") = Some(outcome.clone());
            return outcome;
        }
        self.last
            .lock()
            .expect("last lock")
            .clone()
            .unwrap_or_else(|| Ok(String::new()))
    }
}

#[async_trait]
impl ModelClient for ScriptedModelClient {
    fn id(&self) -> &str {
        &self.id
    }

    async fn generate(
        &self,
        _messages: &[ChatMessage],
        _params: &GenerationParams,
    ) -> Result<String, ProviderFailure> {
        self.next_outcome()
    }

    async fn stream(
        &self,
        _messages: Vec<ChatMessage>,
        _params: GenerationParams,
        cancel: CancellationToken,
    ) -> Result<ChunkStream, ProviderFailure> {
        let text = self.next_outcome()?;
        let stream = async_stream::stream! {
            // One chunk per line keeps directive-splitting tests honest.
            for (idx, piece) in text.split_inclusive('\n').enumerate() {
                if cancel.is_cancelled() {
                    yield Ok(StreamChunk::Done {
                        finish_reason: "cancelled".to_string(),
                        usage: None,
                    });
                    return;
                }
                if idx > 0 {
                    tokio::task::yield_now().await;
                }
                yield Ok(StreamChunk::TextDelta(piece.to_string()));
            }
            yield Ok(StreamChunk::Done {
                finish_reason: "stop".to_string(),
                usage: Some(TokenUsage { input_tokens: 0, output_tokens: 0 }),
            });
        };
        Ok(Box::pin(stream))
    }

    fn rate_limit(&self) -> RateLimitState {
        self.rate_limit.clone()
    }
}
