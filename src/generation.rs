//! Text generation providers and the resilient adapter around them.
//!
//! A [`Generator`] is one remote (or local) completion backend. The
//! [`GenerationAdapter`] wraps any generator with bounded retry for
//! transient failures and a hard deadline over the whole call, retries
//! included. On expiry the caller gets [`GenerationError::Timeout`] and the
//! in-flight request future is dropped, which aborts it.
//!
//! | Config Value | Provider |
//! |-------------|----------|
//! | `"disabled"` | [`DisabledGenerator`] |
//! | `"echo"` | [`EchoGenerator`] (offline, deterministic) |
//! | `"openai"` | [`OpenAIGenerator`] (`/v1/chat/completions`) |
//! | `"ollama"` | [`OllamaGenerator`] (`/api/chat`) |

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tracing::warn;

use grounding_core::assemble::AssembledPrompt;

use crate::config::{Config, GenerationConfig};
use crate::retry::{retry_with, RetryPolicy};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum GenerationError {
    /// The deadline expired. Never retried on the request path.
    #[error("generation timed out after {after:?}")]
    Timeout { after: Duration },

    /// Network error, rate limit, or server error.
    #[error("transient generation error: {0}")]
    Transient(String),

    /// Quota exhausted, invalid request, or provider disabled.
    #[error("generation failed: {0}")]
    Fatal(String),
}

impl GenerationError {
    pub fn is_transient(&self) -> bool {
        matches!(self, GenerationError::Transient(_))
    }

    pub fn code(&self) -> &'static str {
        match self {
            GenerationError::Timeout { .. } => "generation_timeout",
            GenerationError::Transient(_) | GenerationError::Fatal(_) => "generation_failed",
        }
    }
}

/// Token usage reported by the backend.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Usage {
    pub prompt_tokens: u64,
    pub completion_tokens: u64,
    pub model: String,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct Generation {
    pub text: String,
    pub usage: Usage,
}

#[async_trait]
pub trait Generator: Send + Sync {
    fn model_name(&self) -> &str;
    async fn generate(&self, prompt: &AssembledPrompt) -> Result<Generation, GenerationError>;
}

/// Rough token estimate for providers that do not report usage.
fn estimate_tokens(text: &str) -> u64 {
    text.chars().count().div_ceil(4) as u64
}

// ============ Disabled ============

pub struct DisabledGenerator;

#[async_trait]
impl Generator for DisabledGenerator {
    fn model_name(&self) -> &str {
        "disabled"
    }
    async fn generate(&self, _prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
        Err(GenerationError::Fatal(
            "Generation provider is disabled. Set [generation] provider in config.".to_string(),
        ))
    }
}

// ============ Echo ============

/// Offline generator that answers from the assembled prompt alone.
///
/// Grounded prompts get the first sentence of each cited passage with its
/// marker; ungrounded prompts get an explicit no-grounding reply.
pub struct EchoGenerator;

pub const ECHO_UNGROUNDED_REPLY: &str =
    "I don't have a grounded answer to that in my sources, so I won't guess.";

fn first_sentence(text: &str) -> &str {
    let text = text.trim();
    match text.find(['.', '!', '?', '\n']) {
        Some(i) => text[..=i].trim_end(),
        None => text,
    }
}

fn passage_texts(prompt: &str) -> Vec<(usize, &str)> {
    // Passages are "[n] reference\ntext" blocks separated by blank lines.
    let mut out = Vec::new();
    for block in prompt.split("\n\n") {
        let block = block.strip_prefix("Passages:\n").unwrap_or(block);
        let Some(rest) = block.strip_prefix('[') else {
            continue;
        };
        let Some((num, tail)) = rest.split_once(']') else {
            continue;
        };
        let Ok(marker) = num.parse::<usize>() else {
            continue;
        };
        if let Some((_, body)) = tail.split_once('\n') {
            out.push((marker, body));
        }
    }
    out
}

#[async_trait]
impl Generator for EchoGenerator {
    fn model_name(&self) -> &str {
        "echo"
    }

    async fn generate(&self, prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
        let text = if prompt.grounded {
            let parts: Vec<String> = passage_texts(&prompt.prompt)
                .into_iter()
                .map(|(marker, body)| format!("{} [{}]", first_sentence(body), marker))
                .collect();
            if parts.is_empty() {
                ECHO_UNGROUNDED_REPLY.to_string()
            } else {
                parts.join(" ")
            }
        } else {
            ECHO_UNGROUNDED_REPLY.to_string()
        };
        Ok(Generation {
            usage: Usage {
                prompt_tokens: estimate_tokens(&prompt.full_prompt()),
                completion_tokens: estimate_tokens(&text),
                model: "echo".to_string(),
            },
            text,
        })
    }
}

// ============ HTTP providers ============

fn classify_status(status: reqwest::StatusCode, body: &str, label: &str) -> GenerationError {
    let msg = format!("{} API error {}: {}", label, status, body);
    if status.as_u16() == 429 && body.contains("insufficient_quota") {
        GenerationError::Fatal(msg)
    } else if status.as_u16() == 429 || status.is_server_error() {
        GenerationError::Transient(msg)
    } else {
        GenerationError::Fatal(msg)
    }
}

async fn post_chat(
    client: &reqwest::Client,
    url: &str,
    api_key: Option<&str>,
    body: &serde_json::Value,
    label: &str,
) -> Result<serde_json::Value, GenerationError> {
    let mut req = client.post(url).json(body);
    if let Some(key) = api_key {
        req = req.header("Authorization", format!("Bearer {}", key));
    }
    let response = req
        .send()
        .await
        .map_err(|e| GenerationError::Transient(format!("{} connection error: {}", label, e)))?;
    let status = response.status();
    if status.is_success() {
        return response
            .json()
            .await
            .map_err(|e| GenerationError::Transient(format!("{} invalid JSON: {}", label, e)));
    }
    let body_text = response.text().await.unwrap_or_default();
    Err(classify_status(status, &body_text, label))
}

fn chat_messages(prompt: &AssembledPrompt) -> serde_json::Value {
    serde_json::json!([
        { "role": "system", "content": prompt.system },
        { "role": "user", "content": prompt.prompt },
    ])
}

/// OpenAI chat completions. Requires `OPENAI_API_KEY`.
pub struct OpenAIGenerator {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
    model: String,
    max_output_tokens: u32,
}

impl OpenAIGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for OpenAI provider"))?;
        let api_key = std::env::var("OPENAI_API_KEY")
            .map_err(|_| anyhow::anyhow!("OPENAI_API_KEY environment variable not set"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            api_key,
            base_url: config
                .url
                .clone()
                .unwrap_or_else(|| "https://api.openai.com".to_string()),
            model,
            max_output_tokens: config.max_output_tokens,
        })
    }
}

fn parse_openai_chat(json: &serde_json::Value, model: &str) -> Result<Generation, GenerationError> {
    let text = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| GenerationError::Fatal("OpenAI response missing message content".to_string()))?
        .to_string();
    let usage = Usage {
        prompt_tokens: json
            .pointer("/usage/prompt_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        completion_tokens: json
            .pointer("/usage/completion_tokens")
            .and_then(|v| v.as_u64())
            .unwrap_or(0),
        model: json
            .get("model")
            .and_then(|m| m.as_str())
            .unwrap_or(model)
            .to_string(),
    };
    Ok(Generation { text, usage })
}

#[async_trait]
impl Generator for OpenAIGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
        let url = format!("{}/v1/chat/completions", self.base_url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(prompt),
            "max_tokens": self.max_output_tokens,
        });
        let json = post_chat(&self.client, &url, Some(&self.api_key), &body, "OpenAI").await?;
        parse_openai_chat(&json, &self.model)
    }
}

/// Ollama chat endpoint (default `http://localhost:11434`).
pub struct OllamaGenerator {
    client: reqwest::Client,
    url: String,
    model: String,
}

impl OllamaGenerator {
    pub fn new(config: &GenerationConfig) -> anyhow::Result<Self> {
        let model = config
            .model
            .clone()
            .ok_or_else(|| anyhow::anyhow!("generation.model required for Ollama provider"))?;
        Ok(Self {
            client: reqwest::Client::new(),
            url: config
                .url
                .clone()
                .unwrap_or_else(|| "http://localhost:11434".to_string()),
            model,
        })
    }
}

fn parse_ollama_chat(json: &serde_json::Value, model: &str) -> Result<Generation, GenerationError> {
    let text = json
        .pointer("/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| GenerationError::Fatal("Ollama response missing message content".to_string()))?
        .to_string();
    Ok(Generation {
        usage: Usage {
            prompt_tokens: json
                .get("prompt_eval_count")
                .and_then(|v| v.as_u64())
                .unwrap_or(0),
            completion_tokens: json.get("eval_count").and_then(|v| v.as_u64()).unwrap_or(0),
            model: model.to_string(),
        },
        text,
    })
}

#[async_trait]
impl Generator for OllamaGenerator {
    fn model_name(&self) -> &str {
        &self.model
    }

    async fn generate(&self, prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
        let url = format!("{}/api/chat", self.url.trim_end_matches('/'));
        let body = serde_json::json!({
            "model": self.model,
            "messages": chat_messages(prompt),
            "stream": false,
        });
        let json = post_chat(&self.client, &url, None, &body, "Ollama").await?;
        parse_ollama_chat(&json, &self.model)
    }
}

pub fn create_generator(config: &GenerationConfig) -> anyhow::Result<Arc<dyn Generator>> {
    match config.provider.as_str() {
        "disabled" => Ok(Arc::new(DisabledGenerator)),
        "echo" => Ok(Arc::new(EchoGenerator)),
        "openai" => Ok(Arc::new(OpenAIGenerator::new(config)?)),
        "ollama" => Ok(Arc::new(OllamaGenerator::new(config)?)),
        other => anyhow::bail!("Unknown generation provider: {}", other),
    }
}

// ============ Adapter ============

/// Retry + hard-timeout wrapper around a [`Generator`].
#[derive(Clone)]
pub struct GenerationAdapter {
    generator: Arc<dyn Generator>,
    retry: RetryPolicy,
    timeout: Duration,
}

impl GenerationAdapter {
    pub fn new(generator: Arc<dyn Generator>, retry: RetryPolicy, timeout: Duration) -> Self {
        Self {
            generator,
            retry,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        Ok(Self::new(
            create_generator(&config.generation)?,
            config.generation_retry(),
            Duration::from_secs(config.generation.timeout_secs),
        ))
    }

    pub fn model_name(&self) -> &str {
        self.generator.model_name()
    }

    /// Generate within the deadline. Transient errors are retried with
    /// exponential backoff while time remains; fatal errors return at once.
    pub async fn generate(&self, prompt: &AssembledPrompt) -> Result<Generation, GenerationError> {
        let attempts = retry_with(&self.retry, GenerationError::is_transient, |attempt| {
            if attempt > 0 {
                warn!(tenant_id = %prompt.tenant_id, attempt, "retrying generation");
            }
            self.generator.generate(prompt)
        });
        match tokio::time::timeout(self.timeout, attempts).await {
            Ok(result) => result,
            Err(_) => Err(GenerationError::Timeout {
                after: self.timeout,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::Backoff;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn prompt(grounded: bool) -> AssembledPrompt {
        AssembledPrompt {
            tenant_id: "sage".to_string(),
            system: "You are a stoic sage.".to_string(),
            prompt: "Answer.\n\nPassages:\n[1] Meditations #1\nDiscipline brings freedom. It is earned.\n\n[2] Letters #4\nPatience is a virtue\n\nQuestion: tell me about discipline".to_string(),
            citations: Vec::new(),
            grounded,
            truncated: false,
        }
    }

    struct Scripted {
        failures: AtomicU32,
        error: GenerationError,
        calls: AtomicU32,
    }

    impl Scripted {
        fn new(failures: u32, error: GenerationError) -> Self {
            Self {
                failures: AtomicU32::new(failures),
                error,
                calls: AtomicU32::new(0),
            }
        }
    }

    #[async_trait]
    impl Generator for Scripted {
        fn model_name(&self) -> &str {
            "scripted"
        }
        async fn generate(&self, _p: &AssembledPrompt) -> Result<Generation, GenerationError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                return Err(self.error.clone());
            }
            Ok(Generation {
                text: "ok".to_string(),
                usage: Usage {
                    prompt_tokens: 10,
                    completion_tokens: 2,
                    model: "scripted".to_string(),
                },
            })
        }
    }

    struct Slow;

    #[async_trait]
    impl Generator for Slow {
        fn model_name(&self) -> &str {
            "slow"
        }
        async fn generate(&self, _p: &AssembledPrompt) -> Result<Generation, GenerationError> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Err(GenerationError::Fatal("unreachable".to_string()))
        }
    }

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay: Duration::from_millis(1),
            backoff: Backoff::Exponential,
        }
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let gen = Arc::new(Scripted::new(2, GenerationError::Transient("503".to_string())));
        let adapter = GenerationAdapter::new(gen.clone(), fast_retry(3), Duration::from_secs(5));
        let out = adapter.generate(&prompt(true)).await.unwrap();
        assert_eq!(out.text, "ok");
        assert_eq!(gen.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_fatal_errors_propagate_immediately() {
        let gen = Arc::new(Scripted::new(5, GenerationError::Fatal("quota".to_string())));
        let adapter = GenerationAdapter::new(gen.clone(), fast_retry(3), Duration::from_secs(5));
        let err = adapter.generate(&prompt(true)).await.unwrap_err();
        assert_eq!(err.code(), "generation_failed");
        assert_eq!(gen.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_timeout_is_reported() {
        let adapter = GenerationAdapter::new(Arc::new(Slow), fast_retry(0), Duration::from_millis(50));
        let err = adapter.generate(&prompt(true)).await.unwrap_err();
        assert!(matches!(err, GenerationError::Timeout { .. }));
        assert_eq!(err.code(), "generation_timeout");
    }

    #[tokio::test]
    async fn test_echo_generator() {
        let out = EchoGenerator.generate(&prompt(true)).await.unwrap();
        assert_eq!(out.text, "Discipline brings freedom. [1] Patience is a virtue [2]");
        assert!(out.usage.prompt_tokens > 0);

        let out = EchoGenerator.generate(&prompt(false)).await.unwrap();
        assert_eq!(out.text, ECHO_UNGROUNDED_REPLY);
    }

    #[test]
    fn test_classify_status() {
        use reqwest::StatusCode;
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "", "x").is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down", "x").is_transient());
        assert!(!classify_status(StatusCode::TOO_MANY_REQUESTS, "insufficient_quota", "x").is_transient());
        assert!(!classify_status(StatusCode::BAD_REQUEST, "", "x").is_transient());
    }

    #[test]
    fn test_parse_openai_chat() {
        let json = serde_json::json!({
            "model": "gpt-4o-mini",
            "choices": [{ "message": { "content": "hello" } }],
            "usage": { "prompt_tokens": 12, "completion_tokens": 3 }
        });
        let g = parse_openai_chat(&json, "fallback").unwrap();
        assert_eq!(g.text, "hello");
        assert_eq!(g.usage.prompt_tokens, 12);
        assert_eq!(g.usage.model, "gpt-4o-mini");
    }
}
