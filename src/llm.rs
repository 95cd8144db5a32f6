//! LLM provider client for embeddings and chat generation.
//!
//! Both capabilities talk to an Ollama server over HTTP and are keyed by a
//! model name. Every call runs under the configured hard deadline; deadline
//! expiry yields [`LlmError::Timeout`], which callers map to the `timeout`
//! failure category, distinct from any other failure.
//!
//! The pipelines depend on the [`Embedder`] and [`ChatModel`] traits rather
//! than the concrete client so tests can inject fakes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Errors from LLM operations. `Timeout` is deliberately its own variant:
/// processing outcomes record it as a distinct failure category.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("{operation} timed out after {timeout:?}")]
    Timeout { operation: String, timeout: Duration },

    #[error("{operation}: empty response")]
    EmptyResponse { operation: String },

    #[error("{operation}: no inputs provided")]
    EmptyInput { operation: String },

    #[error("{operation}: {message}")]
    Api { operation: String, message: String },
}

impl LlmError {
    /// Whether this error came from a deadline expiry.
    pub fn is_timeout(&self) -> bool {
        matches!(self, LlmError::Timeout { .. })
    }
}

/// A single chat message sent to the generation endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

/// Embedding capability: fixed-dimension vectors for text inputs.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a batch of texts, one vector per input, in input order.
    /// Fails on empty input.
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError>;

    /// The model identifier, recorded alongside stored vectors.
    fn model_name(&self) -> &str;
}

/// Generation capability: free-form text for a chat prompt.
#[async_trait]
pub trait ChatModel: Send + Sync {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError>;
}

/// HTTP client for an Ollama server.
#[derive(Debug, Clone)]
pub struct OllamaClient {
    http: reqwest::Client,
    base_url: String,
    model: String,
    call_timeout: Duration,
}

impl OllamaClient {
    pub fn new(base_url: &str, model: &str, call_timeout: Duration) -> Self {
        OllamaClient {
            http: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            call_timeout,
        }
    }

    async fn with_deadline<T, F>(&self, operation: &str, fut: F) -> Result<T, LlmError>
    where
        F: std::future::Future<Output = Result<T, LlmError>>,
    {
        if self.call_timeout.is_zero() {
            return fut.await;
        }
        match tokio::time::timeout(self.call_timeout, fut).await {
            Ok(result) => result,
            Err(_) => Err(LlmError::Timeout {
                operation: operation.to_string(),
                timeout: self.call_timeout,
            }),
        }
    }
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    model: &'a str,
    input: &'a [String],
    /// Ask the server to truncate over-long inputs instead of erroring.
    truncate: bool,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embeddings: Vec<Vec<f32>>,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    stream: bool,
}

#[derive(Deserialize)]
struct ChatResponse {
    message: Option<ChatResponseMessage>,
}

#[derive(Deserialize)]
struct ChatResponseMessage {
    content: String,
}

#[async_trait]
impl Embedder for OllamaClient {
    async fn embed_texts(&self, texts: &[String]) -> Result<Vec<Vec<f32>>, LlmError> {
        if texts.is_empty() {
            return Err(LlmError::EmptyInput {
                operation: "embed".to_string(),
            });
        }

        let url = format!("{}/api/embed", self.base_url);
        let request = EmbedRequest {
            model: &self.model,
            input: texts,
            truncate: true,
        };

        let started = std::time::Instant::now();
        tracing::debug!(model = %self.model, inputs = texts.len(), "embedding request");

        let result = self
            .with_deadline("embed", async {
                let resp = self
                    .http
                    .post(&url)
                    .json(&request)
                    .send()
                    .await
                    .map_err(|e| LlmError::Api {
                        operation: "embed".to_string(),
                        message: e.to_string(),
                    })?;

                if !resp.status().is_success() {
                    let status = resp.status();
                    let body = resp.text().await.unwrap_or_default();
                    return Err(LlmError::Api {
                        operation: "embed".to_string(),
                        message: format!("server returned {}: {}", status, body),
                    });
                }

                let body: EmbedResponse = resp.json().await.map_err(|e| LlmError::Api {
                    operation: "embed".to_string(),
                    message: format!("invalid response: {}", e),
                })?;

                if body.embeddings.is_empty() {
                    return Err(LlmError::EmptyResponse {
                        operation: "embed".to_string(),
                    });
                }
                Ok(body.embeddings)
            })
            .await;

        match &result {
            Ok(vectors) => {
                tracing::debug!(
                    model = %self.model,
                    vectors = vectors.len(),
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "embedding complete"
                );
            }
            Err(err) => {
                tracing::warn!(
                    model = %self.model,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    error = %err,
                    "embedding failed"
                );
            }
        }

        result
    }

    fn model_name(&self) -> &str {
        &self.model
    }
}

#[async_trait]
impl ChatModel for OllamaClient {
    async fn generate(&self, messages: &[ChatMessage]) -> Result<String, LlmError> {
        if messages.is_empty() {
            return Err(LlmError::EmptyInput {
                operation: "generate".to_string(),
            });
        }

        let url = format!("{}/api/chat", self.base_url);
        let request = ChatRequest {
            model: &self.model,
            messages,
            stream: false,
        };

        self.with_deadline("generate", async {
            let resp = self
                .http
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| LlmError::Api {
                    operation: "generate".to_string(),
                    message: e.to_string(),
                })?;

            if !resp.status().is_success() {
                let status = resp.status();
                let body = resp.text().await.unwrap_or_default();
                return Err(LlmError::Api {
                    operation: "generate".to_string(),
                    message: format!("server returned {}: {}", status, body),
                });
            }

            let body: ChatResponse = resp.json().await.map_err(|e| LlmError::Api {
                operation: "generate".to_string(),
                message: format!("invalid response: {}", e),
            })?;

            match body.message {
                Some(message) if !message.content.is_empty() => Ok(message.content),
                _ => Err(LlmError::EmptyResponse {
                    operation: "generate".to_string(),
                }),
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_error_is_distinguishable() {
        let err = LlmError::Timeout {
            operation: "embed".to_string(),
            timeout: Duration::from_secs(120),
        };
        assert!(err.is_timeout());
        assert!(err.to_string().contains("timed out"));

        let err = LlmError::Api {
            operation: "embed".to_string(),
            message: "boom".to_string(),
        };
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_embed_rejects_empty_input() {
        let client = OllamaClient::new("http://localhost:1", "m", Duration::from_secs(1));
        let err = client.embed_texts(&[]).await.unwrap_err();
        assert!(matches!(err, LlmError::EmptyInput { .. }));
    }
}
