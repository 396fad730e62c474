//! A thin LLM backend trait, following the `Driver` trait shape in
//! `drivers/mod.rs`: one production implementation and an `EchoDriver`-style
//! test double.
//!
//! Unlike the teacher's `OpenAiDriver`, our production implementation talks
//! `reqwest` directly rather than going through `async-openai`. The Rate
//! Limiter (`rate_limiter.rs`) needs to read raw `x-ratelimit-*` response
//! headers, and `async-openai`'s client (even via its `byot` escape hatch)
//! doesn't surface them — so we keep `reqwest`, already one of the
//! teacher's own dependencies, and skip the higher-level wrapper.

use std::{fmt, sync::Arc};

use reqwest::{Client, header::HeaderMap};
use tokio::sync::Semaphore;

use crate::{model::LlmConfig, prelude::*};

/// A single LLM call's raw text output, the token usage the backend
/// reported for it, and the response headers the rate limiter needs.
pub struct LlmResponse {
    pub output_text: String,
    pub total_tokens: u32,
    pub headers: HeaderMap,
}

/// An LLM call's failure, carrying whatever response headers were observed
/// even though the call failed — a 429's `x-ratelimit-*` headers are
/// exactly what the rate limiter needs to learn from, and are otherwise
/// lost the moment the call is treated as an error.
#[derive(Debug)]
pub struct LlmCallError {
    pub error: anyhow::Error,
    pub headers: Option<HeaderMap>,
}

impl fmt::Display for LlmCallError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.error, f)
    }
}

impl std::error::Error for LlmCallError {}

/// Talks to whatever backend actually runs the rule prompts.
#[async_trait]
pub trait LlmBackend: Send + Sync {
    /// Send a single rendered prompt and return its raw text output.
    async fn complete(
        &self,
        rendered_prompt: &str,
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmCallError>;
}

/// Calls an OpenAI-compatible `/v1/responses`-shaped endpoint directly via
/// `reqwest`, matching the call the original rule executor makes
/// (`client.responses.create(...)`).
///
/// `reqwest`'s connection pool only bounds idle keep-alive connections
/// (`pool_max_idle_per_host`), not total concurrent connections, so we
/// enforce `Config::max_connections` ourselves with a semaphore around
/// each call.
pub struct HttpLlmBackend {
    client: Client,
    api_base: String,
    api_key: String,
    connections: Arc<Semaphore>,
}

impl HttpLlmBackend {
    pub fn new(
        client: Client,
        api_base: impl Into<String>,
        api_key: impl Into<String>,
        max_connections: usize,
    ) -> Self {
        Self {
            client,
            api_base: api_base.into(),
            api_key: api_key.into(),
            connections: Arc::new(Semaphore::new(max_connections.max(1))),
        }
    }
}

#[async_trait]
impl LlmBackend for HttpLlmBackend {
    #[instrument(skip(self, rendered_prompt), fields(model = %config.model))]
    async fn complete(
        &self,
        rendered_prompt: &str,
        config: &LlmConfig,
    ) -> Result<LlmResponse, LlmCallError> {
        let url = format!("{}/responses", self.api_base);
        let body = json!({
            "model": config.model,
            "input": rendered_prompt,
            "temperature": config.temperature,
            "max_output_tokens": config.max_output_tokens,
            "top_p": config.top_p,
        });

        let _permit = self
            .connections
            .acquire()
            .await
            .expect("connection semaphore is never closed");

        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(|err| LlmCallError {
                error: anyhow::Error::new(err).context("request to LLM backend failed"),
                headers: None,
            })?;

        let headers = response.headers().clone();
        let response = response.error_for_status().map_err(|err| LlmCallError {
            error: anyhow::Error::new(err).context("LLM backend returned an error status"),
            headers: Some(headers.clone()),
        })?;

        let body: Value = response.json().await.map_err(|err| LlmCallError {
            error: anyhow::Error::new(err).context("LLM backend response was not valid JSON"),
            headers: Some(headers.clone()),
        })?;

        let output_text = body
            .get("output_text")
            .and_then(Value::as_str)
            .ok_or_else(|| LlmCallError {
                error: anyhow!("LLM backend response had no 'output_text' field"),
                headers: Some(headers.clone()),
            })?
            .to_string();
        let total_tokens = body
            .get("usage")
            .and_then(|usage| usage.get("total_tokens"))
            .and_then(Value::as_u64)
            .unwrap_or(0) as u32;

        Ok(LlmResponse {
            output_text,
            total_tokens,
            headers,
        })
    }
}

/// A test double that echoes a fixed JSON payload back, so unit and
/// integration tests can exercise the rest of the pipeline without network
/// access.
pub struct EchoLlmBackend {
    response: String,
    total_tokens: u32,
}

impl EchoLlmBackend {
    pub fn new(response: impl Into<String>) -> Self {
        Self {
            response: response.into(),
            total_tokens: 0,
        }
    }

    /// Report `total_tokens` as this call's usage, the way the real backend
    /// would from its `usage.total_tokens` field.
    pub fn with_tokens(response: impl Into<String>, total_tokens: u32) -> Self {
        Self {
            response: response.into(),
            total_tokens,
        }
    }
}

#[async_trait]
impl LlmBackend for EchoLlmBackend {
    async fn complete(
        &self,
        _rendered_prompt: &str,
        _config: &LlmConfig,
    ) -> Result<LlmResponse, LlmCallError> {
        Ok(LlmResponse {
            output_text: self.response.clone(),
            total_tokens: self.total_tokens,
            headers: HeaderMap::new(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_backend_returns_fixed_response() {
        let backend = EchoLlmBackend::with_tokens(r#"{"result": []}"#, 42);
        let response = backend
            .complete("anything", &LlmConfig::default())
            .await
            .unwrap();
        assert_eq!(response.output_text, r#"{"result": []}"#);
        assert_eq!(response.total_tokens, 42);
        assert!(response.headers.is_empty());
    }
}
