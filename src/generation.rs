//! Generation service collaborator: the external model that writes the
//! final answer from retrieved context.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use serde::{Deserialize, Serialize};

/// Request envelope handed to a generation client.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    /// Full prompt including the assembled context.
    pub prompt: String,
    /// Sampling temperature; the orchestrator keeps this low.
    pub temperature: f32,
    /// Bounded output length in tokens.
    pub max_tokens: usize,
    /// Nucleus-sampling parameter.
    pub top_p: f32,
}

/// Trait implemented by concrete generation backends. Errors and empty
/// responses are degradable conditions for the caller, never fatal.
pub trait GenerationClient: Send + Sync {
    /// Produces answer text for the request.
    fn generate(&self, request: &GenerationRequest) -> Result<String>;
}

/// Blocking client for an OpenAI-compatible chat-completions endpoint.
pub struct HttpGenerationClient {
    client: Client,
    endpoint: String,
    api_key: String,
    model: String,
}

impl HttpGenerationClient {
    /// Builds a new generation client.
    pub fn new(api_key: String, base_url: String, model: String, timeout: Duration) -> Result<Self> {
        anyhow::ensure!(!api_key.trim().is_empty(), "missing generation API key");
        anyhow::ensure!(!model.trim().is_empty(), "missing generation model name");
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build generation HTTP client")?;
        let endpoint = format!("{}/chat/completions", base_url.trim_end_matches('/'));
        Ok(Self {
            client,
            endpoint,
            api_key,
            model,
        })
    }
}

impl GenerationClient for HttpGenerationClient {
    fn generate(&self, request: &GenerationRequest) -> Result<String> {
        let mut headers = HeaderMap::new();
        let auth = format!("Bearer {}", self.api_key.trim());
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&auth).context("invalid generation API key")?,
        );
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let body = ChatRequest {
            model: &self.model,
            temperature: request.temperature,
            max_tokens: request.max_tokens,
            top_p: request.top_p,
            messages: vec![
                ChatMessage {
                    role: "system",
                    content: "You answer legal questions strictly from the numbered excerpts \
                              supplied in the prompt. Cite excerpts as [n]. If the excerpts do \
                              not answer the question, say so.",
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
        };
        let resp = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(&body)
            .send()
            .context("failed to call generation endpoint")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let text = resp
                .text()
                .unwrap_or_else(|_| "<body unavailable>".to_string());
            bail!("generation endpoint returned {}: {}", status, text);
        }
        let parsed: ChatResponse = resp.json().context("failed to parse generation response")?;
        let answer = parsed
            .choices
            .into_iter()
            .map(|choice| choice.message.content)
            .next()
            .unwrap_or_default();
        Ok(answer)
    }
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    temperature: f32,
    max_tokens: usize,
    top_p: f32,
    messages: Vec<ChatMessage<'a>>,
}

#[derive(Serialize)]
struct ChatMessage<'a> {
    role: &'a str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: AssistantMessage,
}

#[derive(Debug, Deserialize)]
struct AssistantMessage {
    content: String,
}
