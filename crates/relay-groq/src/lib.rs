//! Groq adapter (OpenAI-compatible chat completions).
//!
//! Without an API key every call fails fast and callers use their local
//! fallbacks.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use relay_core::{
    errors::Error,
    model::{
        client::LanguageModel,
        types::{ChatTurn, Sampling},
    },
    Result,
};

const ENDPOINT: &str = "https://api.groq.com/openai/v1/chat/completions";

#[derive(Clone, Debug)]
pub struct GroqClient {
    api_key: Option<String>,
    model: String,
    http: reqwest::Client,
}

#[derive(Serialize)]
struct WireMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: Vec<WireMessage<'a>>,
    temperature: f32,
    max_tokens: u32,
}

impl GroqClient {
    pub fn new(api_key: Option<String>, model: impl Into<String>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("http client build failed: {e}")))?;
        Ok(Self {
            api_key: api_key.filter(|k| !k.trim().is_empty()),
            model: model.into(),
            http,
        })
    }

    pub fn is_configured(&self) -> bool {
        self.api_key.is_some()
    }
}

#[async_trait]
impl LanguageModel for GroqClient {
    async fn chat(&self, messages: Vec<ChatTurn>, sampling: Sampling) -> Result<String> {
        let Some(key) = self.api_key.as_deref() else {
            return Err(Error::External("GROQ_API_KEY is not set".to_string()));
        };

        let body = ChatRequest {
            model: &self.model,
            messages: messages
                .iter()
                .map(|m| WireMessage {
                    role: m.role.as_str(),
                    content: &m.content,
                })
                .collect(),
            temperature: sampling.temperature,
            max_tokens: sampling.max_tokens,
        };

        let resp = self
            .http
            .post(ENDPOINT)
            .bearer_auth(key)
            .json(&body)
            .send()
            .await
            .map_err(|e| Error::External(format!("groq request error: {e}")))?;

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(Error::External(format!(
                "groq completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            )));
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("groq json error: {e}")))?;

        let text = extract_content(&v)?;
        tracing::debug!(
            model = %self.model,
            chars = text.len(),
            "groq completion received"
        );
        Ok(text)
    }
}

/// Pull `choices[0].message.content` out of a completion response.
fn extract_content(v: &Value) -> Result<String> {
    let text = v
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::trim)
        .unwrap_or("");
    if text.is_empty() {
        let detail = v
            .pointer("/error/message")
            .and_then(Value::as_str)
            .unwrap_or("no content");
        return Err(Error::External(format!("groq returned empty completion: {detail}")));
    }
    Ok(text.to_string())
}
