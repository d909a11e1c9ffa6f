//! OpenAI adapter: answers quiz prompts through the chat completions API.
//!
//! Any OpenAI-compatible endpoint works (`base_url` points at the `/v1` root).

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use qbot_core::{errors::Error, ports::Assistant, Result};

pub const DEFAULT_MODEL: &str = "gpt-4o-mini";
pub const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

#[derive(Clone, Debug)]
pub struct OpenAiAssistant {
    api_key: String,
    model: String,
    base_url: String,
    http: reqwest::Client,
}

impl OpenAiAssistant {
    /// `request_timeout` bounds a single HTTP round trip; the resolver applies
    /// its own deadline on top.
    pub fn new(
        api_key: impl Into<String>,
        model: impl Into<String>,
        base_url: impl Into<String>,
        request_timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| Error::External(format!("openai client build error: {e}")))?;
        Ok(Self {
            api_key: api_key.into(),
            model: model.into(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            http,
        })
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    fn endpoint(&self) -> String {
        format!("{}/chat/completions", self.base_url)
    }
}

#[async_trait]
impl Assistant for OpenAiAssistant {
    async fn ask(&self, prompt: &str) -> Result<String> {
        let resp = self
            .http
            .post(self.endpoint())
            .bearer_auth(&self.api_key)
            .json(&request_body(&self.model, prompt))
            .send()
            .await
            .map_err(|e| Error::Transport(format!("openai request error: {e}")))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            let detail = format!(
                "openai completion failed: {status} {}",
                body.chars().take(200).collect::<String>()
            );
            return Err(match status.as_u16() {
                401 | 403 => Error::Auth(detail),
                429 | 500..=599 => Error::Transport(detail),
                _ => Error::External(detail),
            });
        }

        let v: Value = resp
            .json()
            .await
            .map_err(|e| Error::External(format!("openai json error: {e}")))?;
        let reply = parse_reply(&v)?;
        tracing::debug!(model = %self.model, chars = reply.len(), "assistant replied");
        Ok(reply)
    }
}

fn request_body(model: &str, prompt: &str) -> Value {
    json!({
        "model": model,
        "temperature": 0,
        "messages": [
            {"role": "user", "content": prompt}
        ]
    })
}

fn parse_reply(v: &Value) -> Result<String> {
    let text = v
        .pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string();
    if text.is_empty() {
        return Err(Error::External(
            "openai completion returned empty content".to_string(),
        ));
    }
    Ok(text)
}
