//! Remote AI providers behind one capability: `answer(text, timeout)`.
//!
//! Failures are split in two. Anything that means "the network is not there"
//! (connect refused, DNS, timeout) is a [`AnswerResult::ConnectivityError`]
//! and leaves a queued query untouched. Anything the provider actually said
//! no to (HTTP error status, unusable body) is a
//! [`AnswerResult::ProviderError`] and counts toward the retry ceiling.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde_json::Value;

use super::persona::{persona_prompt, postprocess_response};
use crate::config::{Config, ProviderKind};
use crate::constants::*;
use crate::store::Store;

/// Outcome of one provider call.
#[derive(Debug, Clone, PartialEq)]
pub enum AnswerResult {
    Success(String),
    ProviderError(String),
    ConnectivityError,
}

#[async_trait]
pub trait AiGateway: Send + Sync {
    async fn answer(&self, text: &str, timeout: Duration) -> AnswerResult;

    /// Short provider label for status output.
    fn name(&self) -> &str;
}

/// OpenAI chat completions.
pub struct OpenAiGateway {
    client: Client,
    api_key: String,
    model: String,
    persona: String,
}

impl OpenAiGateway {
    pub fn new(api_key: String, model: Option<String>, user_name: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_OPENAI_MODEL.to_string()),
            persona: persona_prompt(user_name),
        }
    }
}

#[async_trait]
impl AiGateway for OpenAiGateway {
    async fn answer(&self, text: &str, timeout: Duration) -> AnswerResult {
        let body = serde_json::json!({
            "model": self.model,
            "temperature": PROVIDER_TEMPERATURE,
            "messages": [
                {"role": "system", "content": self.persona},
                {"role": "user", "content": text},
            ],
        });

        let request = self
            .client
            .post(OPENAI_CHAT_URL)
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body);

        let data = match send_json(request).await {
            Ok(data) => data,
            Err(result) => return result,
        };

        match data
            .pointer("/choices/0/message/content")
            .and_then(|c| c.as_str())
        {
            Some(content) => finish(content),
            None => AnswerResult::ProviderError("response had no message content".to_string()),
        }
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Hugging Face hosted inference.
pub struct HuggingFaceGateway {
    client: Client,
    api_key: String,
    model: String,
    persona: String,
}

impl HuggingFaceGateway {
    pub fn new(api_key: String, model: Option<String>, user_name: &str) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_HUGGINGFACE_MODEL.to_string()),
            persona: persona_prompt(user_name),
        }
    }
}

#[async_trait]
impl AiGateway for HuggingFaceGateway {
    async fn answer(&self, text: &str, timeout: Duration) -> AnswerResult {
        let body = serde_json::json!({
            "inputs": format!("{}\n\nUser: {}\nAssistant:", self.persona, text),
            "parameters": {
                "max_new_tokens": HF_MAX_NEW_TOKENS,
                "temperature": PROVIDER_TEMPERATURE,
                "return_full_text": false,
            },
        });

        let request = self
            .client
            .post(format!("{}/{}", HUGGINGFACE_INFERENCE_URL, self.model))
            .bearer_auth(&self.api_key)
            .timeout(timeout)
            .json(&body);

        let data = match send_json(request).await {
            Ok(data) => data,
            Err(result) => return result,
        };

        match extract_generated_text(&data) {
            Some(generated) => finish(generated),
            None => AnswerResult::ProviderError("response had no generated_text".to_string()),
        }
    }

    fn name(&self) -> &str {
        "huggingface"
    }
}

/// The inference API answers either `[{"generated_text": ..}]` or a bare object.
fn extract_generated_text(data: &Value) -> Option<&str> {
    let item = match data {
        Value::Array(items) => items.first()?,
        other => other,
    };
    item.get("generated_text").and_then(|t| t.as_str())
}

fn finish(raw: &str) -> AnswerResult {
    let text = postprocess_response(raw);
    if text.is_empty() {
        AnswerResult::ProviderError("provider returned an empty answer".to_string())
    } else {
        AnswerResult::Success(text)
    }
}

/// Send and decode, classifying every failure into an [`AnswerResult`].
async fn send_json(request: reqwest::RequestBuilder) -> Result<Value, AnswerResult> {
    let response = request.send().await.map_err(|e| classify_transport(&e))?;

    let status = response.status();
    if !status.is_success() {
        let body_text = response.text().await.unwrap_or_default();
        return Err(AnswerResult::ProviderError(status_message(
            status.as_u16(),
            &body_text,
        )));
    }

    response.json::<Value>().await.map_err(|e| classify_body(&e))
}

/// A body that stopped arriving is a connectivity failure; a body that
/// arrived but does not decode is the provider's fault.
fn classify_body(e: &reqwest::Error) -> AnswerResult {
    let cut_off = e.is_timeout() || e.is_body() || (e.is_decode() && !caused_by_json(e));
    if cut_off {
        tracing::debug!(error = %e, "connection lost while reading provider response");
        AnswerResult::ConnectivityError
    } else {
        AnswerResult::ProviderError(format!("malformed response body: {}", e))
    }
}

fn caused_by_json(e: &reqwest::Error) -> bool {
    let mut source = std::error::Error::source(e);
    while let Some(err) = source {
        if err.is::<serde_json::Error>() {
            return true;
        }
        source = err.source();
    }
    false
}

fn classify_transport(e: &reqwest::Error) -> AnswerResult {
    if e.is_connect() || e.is_timeout() || e.is_request() {
        tracing::debug!(error = %e, "provider unreachable");
        AnswerResult::ConnectivityError
    } else {
        AnswerResult::ProviderError(e.to_string())
    }
}

fn status_message(status: u16, body: &str) -> String {
    match status {
        401 => "Authentication failed (401). Check the provider API key.".to_string(),
        403 => "Access forbidden (403). The key may not have access to this model.".to_string(),
        429 => "Rate limited (429).".to_string(),
        _ => format!(
            "API error {}: {}",
            status,
            crate::utils::truncate_str(body, 300)
        ),
    }
}

/// Provider API key: environment first, then the settings table.
pub fn discover_api_key(kind: ProviderKind, store: &Store) -> Option<String> {
    let (env_var, setting) = match kind {
        ProviderKind::OpenAi => ("OPENAI_API_KEY", SETTING_OPENAI_KEY),
        ProviderKind::HuggingFace => ("HUGGINGFACE_API_KEY", SETTING_HUGGINGFACE_KEY),
        ProviderKind::None => return None,
    };

    if let Ok(key) = std::env::var(env_var) {
        if !key.is_empty() {
            return Some(key);
        }
    }

    match store.get_setting::<String>(setting) {
        Ok(Some(key)) if !key.is_empty() => Some(key),
        Ok(_) => None,
        Err(e) => {
            tracing::warn!(error = %e, "could not read stored API key");
            None
        }
    }
}

/// Build the configured provider. `None` means everything stays local and
/// queued questions remain pending.
pub fn gateway_from_config(config: &Config, store: &Store) -> Option<Arc<dyn AiGateway>> {
    let kind = config.provider.kind;
    if kind == ProviderKind::None {
        return None;
    }
    let Some(key) = discover_api_key(kind, store) else {
        tracing::info!(provider = ?kind, "no API key found, running without a remote provider");
        return None;
    };
    let model = config.provider.model.clone();
    let gateway: Arc<dyn AiGateway> = match kind {
        ProviderKind::OpenAi => Arc::new(OpenAiGateway::new(key, model, &config.user_name)),
        ProviderKind::HuggingFace => {
            Arc::new(HuggingFaceGateway::new(key, model, &config.user_name))
        }
        ProviderKind::None => return None,
    };
    Some(gateway)
}
