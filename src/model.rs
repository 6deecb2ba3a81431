//! The language-model contract consumed by inference backends.
//!
//! The harness only depends on `query(messages) → assistant message` plus
//! call/cost counters for budget enforcement. Two implementations ship: an
//! OpenAI-compatible HTTP client configured from the environment, and a
//! scripted playback model for deterministic tests and dry runs.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

/// One turn in a model conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        ChatMessage { role: "system".to_string(), content: content.into() }
    }
    pub fn user(content: impl Into<String>) -> Self {
        ChatMessage { role: "user".to_string(), content: content.into() }
    }
    pub fn assistant(content: impl Into<String>) -> Self {
        ChatMessage { role: "assistant".to_string(), content: content.into() }
    }
}

/// Assistant reply plus provider-specific extras.
#[derive(Debug, Clone)]
pub struct ModelResponse {
    pub content: String,
    pub extra: Value,
}

/// Contract every model wrapper satisfies.
pub trait ChatModel {
    fn query(&mut self, messages: &[ChatMessage]) -> Result<ModelResponse>;

    /// Number of completed `query` calls.
    fn n_calls(&self) -> u32;

    /// Accumulated cost in dollars; zero when the provider exposes no pricing.
    fn cost(&self) -> f64;

    /// Identifier recorded in results and summaries.
    fn model_name(&self) -> &str;

    /// Public fields exposed to the agent's prompt templates.
    fn template_vars(&self) -> serde_json::Map<String, Value>;
}

// ---------- OpenAI-compatible HTTP model ----------

const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Chat-completions client for any OpenAI-compatible endpoint.
pub struct OpenAiChatModel {
    model_name: String,
    base_url: String,
    api_key: Option<String>,
    temperature: Option<f64>,
    max_output_tokens: Option<u64>,
    client: reqwest::blocking::Client,
    n_calls: u32,
    total_prompt_tokens: u64,
    total_completion_tokens: u64,
}

#[derive(Debug, Deserialize)]
struct ChatCompletion {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
}

impl OpenAiChatModel {
    /// Configure from the environment: `OPENAI_MODEL`, `OPENAI_BASE_URL`
    /// (or `OPENAI_BASE_URL_RUNNER`), `OPENAI_API_KEY`, `OPENAI_TEMPERATURE`.
    pub fn from_env() -> Result<Self> {
        let model_name = std::env::var("OPENAI_MODEL").unwrap_or_else(|_| "gpt-4".to_string());
        let base_url = std::env::var("OPENAI_BASE_URL_RUNNER")
            .or_else(|_| std::env::var("OPENAI_BASE_URL"))
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let api_key = std::env::var("OPENAI_API_KEY").ok();
        let temperature = std::env::var("OPENAI_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok());

        let client = reqwest::blocking::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("build HTTP client")?;

        info!(model = %model_name, base_url = %base_url, ?temperature, "model client initialized");
        Ok(OpenAiChatModel {
            model_name,
            base_url,
            api_key,
            temperature,
            max_output_tokens: None,
            client,
            n_calls: 0,
            total_prompt_tokens: 0,
            total_completion_tokens: 0,
        })
    }
}

impl ChatModel for OpenAiChatModel {
    fn query(&mut self, messages: &[ChatMessage]) -> Result<ModelResponse> {
        let mut body = json!({
            "model": self.model_name,
            "messages": messages,
        });
        if let Some(temperature) = self.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max) = self.max_output_tokens {
            body["max_completion_tokens"] = json!(max);
        }

        let url = format!("{}/chat/completions", self.base_url.trim_end_matches('/'));
        debug!(url = %url, n_messages = messages.len(), "sending chat completion request");

        let mut request = self.client.post(&url).json(&body);
        if let Some(key) = &self.api_key {
            request = request.bearer_auth(key);
        }
        let response = request.send().context("chat completion request")?;
        let status = response.status();
        let raw: Value = response.json().context("decode chat completion response")?;
        if !status.is_success() {
            anyhow::bail!("chat completion failed with status {status}: {raw}");
        }

        let completion: ChatCompletion =
            serde_json::from_value(raw.clone()).context("parse chat completion")?;
        let content = completion
            .choices
            .first()
            .and_then(|c| c.message.content.clone())
            .unwrap_or_default();

        self.n_calls += 1;
        if let Some(usage) = completion.usage {
            self.total_prompt_tokens += usage.prompt_tokens.unwrap_or(0);
            self.total_completion_tokens += usage.completion_tokens.unwrap_or(0);
        }

        Ok(ModelResponse { content, extra: raw })
    }

    fn n_calls(&self) -> u32 {
        self.n_calls
    }

    fn cost(&self) -> f64 {
        // Pricing is model-dependent; budgets fall back to step limits.
        0.0
    }

    fn model_name(&self) -> &str {
        &self.model_name
    }

    fn template_vars(&self) -> serde_json::Map<String, Value> {
        let mut vars = serde_json::Map::new();
        vars.insert("model_name".to_string(), json!(self.model_name));
        vars.insert("base_url".to_string(), json!(self.base_url));
        vars.insert("temperature".to_string(), json!(self.temperature));
        vars.insert("n_model_calls".to_string(), json!(self.n_calls));
        vars.insert("model_cost".to_string(), json!(self.cost()));
        vars.insert("prompt_tokens".to_string(), json!(self.total_prompt_tokens));
        vars.insert("completion_tokens".to_string(), json!(self.total_completion_tokens));
        vars
    }
}

// ---------- Scripted playback model ----------

/// Plays back a fixed sequence of assistant replies. Used by tests and dry
/// runs to drive backends without a live endpoint.
pub struct ScriptedModel {
    responses: std::collections::VecDeque<String>,
    pub queries: Vec<Vec<ChatMessage>>,
    n_calls: u32,
    cost_per_call: f64,
}

impl ScriptedModel {
    pub fn new(responses: Vec<String>) -> Self {
        ScriptedModel {
            responses: responses.into(),
            queries: Vec::new(),
            n_calls: 0,
            cost_per_call: 0.0,
        }
    }

    /// Attach a synthetic per-call cost so budget paths can be exercised.
    pub fn with_cost_per_call(mut self, cost: f64) -> Self {
        self.cost_per_call = cost;
        self
    }
}

impl ChatModel for ScriptedModel {
    fn query(&mut self, messages: &[ChatMessage]) -> Result<ModelResponse> {
        self.queries.push(messages.to_vec());
        let content = self
            .responses
            .pop_front()
            .context("scripted model ran out of responses")?;
        self.n_calls += 1;
        Ok(ModelResponse { content, extra: Value::Null })
    }

    fn n_calls(&self) -> u32 {
        self.n_calls
    }

    fn cost(&self) -> f64 {
        f64::from(self.n_calls) * self.cost_per_call
    }

    fn model_name(&self) -> &str {
        "scripted"
    }

    fn template_vars(&self) -> serde_json::Map<String, Value> {
        let mut vars = serde_json::Map::new();
        vars.insert("model_name".to_string(), json!("scripted"));
        vars.insert("n_model_calls".to_string(), json!(self.n_calls));
        vars.insert("model_cost".to_string(), json!(self.cost()));
        vars
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_model_plays_back_in_order_and_counts_calls() {
        let mut model = ScriptedModel::new(vec!["first".to_string(), "second".to_string()]);
        let r1 = model.query(&[ChatMessage::user("hi")]).expect("first");
        let r2 = model.query(&[ChatMessage::user("again")]).expect("second");
        assert_eq!(r1.content, "first");
        assert_eq!(r2.content, "second");
        assert_eq!(model.n_calls(), 2);
        assert!(model.query(&[]).is_err());
    }

    #[test]
    fn scripted_model_accumulates_cost() {
        let mut model = ScriptedModel::new(vec!["a".to_string(); 3]).with_cost_per_call(0.5);
        for _ in 0..3 {
            model.query(&[]).expect("reply");
        }
        assert!((model.cost() - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn chat_message_constructors_set_roles() {
        assert_eq!(ChatMessage::system("s").role, "system");
        assert_eq!(ChatMessage::user("u").role, "user");
        assert_eq!(ChatMessage::assistant("a").role, "assistant");
    }
}
