use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use super::config::TaskType;
use super::providers::{ProviderId, WireFamily};
use crate::errors::ProviderError;

const DEFAULT_MAX_TOKENS: u32 = 1024;
const DEFAULT_TEMPERATURE: f32 = 0.2;
const ANTHROPIC_VERSION: &str = "2023-06-01";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AiChatMessage {
    pub role: ChatRole,
    pub content: String,
}

impl AiChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: ChatRole::Assistant,
            content: content.into(),
        }
    }
}

/// Normalised request handed to every adapter. `ticket_id` and `user_id`
/// are only carried through to the usage log.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AiRequest {
    pub messages: Vec<AiChatMessage>,
    pub max_tokens: Option<u32>,
    pub temperature: Option<f32>,
    #[serde(default)]
    pub task_type: TaskType,
    pub ticket_id: Option<String>,
    pub user_id: Option<String>,
}

impl AiRequest {
    pub fn new(messages: Vec<AiChatMessage>) -> Self {
        Self {
            messages,
            ..Self::default()
        }
    }

    pub fn with_task_type(mut self, task_type: TaskType) -> Self {
        self.task_type = task_type;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AdapterOutput {
    pub content: String,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: u64,
}

#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn call(
        &self,
        api_key: &str,
        model: &str,
        request: &AiRequest,
    ) -> Result<AdapterOutput, ProviderError>;
}

/// Static HTTP settings shared by the adapters.
#[derive(Debug, Clone)]
pub struct AdapterConfig {
    /// Upper bound for a single attempt, connect to last byte.
    pub timeout: Duration,
    pub user_agent: String,
    pub base_url_overrides: HashMap<ProviderId, String>,
    /// Sent to OpenRouter as `HTTP-Referer`.
    pub app_url: String,
    /// Sent to OpenRouter as `X-Title`.
    pub app_name: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(45),
            user_agent: format!("helpdesk-ai/{}", env!("CARGO_PKG_VERSION")),
            base_url_overrides: HashMap::new(),
            app_url: "https://localhost".to_string(),
            app_name: "Helpdesk AI".to_string(),
        }
    }
}

impl AdapterConfig {
    pub fn with_base_url(mut self, provider: ProviderId, base_url: impl Into<String>) -> Self {
        self.base_url_overrides.insert(provider, base_url.into());
        self
    }

    pub fn base_url(&self, provider: ProviderId) -> String {
        self.base_url_overrides
            .get(&provider)
            .map(|url| url.trim_end_matches('/').to_string())
            .unwrap_or_else(|| provider.seed().base_url.to_string())
    }
}

/// Adapter lookup by provider; the attempt loop only sees this table.
#[derive(Clone, Default)]
pub struct ProviderAdapters {
    adapters: HashMap<ProviderId, Arc<dyn ProviderAdapter>>,
}

impl ProviderAdapters {
    /// Real HTTP adapters for every catalogued provider, sharing one client.
    pub fn http(config: &AdapterConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("failed to construct HTTP client")?;
        let mut adapters = Self::default();
        for provider in ProviderId::ALL {
            let base_url = config.base_url(provider);
            let adapter: Arc<dyn ProviderAdapter> = match provider.family() {
                WireFamily::Messages => Arc::new(AnthropicAdapter::new(client.clone(), base_url)),
                WireFamily::ChatCompletions => {
                    let mut adapter =
                        ChatCompletionsAdapter::new(provider, client.clone(), base_url);
                    if provider == ProviderId::OpenRouter {
                        adapter = adapter
                            .with_header("HTTP-Referer", config.app_url.clone())
                            .with_header("X-Title", config.app_name.clone());
                    }
                    Arc::new(adapter)
                }
            };
            adapters.adapters.insert(provider, adapter);
        }
        Ok(adapters)
    }

    pub fn with_adapter(mut self, provider: ProviderId, adapter: Arc<dyn ProviderAdapter>) -> Self {
        self.adapters.insert(provider, adapter);
        self
    }

    pub fn get(&self, provider: ProviderId) -> Option<&Arc<dyn ProviderAdapter>> {
        self.adapters.get(&provider)
    }
}

/// Family A: Anthropic Messages API.
pub struct AnthropicAdapter {
    client: Client,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, base_url: String) -> Self {
        Self { client, base_url }
    }
}

#[async_trait]
impl ProviderAdapter for AnthropicAdapter {
    async fn call(
        &self,
        api_key: &str,
        model: &str,
        request: &AiRequest,
    ) -> Result<AdapterOutput, ProviderError> {
        let provider = ProviderId::Anthropic;
        let url = format!("{}/v1/messages", self.base_url);
        let (system_prompt, messages) = split_system_prompt(&request.messages);

        let mut payload = Map::new();
        payload.insert("model".into(), json!(model));
        payload.insert(
            "max_tokens".into(),
            json!(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
        );
        if !system_prompt.is_empty() {
            payload.insert("system".into(), Value::String(system_prompt));
        }
        payload.insert("messages".into(), Value::Array(messages));
        payload.insert(
            "temperature".into(),
            json!(request.temperature.unwrap_or(DEFAULT_TEMPERATURE)),
        );

        let builder = self
            .client
            .post(url)
            .header("x-api-key", api_key)
            .header("anthropic-version", ANTHROPIC_VERSION);
        let (body, latency_ms) = send_json(provider, builder, &Value::Object(payload)).await?;

        let content = body
            .get("content")
            .and_then(|c| c.get(0))
            .and_then(|part| part.get("text"))
            .and_then(|text| text.as_str())
            .ok_or_else(|| ProviderError::Decode {
                provider,
                message: "response has no content[0].text".into(),
            })?
            .to_string();
        let usage = body.get("usage");
        Ok(AdapterOutput {
            content,
            input_tokens: usage_field(usage, "input_tokens"),
            output_tokens: usage_field(usage, "output_tokens"),
            latency_ms,
        })
    }
}

/// Family B: OpenAI-style chat completions, shared by OpenAI and OpenRouter.
pub struct ChatCompletionsAdapter {
    provider: ProviderId,
    client: Client,
    base_url: String,
    extra_headers: Vec<(&'static str, String)>,
}

impl ChatCompletionsAdapter {
    pub fn new(provider: ProviderId, client: Client, base_url: String) -> Self {
        Self {
            provider,
            client,
            base_url,
            extra_headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: &'static str, value: String) -> Self {
        self.extra_headers.push((name, value));
        self
    }
}

#[async_trait]
impl ProviderAdapter for ChatCompletionsAdapter {
    async fn call(
        &self,
        api_key: &str,
        model: &str,
        request: &AiRequest,
    ) -> Result<AdapterOutput, ProviderError> {
        let provider = self.provider;
        let url = format!("{}/v1/chat/completions", self.base_url);
        let payload = json!({
            "model": model,
            "messages": request.messages,
            "max_tokens": request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS),
            "temperature": request.temperature.unwrap_or(DEFAULT_TEMPERATURE),
        });

        let mut builder = self.client.post(url).bearer_auth(api_key);
        for (name, value) in &self.extra_headers {
            builder = builder.header(*name, value);
        }
        let (body, latency_ms) = send_json(provider, builder, &payload).await?;

        let content = body
            .get("choices")
            .and_then(|choices| choices.get(0))
            .and_then(|choice| choice.get("message"))
            .and_then(|msg| msg.get("content"))
            .and_then(|val| val.as_str())
            .ok_or_else(|| ProviderError::Decode {
                provider,
                message: "response has no choices[0].message.content".into(),
            })?
            .to_string();
        let usage = body.get("usage");
        Ok(AdapterOutput {
            content,
            input_tokens: usage_field(usage, "prompt_tokens"),
            output_tokens: usage_field(usage, "completion_tokens"),
            latency_ms,
        })
    }
}

/// Dispatch `payload` and return the parsed body with the latency measured
/// from dispatch until the response body has been read. JSON parsing is not
/// counted.
async fn send_json(
    provider: ProviderId,
    builder: RequestBuilder,
    payload: &Value,
) -> Result<(Value, u64), ProviderError> {
    let started = Instant::now();
    let response = builder
        .json(payload)
        .send()
        .await
        .map_err(|err| ProviderError::from_reqwest(provider, err))?;
    let status = response.status();
    let text = response
        .text()
        .await
        .map_err(|err| ProviderError::from_reqwest(provider, err))?;
    let latency_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
    if !status.is_success() {
        return Err(ProviderError::Status {
            provider,
            status: status.as_u16(),
            body: text,
        });
    }
    let body = serde_json::from_str(&text).map_err(|err| ProviderError::Decode {
        provider,
        message: err.to_string(),
    })?;
    Ok((body, latency_ms))
}

fn split_system_prompt(messages: &[AiChatMessage]) -> (String, Vec<Value>) {
    let mut system_prompt = String::new();
    let mut rest = Vec::new();
    for msg in messages {
        match msg.role {
            ChatRole::System => {
                if !system_prompt.is_empty() {
                    system_prompt.push_str("\n\n");
                }
                system_prompt.push_str(&msg.content);
            }
            ChatRole::User | ChatRole::Assistant => rest.push(json!({
                "role": msg.role,
                "content": msg.content,
            })),
        }
    }
    (system_prompt, rest)
}

fn usage_field(usage: Option<&Value>, name: &str) -> Option<u32> {
    usage
        .and_then(|u| u.get(name))
        .and_then(|v| v.as_u64())
        .map(|v| u32::try_from(v).unwrap_or(u32::MAX))
}
