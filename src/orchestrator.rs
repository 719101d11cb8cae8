//! Top level completion entry point.
//!
//! Reads the settings record afresh, builds the candidate chain for the
//! request's task type and walks it one provider at a time until an attempt
//! succeeds. Each attempt (never a skip) is recorded through the usage
//! logger before the loop moves on. Callers always receive an [`AiResult`];
//! configuration problems and exhausted chains come back as error results.

use std::sync::Arc;

use anyhow::Result;
use serde::Serialize;

use crate::agents::adapters::{AdapterConfig, AiChatMessage, AiRequest, ProviderAdapters};
use crate::agents::candidates::{build_candidates, Candidate};
use crate::agents::config::{process_env, Settings, SettingsStore, SqliteSettingsStore, TaskType};
use crate::agents::pricing::estimate_cost;
use crate::agents::providers::ProviderId;
use crate::db::DbPool;
use crate::errors::{AiError, ProviderError};
use crate::usage::{now_unix, SqliteUsageLogger, UsageLogEntry, UsageLogger};

const PROBE_PROMPT: &str = "Reply with the single word: ok";

/// Outcome of one logical completion call.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct AiResult {
    pub content: String,
    /// `None` only when no provider was attempted.
    pub provider: Option<ProviderId>,
    pub model: Option<String>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
    pub latency_ms: Option<u64>,
    pub estimated_cost: Option<f64>,
    pub error: Option<String>,
}

impl AiResult {
    fn failed(candidate: Option<Candidate>, error: AiError) -> Self {
        let (provider, model) = match candidate {
            Some(c) => (Some(c.provider), Some(c.model)),
            None => (None, None),
        };
        Self {
            provider,
            model,
            error: Some(error.to_string()),
            ..Self::default()
        }
    }

    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

/// Result of a single-provider connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProbeOutcome {
    pub success: bool,
    pub latency_ms: Option<u64>,
    pub error: Option<String>,
}

impl ProbeOutcome {
    fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            latency_ms: None,
            error: Some(error.into()),
        }
    }
}

pub type EnvLookup = Arc<dyn Fn(&str) -> Option<String> + Send + Sync>;

#[derive(Clone)]
pub struct AiOrchestrator {
    settings: Arc<dyn SettingsStore>,
    adapters: ProviderAdapters,
    usage: Arc<dyn UsageLogger>,
    env_lookup: EnvLookup,
}

impl AiOrchestrator {
    pub fn new(
        settings: Arc<dyn SettingsStore>,
        adapters: ProviderAdapters,
        usage: Arc<dyn UsageLogger>,
    ) -> Self {
        Self {
            settings,
            adapters,
            usage,
            env_lookup: Arc::new(process_env),
        }
    }

    /// SQLite-backed settings and usage log with real HTTP adapters.
    pub fn from_pool(pool: DbPool, config: &AdapterConfig) -> Result<Arc<Self>> {
        let adapters = ProviderAdapters::http(config)?;
        Ok(Arc::new(Self::new(
            Arc::new(SqliteSettingsStore::new(pool.clone())),
            adapters,
            Arc::new(SqliteUsageLogger::new(pool)),
        )))
    }

    /// Replace the environment lookup used for fallback API keys.
    pub fn with_env_lookup(
        mut self,
        lookup: impl Fn(&str) -> Option<String> + Send + Sync + 'static,
    ) -> Self {
        self.env_lookup = Arc::new(lookup);
        self
    }

    pub async fn execute(&self, request: AiRequest) -> AiResult {
        let settings = match self.settings.load().await {
            Ok(settings) => settings,
            Err(err) => {
                log::error!("failed to load AI settings: {err:#}");
                return AiResult::failed(None, AiError::SettingsUnavailable(format!("{err:#}")));
            }
        };
        if !settings.is_enabled {
            return AiResult::failed(None, AiError::Disabled);
        }

        let candidates = build_candidates(&settings, &request.task_type);
        let mut last_failure: Option<(Candidate, ProviderError)> = None;

        for candidate in candidates {
            let Some(api_key) = self.usable_key(&settings, candidate.provider) else {
                log::debug!("skipping {}: disabled or no API key", candidate.provider);
                continue;
            };
            let Some(adapter) = self.adapters.get(candidate.provider) else {
                log::warn!("skipping {}: no adapter registered", candidate.provider);
                continue;
            };

            match adapter.call(&api_key, &candidate.model, &request).await {
                Ok(output) => {
                    let input_tokens = output.input_tokens.unwrap_or(0);
                    let output_tokens = output.output_tokens.unwrap_or(0);
                    let cost = estimate_cost(&candidate.model, input_tokens, output_tokens);
                    self.usage
                        .record(usage_entry(
                            &request,
                            &candidate,
                            input_tokens,
                            output_tokens,
                            cost,
                            Some(output.latency_ms),
                            None,
                        ))
                        .await;
                    log::info!(
                        "AI completion via {} ({}) in {}ms",
                        candidate.provider,
                        candidate.model,
                        output.latency_ms
                    );
                    return AiResult {
                        content: output.content,
                        provider: Some(candidate.provider),
                        model: Some(candidate.model),
                        input_tokens: output.input_tokens,
                        output_tokens: output.output_tokens,
                        latency_ms: Some(output.latency_ms),
                        estimated_cost: Some(cost),
                        error: None,
                    };
                }
                Err(err) => {
                    log::warn!("AI provider attempt failed: {err}");
                    self.usage
                        .record(usage_entry(
                            &request,
                            &candidate,
                            0,
                            0,
                            0.0,
                            None,
                            Some(err.to_string()),
                        ))
                        .await;
                    last_failure = Some((candidate, err));
                }
            }
        }

        match last_failure {
            Some((candidate, err)) => AiResult::failed(Some(candidate), err.into()),
            None => AiResult::failed(None, AiError::NoProvidersConfigured),
        }
    }

    /// Send a fixed prompt to one provider, outside the fallback chain and
    /// without touching the usage log.
    pub async fn test_provider(&self, provider: ProviderId) -> ProbeOutcome {
        let settings = match self.settings.load().await {
            Ok(settings) => settings,
            Err(err) => {
                return ProbeOutcome::failed(
                    AiError::SettingsUnavailable(format!("{err:#}")).to_string(),
                )
            }
        };
        let Some(api_key) = settings.resolve_api_key(provider, self.env_lookup.as_ref()) else {
            return ProbeOutcome::failed(format!("No API key configured for {provider}"));
        };
        let Some(adapter) = self.adapters.get(provider) else {
            return ProbeOutcome::failed(format!("No adapter registered for {provider}"));
        };

        let request = AiRequest {
            max_tokens: Some(16),
            temperature: Some(0.0),
            task_type: TaskType::new("probe"),
            ..AiRequest::new(vec![AiChatMessage::user(PROBE_PROMPT)])
        };
        match adapter
            .call(&api_key, &settings.model_for(provider), &request)
            .await
        {
            Ok(output) => ProbeOutcome {
                success: true,
                latency_ms: Some(output.latency_ms),
                error: None,
            },
            Err(err) => ProbeOutcome::failed(err.to_string()),
        }
    }

    fn usable_key(&self, settings: &Settings, provider: ProviderId) -> Option<String> {
        if !settings.provider(provider).enabled {
            return None;
        }
        settings.resolve_api_key(provider, self.env_lookup.as_ref())
    }
}

fn usage_entry(
    request: &AiRequest,
    candidate: &Candidate,
    input_tokens: u32,
    output_tokens: u32,
    estimated_cost: f64,
    latency_ms: Option<u64>,
    error_message: Option<String>,
) -> UsageLogEntry {
    UsageLogEntry {
        provider: candidate.provider,
        model: candidate.model.clone(),
        task_type: request.task_type.clone(),
        input_tokens,
        output_tokens,
        estimated_cost,
        latency_ms,
        success: error_message.is_none(),
        error_message,
        ticket_id: request.ticket_id.clone(),
        user_id: request.user_id.clone(),
        created_at: now_unix(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use async_trait::async_trait;

    use crate::agents::adapters::{AdapterOutput, ProviderAdapter};

    struct StaticSettings(Mutex<Settings>);

    #[async_trait]
    impl SettingsStore for StaticSettings {
        async fn load(&self) -> Result<Settings> {
            Ok(self.0.lock().unwrap().clone())
        }
    }

    struct FailingSettings;

    #[async_trait]
    impl SettingsStore for FailingSettings {
        async fn load(&self) -> Result<Settings> {
            Err(anyhow::anyhow!("database is locked"))
        }
    }

    #[derive(Default)]
    struct RecordingLogger(Mutex<Vec<UsageLogEntry>>);

    #[async_trait]
    impl UsageLogger for RecordingLogger {
        async fn record(&self, entry: UsageLogEntry) {
            self.0.lock().unwrap().push(entry);
        }
    }

    type Script = Result<AdapterOutput, String>;

    /// Replays canned outcomes and remembers the models it was called with.
    struct ScriptedAdapter {
        provider: ProviderId,
        script: Mutex<VecDeque<Script>>,
        calls: Mutex<Vec<(String, String)>>,
    }

    impl ScriptedAdapter {
        fn new(provider: ProviderId, script: Vec<Script>) -> Arc<Self> {
            Arc::new(Self {
                provider,
                script: Mutex::new(script.into()),
                calls: Mutex::new(Vec::new()),
            })
        }

        fn calls(&self) -> Vec<(String, String)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ProviderAdapter for ScriptedAdapter {
        async fn call(
            &self,
            api_key: &str,
            model: &str,
            _request: &AiRequest,
        ) -> Result<AdapterOutput, ProviderError> {
            self.calls
                .lock()
                .unwrap()
                .push((api_key.to_string(), model.to_string()));
            match self.script.lock().unwrap().pop_front() {
                Some(Ok(output)) => Ok(output),
                Some(Err(body)) => Err(ProviderError::Status {
                    provider: self.provider,
                    status: 500,
                    body,
                }),
                None => panic!("unexpected call to {}", self.provider),
            }
        }
    }

    fn ok(content: &str, input: u32, output: u32) -> Script {
        Ok(AdapterOutput {
            content: content.into(),
            input_tokens: Some(input),
            output_tokens: Some(output),
            latency_ms: 12,
        })
    }

    struct Harness {
        orchestrator: AiOrchestrator,
        logger: Arc<RecordingLogger>,
        anthropic: Arc<ScriptedAdapter>,
        openai: Arc<ScriptedAdapter>,
        openrouter: Arc<ScriptedAdapter>,
    }

    impl Harness {
        fn new(settings: Settings, scripts: [Vec<Script>; 3]) -> Self {
            let [a, o, r] = scripts;
            let anthropic = ScriptedAdapter::new(ProviderId::Anthropic, a);
            let openai = ScriptedAdapter::new(ProviderId::OpenAi, o);
            let openrouter = ScriptedAdapter::new(ProviderId::OpenRouter, r);
            let logger = Arc::new(RecordingLogger::default());
            let adapters = ProviderAdapters::default()
                .with_adapter(ProviderId::Anthropic, anthropic.clone())
                .with_adapter(ProviderId::OpenAi, openai.clone())
                .with_adapter(ProviderId::OpenRouter, openrouter.clone());
            let orchestrator = AiOrchestrator::new(
                Arc::new(StaticSettings(Mutex::new(settings))),
                adapters,
                logger.clone(),
            )
            .with_env_lookup(|_| None);
            Self {
                orchestrator,
                logger,
                anthropic,
                openai,
                openrouter,
            }
        }

        fn entries(&self) -> Vec<UsageLogEntry> {
            self.logger.0.lock().unwrap().clone()
        }

        fn total_calls(&self) -> usize {
            self.anthropic.calls().len() + self.openai.calls().len() + self.openrouter.calls().len()
        }
    }

    fn enabled_settings() -> Settings {
        let mut settings = Settings::default();
        settings.is_enabled = true;
        for id in ProviderId::ALL {
            let provider = settings.provider_mut(id);
            provider.enabled = true;
            provider.api_key = Some(format!("{id}-key"));
        }
        settings
    }

    fn request() -> AiRequest {
        AiRequest {
            ticket_id: Some("T-42".into()),
            user_id: Some("U-7".into()),
            ..AiRequest::new(vec![AiChatMessage::user("hello")]).with_task_type(TaskType::reply())
        }
    }

    #[tokio::test]
    async fn disabled_engine_makes_no_calls_and_no_logs() {
        let mut settings = enabled_settings();
        settings.is_enabled = false;
        let harness = Harness::new(settings, [vec![], vec![], vec![]]);
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.content, "");
        assert_eq!(result.error.as_deref(), Some("AI is disabled"));
        assert_eq!(harness.total_calls(), 0);
        assert!(harness.entries().is_empty());
    }

    #[tokio::test]
    async fn success_records_cost_and_attribution() {
        let harness = Harness::new(enabled_settings(), [vec![ok("hi", 100, 50)], vec![], vec![]]);
        let result = harness.orchestrator.execute(request()).await;
        assert!(result.is_success());
        assert_eq!(result.content, "hi");
        assert_eq!(result.provider, Some(ProviderId::Anthropic));
        assert!((result.estimated_cost.unwrap() - 0.00035).abs() < 1e-12);
        assert_eq!(
            harness.anthropic.calls(),
            vec![("anthropic-key".to_string(), "claude-haiku-4-5".to_string())]
        );

        let entries = harness.entries();
        assert_eq!(entries.len(), 1);
        assert!(entries[0].success);
        assert_eq!(entries[0].input_tokens, 100);
        assert_eq!(entries[0].task_type, TaskType::reply());
        assert_eq!(entries[0].ticket_id.as_deref(), Some("T-42"));
        assert_eq!(entries[0].user_id.as_deref(), Some("U-7"));
    }

    #[tokio::test]
    async fn without_fallback_a_failure_is_final() {
        let harness = Harness::new(enabled_settings(), [vec![Err("down".into())], vec![], vec![]]);
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.content, "");
        assert!(result.error.unwrap().contains("down"));
        assert_eq!(harness.total_calls(), 1);
        assert_eq!(harness.entries().len(), 1);
    }

    #[tokio::test]
    async fn fallback_uses_next_provider_with_its_own_model() {
        let mut settings = enabled_settings();
        settings.use_fallback = true;
        settings.fallback_order = "anthropic,openai".into();
        settings.openai.model = Some("gpt-4.1".into());
        let harness = Harness::new(
            settings,
            [vec![Err("overloaded".into())], vec![ok("from openai", 10, 5)], vec![]],
        );
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.provider, Some(ProviderId::OpenAi));
        assert_eq!(result.model.as_deref(), Some("gpt-4.1"));
        assert_eq!(result.content, "from openai");

        let entries = harness.entries();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].provider, ProviderId::Anthropic);
        assert!(!entries[0].success);
        assert_eq!(entries[0].input_tokens, 0);
        assert!(entries[0].error_message.as_deref().unwrap().contains("overloaded"));
        assert_eq!(entries[1].provider, ProviderId::OpenAi);
        assert!(entries[1].success);
    }

    #[tokio::test]
    async fn skipped_candidates_leave_no_trace() {
        let mut settings = enabled_settings();
        settings.use_fallback = true;
        settings.fallback_order = "openai,openrouter".into();
        settings.openai.enabled = false;
        settings.openrouter.api_key = None;
        let harness = Harness::new(settings, [vec![Err("nope".into())], vec![], vec![]]);
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.provider, Some(ProviderId::Anthropic));
        assert!(result.error.unwrap().contains("nope"));
        assert_eq!(harness.openai.calls().len(), 0);
        assert_eq!(harness.openrouter.calls().len(), 0);
        assert_eq!(harness.entries().len(), 1);
    }

    #[tokio::test]
    async fn disabled_primary_without_fallback_reports_no_providers() {
        let mut settings = enabled_settings();
        settings.anthropic.enabled = false;
        let harness = Harness::new(settings, [vec![], vec![], vec![]]);
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.error.as_deref(), Some("No AI providers configured"));
        assert_eq!(result.provider, None);
        assert_eq!(harness.total_calls(), 0);
        assert!(harness.entries().is_empty());
    }

    #[tokio::test]
    async fn exhausted_chain_returns_last_failure() {
        let mut settings = enabled_settings();
        settings.use_fallback = true;
        settings.fallback_order = "openrouter,openai".into();
        let harness = Harness::new(
            settings,
            [vec![Err("a".into())], vec![Err("b".into())], vec![Err("c".into())]],
        );
        let result = harness.orchestrator.execute(request()).await;
        assert_eq!(result.provider, Some(ProviderId::OpenAi));
        assert_eq!(result.model.as_deref(), Some("gpt-4o-mini"));
        assert_eq!(result.error.as_deref(), Some("openai API error (500): b"));

        let order: Vec<_> = harness.entries().iter().map(|e| e.provider).collect();
        assert_eq!(
            order,
            vec![ProviderId::Anthropic, ProviderId::OpenRouter, ProviderId::OpenAi]
        );
        assert!(harness.entries().iter().all(|e| !e.success));
    }

    #[tokio::test]
    async fn environment_key_makes_provider_usable() {
        let mut settings = enabled_settings();
        settings.anthropic.api_key = None;
        let mut harness = Harness::new(settings, [vec![ok("env", 1, 1)], vec![], vec![]]);
        harness.orchestrator = harness
            .orchestrator
            .with_env_lookup(|name| (name == "ANTHROPIC_API_KEY").then(|| "from-env".into()));
        let result = harness.orchestrator.execute(request()).await;
        assert!(result.is_success());
        assert_eq!(harness.anthropic.calls()[0].0, "from-env");
    }

    #[tokio::test]
    async fn unreadable_settings_become_an_error_result() {
        let orchestrator = AiOrchestrator::new(
            Arc::new(FailingSettings),
            ProviderAdapters::default(),
            Arc::new(RecordingLogger::default()),
        );
        let result = orchestrator.execute(request()).await;
        assert!(result
            .error
            .unwrap()
            .starts_with("AI settings unavailable: database is locked"));
    }

    #[tokio::test]
    async fn probe_ignores_enable_flags_and_skips_usage_log() {
        let mut settings = enabled_settings();
        settings.is_enabled = false;
        settings.openrouter.enabled = false;
        let harness = Harness::new(settings, [vec![], vec![], vec![ok("ok", 3, 1)]]);
        let outcome = harness.orchestrator.test_provider(ProviderId::OpenRouter).await;
        assert!(outcome.success);
        assert_eq!(outcome.latency_ms, Some(12));
        assert!(harness.entries().is_empty());
        assert_eq!(harness.openrouter.calls()[0].1, "openai/gpt-4o-mini");
    }

    #[tokio::test]
    async fn probe_reports_missing_key_and_provider_errors() {
        let mut settings = enabled_settings();
        settings.openai.api_key = None;
        let harness = Harness::new(settings, [vec![Err("bad key".into())], vec![], vec![]]);

        let missing = harness.orchestrator.test_provider(ProviderId::OpenAi).await;
        assert!(!missing.success);
        assert_eq!(missing.error.as_deref(), Some("No API key configured for openai"));

        let failed = harness.orchestrator.test_provider(ProviderId::Anthropic).await;
        assert!(!failed.success);
        assert!(failed.error.unwrap().contains("bad key"));
        assert!(harness.entries().is_empty());
    }
}
