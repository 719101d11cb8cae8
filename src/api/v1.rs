//! Version 1 of the host-facing command surface.
//!
//! Commands are intentionally thin wrappers that validate input, execute
//! SQLite work on blocking threads, and return JSON-friendly payloads. Errors
//! are flattened to strings for the caller; completions never error and
//! report failures inside [`AiResult`].

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use crate::agents::config::{self, Settings, SettingsUpdate, TaskOverride};
use crate::agents::pricing::PRICING_TABLE;
use crate::agents::providers::{ProviderId, PROVIDER_SEEDS};
use crate::agents::AiRequest;
use crate::db::DbPool;
use crate::orchestrator::{AiOrchestrator, AiResult, ProbeOutcome};
use crate::usage::{self, UsageAggregate, UsageGrouping, UsageLogEntry};

const DEFAULT_RECENT_LIMIT: usize = 50;
const MAX_RECENT_LIMIT: usize = 500;
const DEFAULT_WINDOW_DAYS: i64 = 30;

/// Shared state handed to each command.
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub orchestrator: Arc<AiOrchestrator>,
}

/// Simple health-check endpoint.
pub fn ping() -> serde_json::Value {
    serde_json::json!({
        "ok": true,
        "ts": OffsetDateTime::now_utc().unix_timestamp(),
    })
}

/// Per-provider settings with the key redacted.
#[derive(Debug, Serialize)]
pub struct ProviderView {
    pub id: ProviderId,
    pub display_name: &'static str,
    pub enabled: bool,
    pub has_api_key: bool,
    pub model: Option<String>,
    pub default_model: &'static str,
    pub priced_models: Vec<&'static str>,
}

#[derive(Debug, Serialize)]
pub struct SettingsView {
    pub is_enabled: bool,
    pub active_provider: ProviderId,
    pub providers: Vec<ProviderView>,
    pub task_overrides: BTreeMap<String, TaskOverride>,
    pub use_fallback: bool,
    pub fallback_order: Vec<ProviderId>,
    pub updated_at: i64,
}

impl From<&Settings> for SettingsView {
    fn from(settings: &Settings) -> Self {
        let providers = PROVIDER_SEEDS
            .iter()
            .map(|seed| {
                let provider = settings.provider(seed.id);
                ProviderView {
                    id: seed.id,
                    display_name: seed.display,
                    enabled: provider.enabled,
                    has_api_key: provider
                        .api_key
                        .as_deref()
                        .is_some_and(|k| !k.trim().is_empty()),
                    model: provider.model.clone(),
                    default_model: seed.default_model,
                    priced_models: PRICING_TABLE
                        .iter()
                        .filter(|p| p.provider == seed.id)
                        .map(|p| p.model)
                        .collect(),
                }
            })
            .collect();
        Self {
            is_enabled: settings.is_enabled,
            active_provider: settings.active_provider,
            providers,
            task_overrides: settings.task_overrides.clone(),
            use_fallback: settings.use_fallback,
            fallback_order: settings.fallback_providers(),
            updated_at: settings.updated_at,
        }
    }
}

/// Fetch the current AI settings via a blocking thread.
pub async fn ai_get_settings(state: &ApiState) -> Result<SettingsView, String> {
    let pool = state.db.clone();
    spawn_blocking(move || -> Result<SettingsView, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let settings = config::get_settings(&conn).map_err(|e| e.to_string())?;
        Ok(SettingsView::from(&settings))
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Apply a partial settings update and audit it.
pub async fn ai_update_settings(
    state: &ApiState,
    input: SettingsUpdate,
) -> Result<SettingsView, String> {
    let pool = state.db.clone();
    spawn_blocking(move || -> Result<SettingsView, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let fields = changed_fields(&input);
        let settings = config::update_settings(&conn, input).map_err(|e| e.to_string())?;
        config::audit_settings_change(&conn, "AI settings updated", fields);
        Ok(SettingsView::from(&settings))
    })
    .await
    .map_err(|e| e.to_string())?
}

fn changed_fields(input: &SettingsUpdate) -> Vec<&'static str> {
    [
        ("is_enabled", input.is_enabled.is_some()),
        ("active_provider", input.active_provider.is_some()),
        ("anthropic", input.anthropic.is_some()),
        ("openai", input.openai.is_some()),
        ("openrouter", input.openrouter.is_some()),
        ("task_overrides", input.task_overrides.is_some()),
        ("use_fallback", input.use_fallback.is_some()),
        ("fallback_order", input.fallback_order.is_some()),
    ]
    .into_iter()
    .filter_map(|(name, set)| set.then_some(name))
    .collect()
}

/// Run a completion through the fallback chain.
pub async fn ai_complete(state: &ApiState, input: AiRequest) -> AiResult {
    state.orchestrator.execute(input).await
}

/// Probe one provider's key/model pair.
pub async fn ai_test_provider(state: &ApiState, provider_id: &str) -> Result<ProbeOutcome, String> {
    let provider = provider_id
        .parse::<ProviderId>()
        .map_err(|e| e.to_string())?;
    Ok(state.orchestrator.test_provider(provider).await)
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageStatsInput {
    /// Window start in unix seconds; overrides `days`.
    pub since: Option<i64>,
    /// Window length counted back from now, default 30.
    pub days: Option<i64>,
    pub group_by: Option<UsageGrouping>,
}

#[derive(Debug, Serialize)]
pub struct UsageStatsView {
    pub since: i64,
    pub totals: UsageAggregate,
    pub groups: Vec<UsageAggregate>,
}

/// Aggregate usage over a time window, optionally grouped.
pub async fn ai_usage_stats(
    state: &ApiState,
    input: UsageStatsInput,
) -> Result<UsageStatsView, String> {
    let since = input
        .since
        .unwrap_or_else(|| window_start(OffsetDateTime::now_utc().unix_timestamp(), input.days));
    let pool = state.db.clone();
    spawn_blocking(move || -> Result<UsageStatsView, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        let totals = usage::usage_totals(&conn, since).map_err(|e| e.to_string())?;
        let groups = match input.group_by {
            Some(grouping) => {
                usage::usage_grouped(&conn, since, grouping).map_err(|e| e.to_string())?
            }
            None => Vec::new(),
        };
        Ok(UsageStatsView {
            since,
            totals,
            groups,
        })
    })
    .await
    .map_err(|e| e.to_string())?
}

/// Start of a window `days` long ending at `now`. Oversized windows saturate.
fn window_start(now: i64, days: Option<i64>) -> i64 {
    let days = days.unwrap_or(DEFAULT_WINDOW_DAYS).max(0);
    now.saturating_sub(days.saturating_mul(86_400))
}

/// Most recent usage rows, newest first.
pub async fn ai_recent_usage(
    state: &ApiState,
    limit: Option<usize>,
) -> Result<Vec<UsageLogEntry>, String> {
    let limit = limit.unwrap_or(DEFAULT_RECENT_LIMIT).min(MAX_RECENT_LIMIT);
    let pool = state.db.clone();
    spawn_blocking(move || -> Result<Vec<UsageLogEntry>, String> {
        let conn = pool.get().map_err(|e| e.to_string())?;
        usage::recent_usage(&conn, limit).map_err(|e| e.to_string())
    })
    .await
    .map_err(|e| e.to_string())?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn window_start_defaults_to_thirty_days() {
        assert_eq!(window_start(1_000_000_000, None), 1_000_000_000 - 30 * 86_400);
        assert_eq!(window_start(1_000_000_000, Some(-5)), 1_000_000_000);
    }

    #[test]
    fn huge_window_saturates_instead_of_overflowing() {
        let now = 1_700_000_000;
        assert_eq!(window_start(now, Some(i64::MAX)), now - i64::MAX);
        assert_eq!(window_start(now, Some(i64::MAX / 1000)), now - i64::MAX);
    }
}
