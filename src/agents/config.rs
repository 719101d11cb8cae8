use std::collections::BTreeMap;
use std::fmt;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64_ENGINE;
use base64::Engine;
use rusqlite::{params, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use serde_json::json;
use time::OffsetDateTime;
use tokio::task::spawn_blocking;

use super::providers::ProviderId;
use crate::db::DbPool;
use crate::logging::AuditEvent;

/// Caller supplied tag used to pick a provider/model override.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct TaskType(String);

impl TaskType {
    pub const OTHER: &'static str = "other";
    pub const SUMMARY: &'static str = "summary";
    pub const REPLY: &'static str = "reply";

    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into().trim().to_ascii_lowercase();
        if value.is_empty() {
            Self::default()
        } else {
            Self(value)
        }
    }

    pub fn summary() -> Self {
        Self(Self::SUMMARY.to_string())
    }

    pub fn reply() -> Self {
        Self(Self::REPLY.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for TaskType {
    fn default() -> Self {
        Self(Self::OTHER.to_string())
    }
}

impl From<String> for TaskType {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<TaskType> for String {
    fn from(value: TaskType) -> Self {
        value.0
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProviderSettings {
    pub enabled: bool,
    pub api_key: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskOverride {
    pub provider: Option<ProviderId>,
    pub model: Option<String>,
}

impl TaskOverride {
    fn is_empty(&self) -> bool {
        self.provider.is_none() && self.model.is_none()
    }
}

/// The singleton configuration record. Always read fresh; never cache it.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    pub is_enabled: bool,
    pub active_provider: ProviderId,
    pub anthropic: ProviderSettings,
    pub openai: ProviderSettings,
    pub openrouter: ProviderSettings,
    pub task_overrides: BTreeMap<String, TaskOverride>,
    pub use_fallback: bool,
    pub fallback_order: String,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Default for Settings {
    /// Mirrors the column defaults of `ai_settings`.
    fn default() -> Self {
        Self {
            is_enabled: false,
            active_provider: ProviderId::Anthropic,
            anthropic: ProviderSettings {
                enabled: true,
                api_key: None,
                model: None,
            },
            openai: ProviderSettings {
                enabled: false,
                api_key: None,
                model: None,
            },
            openrouter: ProviderSettings {
                enabled: false,
                api_key: None,
                model: None,
            },
            task_overrides: BTreeMap::new(),
            use_fallback: false,
            fallback_order: "anthropic,openai,openrouter".to_string(),
            created_at: 0,
            updated_at: 0,
        }
    }
}

impl Settings {
    pub fn provider(&self, id: ProviderId) -> &ProviderSettings {
        match id {
            ProviderId::Anthropic => &self.anthropic,
            ProviderId::OpenAi => &self.openai,
            ProviderId::OpenRouter => &self.openrouter,
        }
    }

    pub fn provider_mut(&mut self, id: ProviderId) -> &mut ProviderSettings {
        match id {
            ProviderId::Anthropic => &mut self.anthropic,
            ProviderId::OpenAi => &mut self.openai,
            ProviderId::OpenRouter => &mut self.openrouter,
        }
    }

    /// Configured model for `id`, or the provider's catalogue default.
    pub fn model_for(&self, id: ProviderId) -> String {
        non_empty(self.provider(id).model.as_deref())
            .map(str::to_string)
            .unwrap_or_else(|| id.default_model().to_string())
    }

    pub fn task_override(&self, task_type: &TaskType) -> Option<&TaskOverride> {
        self.task_overrides.get(task_type.as_str())
    }

    /// Parsed `fallback_order`. Unknown ids are dropped, duplicates keep
    /// their first position.
    pub fn fallback_providers(&self) -> Vec<ProviderId> {
        parse_provider_list(&self.fallback_order)
    }

    /// Settings key first, then the provider's environment variable.
    pub fn resolve_api_key(
        &self,
        id: ProviderId,
        env_lookup: &(dyn Fn(&str) -> Option<String> + Send + Sync),
    ) -> Option<String> {
        if let Some(key) = non_empty(self.provider(id).api_key.as_deref()) {
            return Some(key.to_string());
        }
        env_lookup(id.env_key())
            .as_deref()
            .and_then(|v| non_empty(Some(v)))
            .map(str::to_string)
    }
}

/// Default environment lookup used outside of tests.
pub fn process_env(name: &str) -> Option<String> {
    std::env::var(name).ok()
}

pub fn parse_provider_list(raw: &str) -> Vec<ProviderId> {
    let mut providers = Vec::new();
    for part in raw.split(',') {
        if part.trim().is_empty() {
            continue;
        }
        match part.parse::<ProviderId>() {
            Ok(id) if !providers.contains(&id) => providers.push(id),
            Ok(_) => {}
            Err(err) => log::warn!("ignoring fallback entry: {err}"),
        }
    }
    providers
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.map(str::trim).filter(|v| !v.is_empty())
}

/// Injected configuration source consulted at the start of every call.
#[async_trait]
pub trait SettingsStore: Send + Sync {
    async fn load(&self) -> Result<Settings>;
}

/// Reads the `ai_settings` row through the shared pool on every call.
#[derive(Clone)]
pub struct SqliteSettingsStore {
    pool: DbPool,
}

impl SqliteSettingsStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl SettingsStore for SqliteSettingsStore {
    async fn load(&self) -> Result<Settings> {
        let pool = self.pool.clone();
        spawn_blocking(move || {
            let conn = pool.get()?;
            get_settings(&conn)
        })
        .await
        .map_err(|err| anyhow!(err.to_string()))?
    }
}

/// Fetch the settings row, creating it with defaults if it does not exist.
pub fn get_settings(conn: &rusqlite::Connection) -> Result<Settings> {
    if let Some(settings) = read_settings(conn)? {
        return Ok(settings);
    }
    let now = OffsetDateTime::now_utc().unix_timestamp();
    conn.execute(
        "INSERT OR IGNORE INTO ai_settings (id, created_at, updated_at) VALUES (1, ?1, ?1)",
        params![now],
    )?;
    log::info!("created default AI settings record");
    read_settings(conn)?.ok_or_else(|| anyhow!("AI settings missing after creation"))
}

fn read_settings(conn: &rusqlite::Connection) -> Result<Option<Settings>> {
    conn.query_row(
        "SELECT is_enabled, active_provider,
                anthropic_enabled, anthropic_api_key, anthropic_model,
                openai_enabled, openai_api_key, openai_model,
                openrouter_enabled, openrouter_api_key, openrouter_model,
                task_overrides_json, use_fallback, fallback_order, created_at, updated_at
         FROM ai_settings WHERE id = 1",
        [],
        map_settings_row,
    )
    .optional()?
    .map(|raw| raw.decode())
    .transpose()
}

struct RawSettings {
    is_enabled: bool,
    active_provider: String,
    providers: [(bool, Option<String>, Option<String>); 3],
    task_overrides_json: String,
    use_fallback: bool,
    fallback_order: String,
    created_at: i64,
    updated_at: i64,
}

fn map_settings_row(row: &Row) -> rusqlite::Result<RawSettings> {
    let provider_at = |offset: usize| -> rusqlite::Result<(bool, Option<String>, Option<String>)> {
        Ok((
            row.get::<_, i64>(offset)? != 0,
            row.get(offset + 1)?,
            row.get(offset + 2)?,
        ))
    };
    Ok(RawSettings {
        is_enabled: row.get::<_, i64>(0)? != 0,
        active_provider: row.get(1)?,
        providers: [provider_at(2)?, provider_at(5)?, provider_at(8)?],
        task_overrides_json: row.get(11)?,
        use_fallback: row.get::<_, i64>(12)? != 0,
        fallback_order: row.get(13)?,
        created_at: row.get(14)?,
        updated_at: row.get(15)?,
    })
}

impl RawSettings {
    fn decode(self) -> Result<Settings> {
        let active_provider = self.active_provider.parse::<ProviderId>()?;
        let stored: BTreeMap<String, TaskOverride> =
            serde_json::from_str(&self.task_overrides_json)
                .context("task overrides are not valid JSON")?;
        // Rows may be written outside `update_settings`; key by normalised task type.
        let task_overrides = stored
            .into_iter()
            .map(|(key, entry)| (String::from(TaskType::new(key)), entry))
            .collect();
        let [anthropic, openai, openrouter] = self.providers;
        let decode_provider = |(enabled, key, model): (bool, Option<String>, Option<String>)| {
            Ok::<_, anyhow::Error>(ProviderSettings {
                enabled,
                api_key: key.map(|k| decode_secret(&k)).transpose()?,
                model,
            })
        };
        Ok(Settings {
            is_enabled: self.is_enabled,
            active_provider,
            anthropic: decode_provider(anthropic)?,
            openai: decode_provider(openai)?,
            openrouter: decode_provider(openrouter)?,
            task_overrides,
            use_fallback: self.use_fallback,
            fallback_order: self.fallback_order,
            created_at: self.created_at,
            updated_at: self.updated_at,
        })
    }
}

fn encode_secret(secret: &str) -> String {
    B64_ENGINE.encode(secret.as_bytes())
}

fn decode_secret(stored: &str) -> Result<String> {
    let decoded = B64_ENGINE
        .decode(stored.as_bytes())
        .map_err(|_| anyhow!("Failed to decode stored credential"))?;
    String::from_utf8(decoded).map_err(|_| anyhow!("Stored credential was not valid UTF-8"))
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProviderUpdate {
    pub enabled: Option<bool>,
    /// Empty (after trimming) clears the stored key.
    pub api_key: Option<String>,
    /// Empty (after trimming) reverts to the provider default.
    pub model: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub is_enabled: Option<bool>,
    pub active_provider: Option<ProviderId>,
    pub anthropic: Option<ProviderUpdate>,
    pub openai: Option<ProviderUpdate>,
    pub openrouter: Option<ProviderUpdate>,
    /// Merged by task type; an entry with neither provider nor model removes it.
    pub task_overrides: Option<BTreeMap<String, TaskOverride>>,
    pub use_fallback: Option<bool>,
    pub fallback_order: Option<String>,
}

/// Apply a partial update to the settings record and return the new state.
pub fn update_settings(conn: &rusqlite::Connection, update: SettingsUpdate) -> Result<Settings> {
    let mut settings = get_settings(conn)?;

    if let Some(enabled) = update.is_enabled {
        settings.is_enabled = enabled;
    }
    if let Some(provider) = update.active_provider {
        settings.active_provider = provider;
    }
    for (id, provider_update) in [
        (ProviderId::Anthropic, update.anthropic),
        (ProviderId::OpenAi, update.openai),
        (ProviderId::OpenRouter, update.openrouter),
    ] {
        let Some(provider_update) = provider_update else {
            continue;
        };
        let target = settings.provider_mut(id);
        if let Some(enabled) = provider_update.enabled {
            target.enabled = enabled;
        }
        if let Some(api_key) = provider_update.api_key {
            target.api_key = non_empty(Some(api_key.as_str())).map(str::to_string);
        }
        if let Some(model) = provider_update.model {
            target.model = non_empty(Some(model.as_str())).map(str::to_string);
        }
    }
    if let Some(overrides) = update.task_overrides {
        for (task, mut entry) in overrides {
            let key = TaskType::new(task);
            entry.model = non_empty(entry.model.as_deref()).map(str::to_string);
            if entry.is_empty() {
                settings.task_overrides.remove(key.as_str());
            } else {
                settings.task_overrides.insert(key.as_str().to_string(), entry);
            }
        }
    }
    if let Some(use_fallback) = update.use_fallback {
        settings.use_fallback = use_fallback;
    }
    if let Some(order) = update.fallback_order {
        settings.fallback_order = parse_provider_list(&order)
            .iter()
            .map(ProviderId::as_str)
            .collect::<Vec<_>>()
            .join(",");
    }

    write_settings(conn, &settings)?;
    get_settings(conn)
}

fn write_settings(conn: &rusqlite::Connection, settings: &Settings) -> Result<()> {
    let now = OffsetDateTime::now_utc().unix_timestamp();
    let key_of = |id: ProviderId| settings.provider(id).api_key.as_deref().map(encode_secret);
    let overrides_json = serde_json::to_string(&settings.task_overrides)?;
    conn.execute(
        "UPDATE ai_settings SET
             is_enabled = ?1, active_provider = ?2,
             anthropic_enabled = ?3, anthropic_api_key = ?4, anthropic_model = ?5,
             openai_enabled = ?6, openai_api_key = ?7, openai_model = ?8,
             openrouter_enabled = ?9, openrouter_api_key = ?10, openrouter_model = ?11,
             task_overrides_json = ?12, use_fallback = ?13, fallback_order = ?14, updated_at = ?15
         WHERE id = 1",
        params![
            settings.is_enabled as i32,
            settings.active_provider.as_str(),
            settings.anthropic.enabled as i32,
            key_of(ProviderId::Anthropic),
            settings.anthropic.model,
            settings.openai.enabled as i32,
            key_of(ProviderId::OpenAi),
            settings.openai.model,
            settings.openrouter.enabled as i32,
            key_of(ProviderId::OpenRouter),
            settings.openrouter.model,
            overrides_json,
            settings.use_fallback as i32,
            settings.fallback_order,
            now,
        ],
    )?;
    Ok(())
}

pub fn audit_settings_change(conn: &rusqlite::Connection, message: &str, fields: Vec<&str>) {
    let event = AuditEvent::info("ai.settings", message)
        .with_code("AI-0001", "AI configuration updated")
        .with_data(json!({ "fields": fields }));
    if let Err(err) = event.record(conn) {
        log::warn!("failed to audit AI settings change: {err}");
    }
}
