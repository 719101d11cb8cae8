pub mod adapters;
pub mod candidates;
pub mod config;
pub mod pricing;
pub mod providers;

pub use adapters::{
    AdapterConfig, AiChatMessage, AiRequest, ChatRole, ProviderAdapter, ProviderAdapters,
};
pub use candidates::{build_candidates, Candidate};
pub use config::{
    Settings, SettingsStore, SettingsUpdate, SqliteSettingsStore, TaskOverride, TaskType,
};
pub use pricing::estimate_cost;
pub use providers::ProviderId;
