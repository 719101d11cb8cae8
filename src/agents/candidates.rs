use serde::Serialize;

use super::config::{Settings, TaskType};
use super::providers::ProviderId;

/// One (provider, model) slot of a fallback chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Candidate {
    pub provider: ProviderId,
    pub model: String,
}

/// Primary slot for `task_type`: the task override if it names a provider,
/// otherwise the active provider.
pub fn primary_candidate(settings: &Settings, task_type: &TaskType) -> Candidate {
    if let Some(provider) = settings.task_override(task_type).and_then(|o| o.provider) {
        let model = settings
            .task_override(task_type)
            .and_then(|o| o.model.as_deref())
            .map(str::trim)
            .filter(|m| !m.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| settings.model_for(provider));
        return Candidate { provider, model };
    }
    Candidate {
        provider: settings.active_provider,
        model: settings.model_for(settings.active_provider),
    }
}

/// Ordered chain for one call. Disabled or keyless providers are kept here
/// and skipped at attempt time.
pub fn build_candidates(settings: &Settings, task_type: &TaskType) -> Vec<Candidate> {
    let primary = primary_candidate(settings, task_type);
    let mut candidates = vec![primary.clone()];
    if !settings.use_fallback {
        return candidates;
    }
    candidates.extend(
        settings
            .fallback_providers()
            .into_iter()
            .filter(|provider| *provider != primary.provider)
            .map(|provider| Candidate {
                provider,
                model: settings.model_for(provider),
            }),
    );
    candidates
}
