use thiserror::Error;

use crate::agents::providers::ProviderId;

/// Terminal conditions of a completion call. These never escape the
/// orchestrator as `Err`; they are folded into an error `AiResult`.
#[derive(Debug, Error)]
pub enum AiError {
    #[error("AI is disabled")] Disabled,
    #[error("No AI providers configured")] NoProvidersConfigured,
    #[error("AI settings unavailable: {0}")] SettingsUnavailable(String),
    #[error(transparent)] Provider(#[from] ProviderError),
}

impl AiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Disabled => "AI-1001",
            Self::NoProvidersConfigured => "AI-1002",
            Self::SettingsUnavailable(_) => "AI-1003",
            Self::Provider(err) => err.code(),
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::Disabled => "The global AI switch is off; no provider was contacted.",
            Self::NoProvidersConfigured => {
                "Every candidate provider is disabled or has no API key."
            }
            Self::SettingsUnavailable(_) => "The AI settings record could not be read.",
            Self::Provider(err) => err.explain(),
        }
    }
}

/// Normalised failure of a single provider attempt.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("{provider} API error ({status}): {body}")]
    Status {
        provider: ProviderId,
        status: u16,
        body: String,
    },
    #[error("{provider} request timed out")]
    Timeout { provider: ProviderId },
    #[error("{provider} request failed: {message}")]
    Transport { provider: ProviderId, message: String },
    #[error("{provider} returned an unreadable response: {message}")]
    Decode { provider: ProviderId, message: String },
}

impl ProviderError {
    pub fn provider(&self) -> ProviderId {
        match self {
            Self::Status { provider, .. }
            | Self::Timeout { provider }
            | Self::Transport { provider, .. }
            | Self::Decode { provider, .. } => *provider,
        }
    }

    pub(crate) fn from_reqwest(provider: ProviderId, err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout { provider }
        } else {
            Self::Transport {
                provider,
                message: err.to_string(),
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Status { .. } => "AI-2001",
            Self::Timeout { .. } => "AI-2002",
            Self::Transport { .. } => "AI-2003",
            Self::Decode { .. } => "AI-2004",
        }
    }
    pub fn explain(&self) -> &'static str {
        match self {
            Self::Status { .. } => "The provider answered with a non-success HTTP status.",
            Self::Timeout { .. } => "The provider did not answer within the attempt timeout.",
            Self::Transport { .. } => "The request could not be delivered to the provider.",
            Self::Decode { .. } => "The provider response body was not the expected JSON.",
        }
    }
}
