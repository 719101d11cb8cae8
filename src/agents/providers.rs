//! Static catalogue of the completion providers the engine can talk to.

use std::fmt;
use std::str::FromStr;

use anyhow::anyhow;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderId {
    Anthropic,
    OpenAi,
    OpenRouter,
}

/// Request/response shape spoken by a provider.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireFamily {
    /// Separate `system` field, `content[0].text`, `input_tokens`/`output_tokens`.
    Messages,
    /// Flat message array, `choices[0].message.content`, `prompt_tokens`/`completion_tokens`.
    ChatCompletions,
}

pub struct ProviderSeed {
    pub id: ProviderId,
    pub display: &'static str,
    pub family: WireFamily,
    pub base_url: &'static str,
    pub default_model: &'static str,
    pub env_key: &'static str,
}

pub const PROVIDER_SEEDS: &[ProviderSeed] = &[
    ProviderSeed {
        id: ProviderId::Anthropic,
        display: "Anthropic",
        family: WireFamily::Messages,
        base_url: "https://api.anthropic.com",
        default_model: "claude-haiku-4-5",
        env_key: "ANTHROPIC_API_KEY",
    },
    ProviderSeed {
        id: ProviderId::OpenAi,
        display: "OpenAI",
        family: WireFamily::ChatCompletions,
        base_url: "https://api.openai.com",
        default_model: "gpt-4o-mini",
        env_key: "OPENAI_API_KEY",
    },
    ProviderSeed {
        id: ProviderId::OpenRouter,
        display: "OpenRouter",
        family: WireFamily::ChatCompletions,
        base_url: "https://openrouter.ai/api",
        default_model: "openai/gpt-4o-mini",
        env_key: "OPENROUTER_API_KEY",
    },
];

impl ProviderId {
    pub const ALL: [ProviderId; 3] = [
        ProviderId::Anthropic,
        ProviderId::OpenAi,
        ProviderId::OpenRouter,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Anthropic => "anthropic",
            Self::OpenAi => "openai",
            Self::OpenRouter => "openrouter",
        }
    }

    pub fn seed(&self) -> &'static ProviderSeed {
        // PROVIDER_SEEDS holds one entry per variant, in declaration order.
        &PROVIDER_SEEDS[*self as usize]
    }

    pub fn default_model(&self) -> &'static str {
        self.seed().default_model
    }

    pub fn env_key(&self) -> &'static str {
        self.seed().env_key
    }

    pub fn family(&self) -> WireFamily {
        self.seed().family
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderId {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "anthropic" => Ok(Self::Anthropic),
            "openai" => Ok(Self::OpenAi),
            "openrouter" => Ok(Self::OpenRouter),
            other => Err(anyhow!("Unknown AI provider: {other}")),
        }
    }
}
