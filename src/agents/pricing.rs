//! Static per-model pricing and cost estimation.
//!
//! Prices are USD per 1,000,000 tokens and drift from the providers' public
//! price lists over time; update the table when they change.

use super::providers::ProviderId;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ModelPrice {
    pub provider: ProviderId,
    pub model: &'static str,
    pub input_per_million: f64,
    pub output_per_million: f64,
}

const fn price(
    provider: ProviderId,
    model: &'static str,
    input_per_million: f64,
    output_per_million: f64,
) -> ModelPrice {
    ModelPrice {
        provider,
        model,
        input_per_million,
        output_per_million,
    }
}

pub const PRICING_TABLE: &[ModelPrice] = &[
    price(ProviderId::Anthropic, "claude-opus-4-1", 15.0, 75.0),
    price(ProviderId::Anthropic, "claude-sonnet-4-5", 3.0, 15.0),
    price(ProviderId::Anthropic, "claude-sonnet-4-0", 3.0, 15.0),
    price(ProviderId::Anthropic, "claude-haiku-4-5", 1.0, 5.0),
    price(ProviderId::Anthropic, "claude-3-5-haiku-latest", 0.8, 4.0),
    price(ProviderId::OpenAi, "gpt-4o", 2.5, 10.0),
    price(ProviderId::OpenAi, "gpt-4o-mini", 0.15, 0.6),
    price(ProviderId::OpenAi, "gpt-4.1", 2.0, 8.0),
    price(ProviderId::OpenAi, "gpt-4.1-mini", 0.4, 1.6),
    price(ProviderId::OpenAi, "gpt-4.1-nano", 0.1, 0.4),
    price(ProviderId::OpenRouter, "anthropic/claude-sonnet-4.5", 3.0, 15.0),
    price(ProviderId::OpenRouter, "anthropic/claude-haiku-4.5", 1.0, 5.0),
    price(ProviderId::OpenRouter, "openai/gpt-4o", 2.5, 10.0),
    price(ProviderId::OpenRouter, "openai/gpt-4o-mini", 0.15, 0.6),
    price(ProviderId::OpenRouter, "meta-llama/llama-3.1-70b-instruct", 0.4, 0.4),
];

pub fn lookup_price(model: &str) -> Option<&'static ModelPrice> {
    PRICING_TABLE.iter().find(|entry| entry.model == model)
}

/// Estimated USD cost of one call. Unknown models cost exactly zero.
pub fn estimate_cost(model: &str, input_tokens: u32, output_tokens: u32) -> f64 {
    match lookup_price(model) {
        Some(entry) => {
            (input_tokens as f64 / 1e6) * entry.input_per_million
                + (output_tokens as f64 / 1e6) * entry.output_per_million
        }
        None => 0.0,
    }
}
