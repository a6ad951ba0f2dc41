//! Cost estimation.
//!
//! Prices are USD per 1K tokens, split into prompt and completion rates.
//! The estimator is deliberately rough: prompt tokens are approximated as
//! total message characters divided by four, and the completion side
//! assumes the full `max_tokens` budget (or half the prompt estimate when
//! no budget is given). Unknown models price as `None` and bypass budget
//! gating.

use crate::ChatMessage;

/// Characters per token for the prompt estimate.
const CHARS_PER_TOKEN: u64 = 4;

/// USD per 1K (prompt, completion) tokens.
///
/// Prices last reviewed 2025-01; refresh against provider pricing pages
/// when adding models.
fn price_per_1k(provider: &str, model: &str) -> Option<(f64, f64)> {
    let price = match (provider, model) {
        ("openai", "gpt-4") => (0.03, 0.06),
        ("openai", "gpt-4-turbo") => (0.01, 0.03),
        ("openai", "gpt-4o") => (0.005, 0.015),
        ("openai", "gpt-4o-mini") => (0.00015, 0.0006),
        ("openai", "gpt-3.5-turbo") => (0.0005, 0.0015),
        ("anthropic", "claude-3-opus-20240229") => (0.015, 0.075),
        ("anthropic", "claude-3-sonnet-20240229") => (0.003, 0.015),
        ("anthropic", "claude-3-haiku-20240307") => (0.00025, 0.00125),
        ("anthropic", "claude-3-5-sonnet-20241022") => (0.003, 0.015),
        ("mistral", "mistral-large-latest") => (0.0027, 0.0081),
        ("mistral", "mistral-medium-latest") => (0.0027, 0.0081),
        ("mistral", "mistral-small-latest") => (0.0002, 0.0006),
        _ => return None,
    };
    Some(price)
}

/// Pre-call estimates and realised-cost computation.
pub struct CostEstimator;

impl CostEstimator {
    /// Estimates the worst-case cost of a request.
    ///
    /// Completion cost assumes the full `max_tokens` budget; without one,
    /// half the prompt estimate stands in. Returns `None` for unpriced
    /// models.
    pub fn estimate_cost(
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        max_tokens: Option<u32>,
    ) -> Option<f64> {
        let (prompt_rate, completion_rate) = price_per_1k(provider, model)?;
        let prompt_cost = prompt_tokens as f64 / 1000.0 * prompt_rate;
        let completion_cost = match max_tokens {
            Some(max_tokens) => f64::from(max_tokens) / 1000.0 * completion_rate,
            None => prompt_tokens as f64 * 0.5 / 1000.0 * completion_rate,
        };
        Some(prompt_cost + completion_cost)
    }

    /// Estimates cost straight from the message list using the
    /// chars-per-token heuristic.
    pub fn estimate_from_messages(
        provider: &str,
        model: &str,
        messages: &[ChatMessage],
        max_tokens: Option<u32>,
    ) -> Option<f64> {
        let total_chars: u64 = messages.iter().map(|m| m.content.len() as u64).sum();
        let prompt_tokens = total_chars / CHARS_PER_TOKEN;
        Self::estimate_cost(provider, model, prompt_tokens, max_tokens)
    }

    /// Realised cost from actual token usage.
    pub fn actual_cost(
        provider: &str,
        model: &str,
        prompt_tokens: u64,
        completion_tokens: u64,
    ) -> Option<f64> {
        let (prompt_rate, completion_rate) = price_per_1k(provider, model)?;
        Some(
            prompt_tokens as f64 / 1000.0 * prompt_rate
                + completion_tokens as f64 / 1000.0 * completion_rate,
        )
    }
}
