//! Cost estimation from token usage and model pricing.
//!
//! Single source of truth for estimating the dollar cost of a completed
//! call. Rates are matched by model-name substring; arithmetic is done in
//! integer nanodollars to avoid floating-point drift, then rounded to six
//! decimal places of USD.

/// Rate in nanodollars per token (1 USD = 1_000_000_000 nanodollars).
/// $X per 1M tokens = X * 1000 nanodollars per token.
#[derive(Debug, Clone, Copy)]
pub struct ModelRate {
    pub input_nano_per_token: u64,
    pub output_nano_per_token: u64,
}

/// Rate table keyed by model-name substring. First match wins, so more
/// specific names come before their prefixes.
const RATES: &[(&str, ModelRate)] = &[
    (
        "gpt-4o-mini",
        ModelRate {
            input_nano_per_token: 150,
            output_nano_per_token: 600,
        },
    ),
    (
        "gpt-4o",
        ModelRate {
            input_nano_per_token: 2_500,
            output_nano_per_token: 10_000,
        },
    ),
    (
        "gpt-4-turbo",
        ModelRate {
            input_nano_per_token: 10_000,
            output_nano_per_token: 30_000,
        },
    ),
    (
        "claude-3-opus",
        ModelRate {
            input_nano_per_token: 15_000,
            output_nano_per_token: 75_000,
        },
    ),
    (
        "claude-3-5-haiku",
        ModelRate {
            input_nano_per_token: 800,
            output_nano_per_token: 4_000,
        },
    ),
    (
        "claude-3-5-sonnet",
        ModelRate {
            input_nano_per_token: 3_000,
            output_nano_per_token: 15_000,
        },
    ),
    (
        "claude-sonnet-4",
        ModelRate {
            input_nano_per_token: 3_000,
            output_nano_per_token: 15_000,
        },
    ),
    (
        "gemini-2.5-pro",
        ModelRate {
            input_nano_per_token: 1_250,
            output_nano_per_token: 10_000,
        },
    ),
    (
        "gemini-2.5-flash",
        ModelRate {
            input_nano_per_token: 150,
            output_nano_per_token: 600,
        },
    ),
    (
        "llama-3.3-70b",
        ModelRate {
            input_nano_per_token: 120,
            output_nano_per_token: 300,
        },
    ),
    (
        "deepseek",
        ModelRate {
            input_nano_per_token: 270,
            output_nano_per_token: 1_100,
        },
    ),
];

/// Unknown paid models default to $1/1M input, $3/1M output.
const DEFAULT_RATE: ModelRate = ModelRate {
    input_nano_per_token: 1_000,
    output_nano_per_token: 3_000,
};

/// Find the rate for a model by substring match.
pub fn rate_for_model(model: &str) -> ModelRate {
    let lower = model.trim().to_lowercase();
    for (needle, rate) in RATES {
        if lower.contains(needle) {
            return *rate;
        }
    }
    tracing::debug!(model = %model, "Unknown model for cost estimation, using default rate");
    DEFAULT_RATE
}

/// Whether calls through this provider are free regardless of model.
fn provider_is_free(provider: &str) -> bool {
    provider == "ollama" || provider.starts_with("cli-")
}

/// Estimate the USD cost of one call, rounded to six decimal places.
///
/// Free tiers: models tagged `:free`, anything served by the local Ollama
/// instance, and CLI providers (billed by subscription, not per token).
pub fn estimate_cost(provider: &str, model: &str, input_tokens: u64, output_tokens: u64) -> f64 {
    if provider_is_free(provider) || model.contains(":free") {
        return 0.0;
    }

    let rate = rate_for_model(model);
    let cost_nano = input_tokens.saturating_mul(rate.input_nano_per_token)
        + output_tokens.saturating_mul(rate.output_nano_per_token);

    let usd = cost_nano as f64 / 1_000_000_000.0;
    (usd * 1_000_000.0).round() / 1_000_000.0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ollama_is_free() {
        assert_eq!(estimate_cost("ollama", "qwen3:8b", 1_000_000, 1_000_000), 0.0);
    }

    #[test]
    fn test_cli_providers_are_free() {
        assert_eq!(
            estimate_cost("cli-claude", "claude-3-opus", 1_000_000, 500_000),
            0.0
        );
        assert_eq!(estimate_cost("cli-gemini", "gemini-2.5-pro", 10, 10), 0.0);
    }

    #[test]
    fn test_free_model_tag() {
        assert_eq!(
            estimate_cost("openrouter", "meta-llama/llama-3.3-8b-instruct:free", 5_000, 5_000),
            0.0
        );
    }

    #[test]
    fn test_gpt_4o_mini_megatoken() {
        // $0.15/1M input + $0.60/1M output
        let cost = estimate_cost("openrouter", "openai/gpt-4o-mini", 1_000_000, 1_000_000);
        assert!((cost - 0.75).abs() < 1e-9, "got {cost}");
    }

    #[test]
    fn test_specific_rate_beats_prefix() {
        // "gpt-4o-mini" must match before the "gpt-4o" row.
        let mini = rate_for_model("openai/gpt-4o-mini-2024");
        assert_eq!(mini.input_nano_per_token, 150);
        let full = rate_for_model("openai/gpt-4o");
        assert_eq!(full.input_nano_per_token, 2_500);
    }

    #[test]
    fn test_unknown_model_default_rate() {
        // $1/1M input + $3/1M output
        let cost = estimate_cost("openrouter", "vendor/never-heard-of-it", 1_000_000, 1_000_000);
        assert!((cost - 4.0).abs() < 1e-9);
    }

    #[test]
    fn test_six_decimal_rounding() {
        // 7 input tokens of gpt-4o-mini: 7 * 150 nano = 1050 nano = $0.00000105
        // which rounds to $0.000001 at six decimal places.
        let cost = estimate_cost("openrouter", "gpt-4o-mini", 7, 0);
        assert_eq!(cost, 0.000001);
    }
}
