//! Model pricing registry.
//!
//! Costs are in nanodollars (1e-9 USD) per token. Used to estimate what a
//! session spent; nothing is enforced from these numbers.

use std::collections::HashMap;
use std::sync::OnceLock;

/// Pricing information for a model.
#[derive(Debug, Clone, Copy)]
pub struct ModelPricing {
    pub input_nanos_per_token: i64,
    pub output_nanos_per_token: i64,
}

impl ModelPricing {
    const fn new(input: i64, output: i64) -> Self {
        Self {
            input_nanos_per_token: input,
            output_nanos_per_token: output,
        }
    }

    pub fn calculate_cost(&self, input_tokens: u32, output_tokens: u32) -> i64 {
        (input_tokens as i64) * self.input_nanos_per_token
            + (output_tokens as i64) * self.output_nanos_per_token
    }
}

// =============================================================================
// PRICING DATA
// =============================================================================

// Llama 3 70B Instruct: $0.59/1M input, $0.79/1M output
const LLAMA_3_70B: ModelPricing = ModelPricing::new(590, 790);
// Llama 3.3 70B Instruct: $0.13/1M input, $0.40/1M output
const LLAMA_33_70B: ModelPricing = ModelPricing::new(130, 400);
// Gemini 2.0 Flash: $0.10/1M input, $0.40/1M output
const GEMINI_20_FLASH: ModelPricing = ModelPricing::new(100, 400);
// Gemini 2.5 Pro: $1.25/1M input, $10.00/1M output
const GEMINI_25_PRO: ModelPricing = ModelPricing::new(1_250, 10_000);
// GPT-4o-mini: $0.15/1M input, $0.60/1M output
const GPT_4O_MINI: ModelPricing = ModelPricing::new(150, 600);
// Claude 3.5 Sonnet: $3.00/1M input, $15.00/1M output
const CLAUDE_35_SONNET: ModelPricing = ModelPricing::new(3_000, 15_000);

static PRICING_MAP: OnceLock<HashMap<&'static str, ModelPricing>> = OnceLock::new();

fn init_pricing() -> HashMap<&'static str, ModelPricing> {
    let mut map = HashMap::new();

    map.insert("meta-llama/llama-3-70b-instruct", LLAMA_3_70B);
    map.insert("llama3-70b-8192", LLAMA_3_70B);
    map.insert("meta-llama/llama-3.3-70b-instruct", LLAMA_33_70B);
    map.insert("google/gemini-2.0-flash-001", GEMINI_20_FLASH);
    map.insert("gemini-2.0-flash", GEMINI_20_FLASH);
    map.insert("google/gemini-2.5-pro", GEMINI_25_PRO);
    map.insert("openai/gpt-4o-mini", GPT_4O_MINI);
    map.insert("anthropic/claude-3.5-sonnet", CLAUDE_35_SONNET);

    map
}

/// Get pricing for a model.
pub fn get_pricing(model_id: &str) -> Option<ModelPricing> {
    let map = PRICING_MAP.get_or_init(init_pricing);
    map.get(model_id).copied()
}

/// Calculate chat cost, falling back to a mid-range price for unknown models.
pub fn chat_cost(model: &str, input_tokens: u32, output_tokens: u32) -> i64 {
    let default = ModelPricing::new(1_000, 5_000);
    let pricing = get_pricing(model).unwrap_or(default);
    pricing.calculate_cost(input_tokens, output_tokens)
}
