// quill/src/pricing.rs
//!
//! Price table: per-model prices used to turn token counts into cost.
//!
//! Prices are USD per million tokens, split into input (prompt) and output
//! (completion). Unknown model ids are charged at the designated default
//! model's prices. The built-in table can be replaced by a TOML file:
//!
//! ```toml
//! default_model = "deepseek-chat"
//!
//! [models.deepseek-chat]
//! input_per_million = 0.27
//! output_per_million = 1.10
//! ```

use anyhow::{anyhow, Context, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

/// Prices for one model, USD per million tokens.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ModelPrice {
    pub input_per_million: f64,
    pub output_per_million: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RawPriceTable {
    default_model: String,
    models: HashMap<String, ModelPrice>,
}

#[derive(Debug, Clone)]
pub struct PriceTable {
    default_model: String,
    models: HashMap<String, ModelPrice>,
}

static BUILT_IN: Lazy<PriceTable> = Lazy::new(|| {
    let models = HashMap::from([
        (
            "deepseek-chat".to_string(),
            ModelPrice {
                input_per_million: 0.27,
                output_per_million: 1.10,
            },
        ),
        (
            "deepseek-reasoner".to_string(),
            ModelPrice {
                input_per_million: 0.55,
                output_per_million: 2.19,
            },
        ),
    ]);
    PriceTable {
        default_model: "deepseek-chat".to_string(),
        models,
    }
});

impl PriceTable {
    /// The table compiled into the binary.
    pub fn built_in() -> Self {
        BUILT_IN.clone()
    }

    /// Load a table from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read price table from {}", path.display()))?;
        Self::load_from_str(&toml_str)
            .with_context(|| format!("Invalid price table in {}", path.display()))
    }

    /// Load a table from a TOML string
    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        let raw: RawPriceTable =
            toml::from_str(toml_str).context("Failed to parse price table TOML")?;

        if !raw.models.contains_key(&raw.default_model) {
            return Err(anyhow!(
                "default model '{}' has no price entry",
                raw.default_model
            ));
        }
        for (id, price) in &raw.models {
            let valid = |p: f64| p.is_finite() && p >= 0.0;
            if !valid(price.input_per_million) || !valid(price.output_per_million) {
                return Err(anyhow!("model '{}' has an invalid price", id));
            }
        }

        Ok(Self {
            default_model: raw.default_model,
            models: raw.models,
        })
    }

    pub fn default_model(&self) -> &str {
        &self.default_model
    }

    /// Prices for `model_id`, or the default model's prices if it is unknown.
    pub fn price_for(&self, model_id: &str) -> ModelPrice {
        match self.models.get(model_id) {
            Some(price) => *price,
            None => {
                tracing::debug!(
                    model = model_id,
                    default_model = %self.default_model,
                    "unknown model, charging default prices"
                );
                self.models
                    .get(&self.default_model)
                    .copied()
                    .unwrap_or(ModelPrice {
                        input_per_million: 0.0,
                        output_per_million: 0.0,
                    })
            }
        }
    }

    /// Calculate USD cost for a model and token counts
    pub fn cost(&self, model_id: &str, input_tokens: u64, output_tokens: u64) -> f64 {
        let price = self.price_for(model_id);
        (input_tokens as f64 / 1_000_000.0) * price.input_per_million
            + (output_tokens as f64 / 1_000_000.0) * price.output_per_million
    }

    pub fn knows(&self, model_id: &str) -> bool {
        self.models.contains_key(model_id)
    }
}

impl Default for PriceTable {
    fn default() -> Self {
        Self::built_in()
    }
}
