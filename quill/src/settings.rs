// quill/src/settings.rs
//! Persisted generation settings (the job configuration document).

use crate::store::KeyValueStore;
use serde::{Deserialize, Serialize};

/// Store key of the settings document.
pub const SETTINGS_KEY: &str = "generation_settings";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GenerationSettings {
    /// Model override; `None` uses the backend's configured model.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            model: None,
            temperature: 0.7,
            max_tokens: 4096,
        }
    }
}

/// Load settings, falling back to defaults when the store is absent, the
/// document is missing, or it cannot be decoded.
pub fn load(store: Option<&dyn KeyValueStore>) -> GenerationSettings {
    let Some(store) = store else {
        return GenerationSettings::default();
    };
    match store.get(SETTINGS_KEY) {
        Ok(Some(value)) => serde_json::from_value(value).unwrap_or_else(|err| {
            tracing::warn!(error = %err, "ignoring unreadable generation settings");
            GenerationSettings::default()
        }),
        Ok(None) => GenerationSettings::default(),
        Err(err) => {
            tracing::warn!(error = %err, "generation settings unavailable, using defaults");
            GenerationSettings::default()
        }
    }
}

/// Persist settings. A missing or failing store is logged and ignored.
pub fn save(store: Option<&dyn KeyValueStore>, settings: &GenerationSettings) {
    let Some(store) = store else {
        return;
    };
    let result = serde_json::to_value(settings)
        .map_err(crate::Error::from)
        .and_then(|value| store.set(SETTINGS_KEY, &value));
    if let Err(err) = result {
        tracing::warn!(error = %err, "failed to persist generation settings");
    }
}
