// quill/src/config.rs
//!
//! Engine configuration.
//!
//! Resolution order: built-in defaults, then an optional TOML file, then
//! environment overrides (`QUILL_API_BASE`, `QUILL_MODEL`, `QUILL_DATA_DIR`).

use crate::pricing::PriceTable;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

const APP_DIR: &str = "quill";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub api_base: String,
    /// Name of the environment variable holding the API key.
    pub api_key_env: String,
    pub model: String,
    pub request_timeout_secs: u64,
    pub data_dir: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub price_catalog: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            api_base: "https://api.deepseek.com/v1".to_string(),
            api_key_env: "DEEPSEEK_API_KEY".to_string(),
            model: "deepseek-chat".to_string(),
            request_timeout_secs: 120,
            data_dir: default_data_dir(),
            price_catalog: None,
        }
    }
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .map(|dir| dir.join(APP_DIR))
        .unwrap_or_else(|| PathBuf::from(".").join(APP_DIR))
}

impl EngineConfig {
    /// Default config file location (`<config dir>/quill/config.toml`).
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(APP_DIR).join("config.toml"))
    }

    /// Load configuration.
    ///
    /// An explicit `path` must exist. Without one, the default location is
    /// used if present and silently skipped otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load_from_path(path)?,
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(default) => Self::load_from_path(&default)?,
                None => Self::default(),
            },
        };
        config.apply_overrides(|name| std::env::var(name).ok());
        Ok(config)
    }

    pub fn load_from_path(path: &Path) -> Result<Self> {
        let toml_str = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config from {}", path.display()))?;
        Self::load_from_str(&toml_str)
            .with_context(|| format!("Invalid config in {}", path.display()))
    }

    pub fn load_from_str(toml_str: &str) -> Result<Self> {
        toml::from_str(toml_str).context("Failed to parse config TOML")
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(api_base) = lookup("QUILL_API_BASE").filter(|v| !v.trim().is_empty()) {
            self.api_base = api_base;
        }
        if let Some(model) = lookup("QUILL_MODEL").filter(|v| !v.trim().is_empty()) {
            self.model = model;
        }
        if let Some(dir) = lookup("QUILL_DATA_DIR").filter(|v| !v.trim().is_empty()) {
            self.data_dir = PathBuf::from(dir);
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.data_dir.join("quill.sqlite")
    }

    /// API key from the configured environment variable, if set.
    pub fn api_key(&self) -> Option<String> {
        std::env::var(&self.api_key_env)
            .ok()
            .filter(|key| !key.trim().is_empty())
    }

    /// The configured price table, or the built-in one.
    pub fn price_table(&self) -> Result<PriceTable> {
        match &self.price_catalog {
            Some(path) => PriceTable::load_from_path(path),
            None => Ok(PriceTable::built_in()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn partial_file_keeps_defaults() {
        let config = EngineConfig::load_from_str(
            r#"
model = "deepseek-reasoner"
request_timeout_secs = 30
"#,
        )
        .unwrap();
        assert_eq!(config.model, "deepseek-reasoner");
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.api_base, EngineConfig::default().api_base);
        assert!(config.price_catalog.is_none());
    }

    #[test]
    fn environment_overrides_file() {
        let env = HashMap::from([
            ("QUILL_MODEL", "override-model"),
            ("QUILL_DATA_DIR", "/tmp/quill-test"),
            ("QUILL_API_BASE", "  "),
        ]);
        let mut config = EngineConfig::default();
        config.apply_overrides(|name| env.get(name).map(|v| v.to_string()));
        assert_eq!(config.model, "override-model");
        assert_eq!(config.data_dir, PathBuf::from("/tmp/quill-test"));
        assert_eq!(config.api_base, EngineConfig::default().api_base);
        assert_eq!(
            config.database_path(),
            PathBuf::from("/tmp/quill-test/quill.sqlite")
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(EngineConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn price_table_from_catalog_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("prices.toml");
        std::fs::write(
            &path,
            "default_model = \"m\"\n[models.m]\ninput_per_million = 2.0\noutput_per_million = 4.0\n",
        )
        .unwrap();
        let config = EngineConfig {
            price_catalog: Some(path),
            ..EngineConfig::default()
        };
        let table = config.price_table().unwrap();
        assert_eq!(table.default_model(), "m");
    }
}
