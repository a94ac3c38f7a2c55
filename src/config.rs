use crate::llm::ollama::GenerateOptions;
use crate::llm::{GeminiAdapter, OllamaClient, TransportConfig};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Get the path to the configuration file
pub fn get_config_path() -> Result<PathBuf> {
    let home =
        dirs::home_dir().ok_or_else(|| anyhow::anyhow!("Could not determine home directory"))?;
    Ok(home.join(".config").join("thinkchat").join("config.json"))
}

fn default_data_dir() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("thinkchat")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    /// Address the HTTP server binds to
    pub listen: String,
    pub ollama_base_url: String,
    pub default_model: String,
    pub temperature: f32,
    pub num_ctx: usize,
    pub num_predict: Option<i64>,
    pub probe_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub idle_timeout_ms: u64,
    pub emit_interval_ms: u64,
    pub synthetic_word_delay_ms: u64,
    pub save_debounce_ms: u64,
    /// Number of previous messages sent as context
    pub history_window: usize,
    pub gemini_base_url: String,
    pub data_dir: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen: "127.0.0.1:3000".to_string(),
            ollama_base_url: OllamaClient::default_base_url(),
            default_model: "deepseek-r1:1.5b".to_string(),
            temperature: 0.7,
            num_ctx: 4096,
            num_predict: None,
            probe_timeout_ms: 5_000,
            request_timeout_ms: 300_000,
            idle_timeout_ms: 30_000,
            emit_interval_ms: 50,
            synthetic_word_delay_ms: 20,
            save_debounce_ms: 2_000,
            history_window: 10,
            gemini_base_url: GeminiAdapter::default_base_url(),
            data_dir: default_data_dir(),
        }
    }
}

impl Config {
    /// Load from the default location; a missing file yields defaults
    pub fn load() -> Result<Self> {
        Self::load_from(&get_config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Invalid config file {}", path.display()))
    }

    pub fn transport_config(&self) -> TransportConfig {
        TransportConfig {
            default_model: self.default_model.clone(),
            ollama_base_url: self.ollama_base_url.clone(),
            options: GenerateOptions {
                temperature: self.temperature,
                num_ctx: self.num_ctx,
                num_predict: self.num_predict,
            },
            probe_timeout: Duration::from_millis(self.probe_timeout_ms),
            request_timeout: Duration::from_millis(self.request_timeout_ms),
            idle_timeout: Duration::from_millis(self.idle_timeout_ms),
            emit_interval: Duration::from_millis(self.emit_interval_ms),
            word_delay: Duration::from_millis(self.synthetic_word_delay_ms),
        }
    }

    pub fn save_debounce(&self) -> Duration {
        Duration::from_millis(self.save_debounce_ms)
    }
}
