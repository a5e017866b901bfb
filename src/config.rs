//! Process configuration.
//!
//! Everything is read from the environment by the embedding layer; none of
//! these values appear in core model state.

use std::path::PathBuf;

/// Runtime configuration resolved once at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Base URL of an OpenAI-compatible chat completions endpoint.
    pub llm_endpoint: String,
    pub llm_api_key: String,
    pub llm_model: String,
    /// Default browser mode for tasks that do not specify one.
    pub default_headless: bool,
    /// HTTP bind address for `serve`.
    pub bind_addr: String,
    /// Root directory for notes, screenshots, and graph snapshots.
    pub output_root: PathBuf,
    /// DevTools endpoint exposed to UI clients, when the browser layer
    /// provides one.
    pub cdp_url: Option<String>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm_endpoint: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o-mini".to_string(),
            default_headless: true,
            bind_addr: "127.0.0.1:8700".to_string(),
            output_root: PathBuf::from("."),
            cdp_url: None,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            llm_endpoint: env_or("LLM_ENDPOINT", &defaults.llm_endpoint),
            llm_api_key: env_or("LLM_API_KEY", ""),
            llm_model: env_or("LLM_MODEL", &defaults.llm_model),
            default_headless: env_flag("BROWSER_HEADLESS", defaults.default_headless),
            bind_addr: env_or("GRAPHPILOT_BIND", &defaults.bind_addr),
            output_root: PathBuf::from(env_or("GRAPHPILOT_OUTPUT_ROOT", ".")),
            cdp_url: std::env::var("GRAPHPILOT_CDP_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
        }
    }
}

fn env_or(key: &str, default: &str) -> String {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_flag(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = AppConfig::default();
        assert!(config.default_headless);
        assert!(config.llm_endpoint.starts_with("https://"));
        assert!(config.cdp_url.is_none());
    }
}
