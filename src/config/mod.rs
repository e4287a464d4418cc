//! Application configuration

use std::env;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Model identifiers the chat endpoint is known to accept.
pub const SUPPORTED_MODELS: [&str; 3] = [
    "google/gemma-3n-e4b-it:free",
    "openai/gpt-4o",
    "google/gemini-2.5-pro-preview",
];

/// Default chat completions endpoint (OpenRouter-compatible).
pub const DEFAULT_ENDPOINT: &str = "https://openrouter.ai/api/v1/chat/completions";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Chat completions endpoint URL.
    pub endpoint: String,
    /// Bearer token for the endpoint.
    pub api_token: Option<String>,
    /// Directory for the local state database.
    pub data_dir: PathBuf,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            endpoint: env::var("QUILL_API_URL").unwrap_or_else(|_| DEFAULT_ENDPOINT.into()),
            api_token: env::var("QUILL_API_TOKEN").ok(),
            data_dir: env::var("QUILL_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./data")),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_supported_models() {
        assert_eq!(SUPPORTED_MODELS.len(), 3);
        assert!(SUPPORTED_MODELS.contains(&"openai/gpt-4o"));
    }
}
