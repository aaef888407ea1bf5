//! Application configuration.
//!
//! Centralizes the settings for the agent service. Everything is loaded
//! from environment variables (with `.env` support for local development)
//! into a single shareable struct.

use std::env;
use tracing::Level;

/// Where the room gateway listens by default.
pub const DEFAULT_GATEWAY_ADDR: &str = "0.0.0.0:3000";

/// Holds all configuration loaded from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub openai_api_key: String,
    pub chat_model: String,
    pub speech_model: String,
    pub speech_voice: String,
    pub api_base: String,
    pub gateway_addr: String,
    pub log_level: Level,
    pub track_wait_secs: u64,
}

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid log level provided for RUST_LOG: {0}")]
    InvalidLogLevel(String),
    #[error("Invalid value for {variable}: {value}")]
    InvalidValue { variable: String, value: String },
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    // *   `OPENAI_API_KEY`: Your secret key for the OpenAI-compatible API. Required.
    // *   `CHAT_MODEL`: (Optional) The conversational model. Defaults to "gpt-4o".
    // *   `SPEECH_MODEL`: (Optional) The TTS model. Defaults to "tts-1".
    // *   `SPEECH_VOICE`: (Optional) The TTS voice. Defaults to "alloy".
    // *   `OPENAI_API_BASE`: (Optional) API base URL, for compatible backends.
    // *   `GATEWAY_ADDR`: (Optional) Bind address for the room gateway.
    // *   `TRACK_WAIT_SECS`: (Optional) Upper bound on one wait for a video track.
    // *   `RUST_LOG`: (Optional) The logging level. Defaults to "INFO".
    pub fn from_env() -> Result<Self, ConfigError> {
        // Load .env if present; ignored otherwise.
        dotenvy::dotenv().ok();

        let openai_api_key = env::var("OPENAI_API_KEY")
            .map_err(|_| ConfigError::MissingVar("OPENAI_API_KEY".to_string()))?;

        // Non-critical variables get sensible defaults.
        let chat_model = env::var("CHAT_MODEL").unwrap_or_else(|_| "gpt-4o".to_string());
        let speech_model = env::var("SPEECH_MODEL").unwrap_or_else(|_| "tts-1".to_string());
        let speech_voice = env::var("SPEECH_VOICE").unwrap_or_else(|_| "alloy".to_string());
        let api_base = env::var("OPENAI_API_BASE")
            .unwrap_or_else(|_| "https://api.openai.com/v1".to_string());
        let gateway_addr =
            env::var("GATEWAY_ADDR").unwrap_or_else(|_| DEFAULT_GATEWAY_ADDR.to_string());

        let track_wait_secs = match env::var("TRACK_WAIT_SECS") {
            Ok(value) => value
                .parse::<u64>()
                .map_err(|_| ConfigError::InvalidValue {
                    variable: "TRACK_WAIT_SECS".to_string(),
                    value,
                })?,
            Err(_) => 10,
        };

        let log_level_str = env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str
            .parse::<Level>()
            .map_err(|_| ConfigError::InvalidLogLevel(log_level_str))?;

        Ok(Self {
            openai_api_key,
            chat_model,
            speech_model,
            speech_voice,
            api_base,
            gateway_addr,
            log_level,
            track_wait_secs,
        })
    }
}
