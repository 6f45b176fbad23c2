use std::path::PathBuf;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing environment variable: {0}")]
    MissingVar(String),
    #[error("Invalid value for environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub gemini_api_key: String,
    pub gemini_model: Option<String>,
    pub gemini_voice: Option<String>,
    pub persistence_url: String,
    pub log_level: Level,
    pub prompts_path: PathBuf,
}

impl Config {
    /// Loads configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }

        let gemini_api_key = std::env::var("GEMINI_API_KEY")
            .ok()
            .filter(|key| !key.trim().is_empty())
            .ok_or_else(|| ConfigError::MissingVar("GEMINI_API_KEY".to_string()))?;

        let gemini_model = std::env::var("GEMINI_MODEL").ok();
        let gemini_voice = std::env::var("GEMINI_VOICE").ok();

        let persistence_url = std::env::var("PERSISTENCE_URL")
            .unwrap_or_else(|_| "http://localhost:3000/api".to_string());
        if !persistence_url.starts_with("http://") && !persistence_url.starts_with("https://") {
            return Err(ConfigError::InvalidValue(
                "PERSISTENCE_URL".to_string(),
                format!("'{}' is not an http(s) URL", persistence_url),
            ));
        }

        let log_level_str = std::env::var("RUST_LOG").unwrap_or_else(|_| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        let prompts_path = std::env::var("PROMPTS_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./prompts"));

        Ok(Self {
            gemini_api_key,
            gemini_model,
            gemini_voice,
            persistence_url,
            log_level,
            prompts_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::env;

    fn clear_env_vars() {
        unsafe {
            env::remove_var("GEMINI_API_KEY");
            env::remove_var("GEMINI_MODEL");
            env::remove_var("GEMINI_VOICE");
            env::remove_var("PERSISTENCE_URL");
            env::remove_var("RUST_LOG");
            env::remove_var("PROMPTS_PATH");
        }
    }

    #[test]
    #[serial]
    fn test_config_from_env_minimal() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "test-gemini-key");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.gemini_api_key, "test-gemini-key");
        assert_eq!(config.gemini_model, None);
        assert_eq!(config.gemini_voice, None);
        assert_eq!(config.persistence_url, "http://localhost:3000/api");
        assert_eq!(config.log_level, Level::INFO);
        assert_eq!(config.prompts_path, PathBuf::from("./prompts"));
    }

    #[test]
    #[serial]
    fn test_config_from_env_custom_values() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "custom-key");
            env::set_var("GEMINI_MODEL", "gemini-live-custom");
            env::set_var("GEMINI_VOICE", "Kore");
            env::set_var("PERSISTENCE_URL", "https://training.example.com/api");
            env::set_var("RUST_LOG", "debug");
            env::set_var("PROMPTS_PATH", "/custom/prompts");
        }

        let config = Config::from_env().expect("Config should load successfully");

        assert_eq!(config.gemini_model.as_deref(), Some("gemini-live-custom"));
        assert_eq!(config.gemini_voice.as_deref(), Some("Kore"));
        assert_eq!(config.persistence_url, "https://training.example.com/api");
        assert_eq!(config.log_level, Level::DEBUG);
        assert_eq!(config.prompts_path, PathBuf::from("/custom/prompts"));
    }

    #[test]
    #[serial]
    fn test_config_missing_gemini_key() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "  ");
        }

        let err = Config::from_env().unwrap_err();
        match err {
            ConfigError::MissingVar(msg) => assert!(msg.contains("GEMINI_API_KEY")),
            _ => panic!("Expected MissingVar for GEMINI_API_KEY"),
        }
    }

    #[test]
    #[serial]
    fn test_config_invalid_values() {
        clear_env_vars();
        unsafe {
            env::set_var("GEMINI_API_KEY", "k");
            env::set_var("RUST_LOG", "not-a-level");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "RUST_LOG"),
            _ => panic!("Expected InvalidValue for RUST_LOG"),
        }

        unsafe {
            env::remove_var("RUST_LOG");
            env::set_var("PERSISTENCE_URL", "localhost:3000");
        }
        match Config::from_env().unwrap_err() {
            ConfigError::InvalidValue(var, _) => assert_eq!(var, "PERSISTENCE_URL"),
            _ => panic!("Expected InvalidValue for PERSISTENCE_URL"),
        }
    }
}
