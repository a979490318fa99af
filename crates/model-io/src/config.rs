//! Environment configuration.

use std::env;
use std::fmt::{self, Debug};

use model_io_openai_model::{
    DEFAULT_BASE_URL, DEFAULT_EMBEDDING_MODEL, DEFAULT_MODEL, OpenAIConfig,
    OpenAIConfigBuilder,
};

/// Key of the completion and embedding services.
pub const API_KEY_VAR: &str = "DASHSCOPE_API_KEY";
/// Overrides the service endpoint.
pub const BASE_URL_VAR: &str = "DASHSCOPE_BASE_URL";
/// Overrides the completion model.
pub const MODEL_VAR: &str = "MODEL_IO_MODEL";
/// Overrides the embedding model.
pub const EMBEDDING_MODEL_VAR: &str = "MODEL_IO_EMBEDDING_MODEL";
/// Key of the weather service.
pub const WEATHER_APP_CODE_VAR: &str = "WEATHER_APP_CODE";

/// An error resolving the configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required variable is unset or empty.
    #[error("{0} environment variable is not set")]
    MissingVariable(&'static str),
}

/// Settings resolved at startup.
#[derive(Clone)]
pub struct Settings {
    api_key: String,
    base_url: String,
    model: String,
    embedding_model: String,
    weather_app_code: Option<String>,
}

impl Settings {
    /// Reads the settings from the process environment, after loading a
    /// `.env` file if one exists.
    pub fn from_env() -> Result<Self, ConfigError> {
        if let Ok(path) = dotenv::dotenv() {
            debug!("loaded environment from {}", path.display());
        }
        Self::from_lookup(|name| env::var(name).ok())
    }

    /// Reads the settings through `lookup`. Empty values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |name: &str| lookup(name).filter(|value| !value.trim().is_empty());
        Ok(Self {
            api_key: get(API_KEY_VAR).ok_or(ConfigError::MissingVariable(API_KEY_VAR))?,
            base_url: get(BASE_URL_VAR).unwrap_or_else(|| DEFAULT_BASE_URL.to_owned()),
            model: get(MODEL_VAR).unwrap_or_else(|| DEFAULT_MODEL.to_owned()),
            embedding_model: get(EMBEDDING_MODEL_VAR)
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_owned()),
            weather_app_code: get(WEATHER_APP_CODE_VAR),
        })
    }

    /// Returns the completion model.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the weather key, which only the agent needs.
    pub fn weather_app_code(&self) -> Result<&str, ConfigError> {
        self.weather_app_code
            .as_deref()
            .ok_or(ConfigError::MissingVariable(WEATHER_APP_CODE_VAR))
    }

    /// Builds the provider configuration.
    pub fn openai_config(&self, streaming: bool) -> OpenAIConfig {
        OpenAIConfigBuilder::with_api_key(&self.api_key)
            .with_base_url(&self.base_url)
            .with_model(&self.model)
            .with_embedding_model(&self.embedding_model)
            .with_streaming(streaming)
            .build()
    }
}

impl Debug for Settings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Settings")
            .field("base_url", &self.base_url)
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("weather_app_code", &self.weather_app_code.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name: &str| vars.get(name).cloned()
    }

    #[test]
    fn test_defaults() {
        let settings = Settings::from_lookup(lookup(&[(API_KEY_VAR, "sk-test")])).unwrap();
        assert_eq!(settings.model(), DEFAULT_MODEL);
        assert_eq!(settings.base_url, DEFAULT_BASE_URL);
        assert!(matches!(
            settings.weather_app_code(),
            Err(ConfigError::MissingVariable(WEATHER_APP_CODE_VAR))
        ));

        let debug = format!("{settings:?}");
        assert!(!debug.contains("sk-test"));
    }

    #[test]
    fn test_overrides() {
        let settings = Settings::from_lookup(lookup(&[
            (API_KEY_VAR, "sk-test"),
            (MODEL_VAR, "qwen-plus"),
            (BASE_URL_VAR, "http://localhost:8080/v1"),
            (WEATHER_APP_CODE_VAR, "code"),
        ]))
        .unwrap();
        assert_eq!(settings.model(), "qwen-plus");
        assert_eq!(settings.weather_app_code().unwrap(), "code");
        assert_eq!(settings.openai_config(true).model(), "qwen-plus");
    }

    #[test]
    fn test_missing_api_key() {
        for vars in [&[][..], &[(API_KEY_VAR, "  ")][..]] {
            let err = Settings::from_lookup(lookup(vars)).unwrap_err();
            assert!(matches!(err, ConfigError::MissingVariable(API_KEY_VAR)));
        }
    }
}
