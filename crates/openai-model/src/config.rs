use std::fmt::Debug;
use std::time::Duration;

use model_io_model::ModelOptions;

/// Base URL of the DashScope OpenAI-compatible endpoint.
pub const DEFAULT_BASE_URL: &str =
    "https://dashscope.aliyuncs.com/compatible-mode/v1";
/// Chat model used when none is configured.
pub const DEFAULT_MODEL: &str = "qwen-turbo";
/// Embedding model used when none is configured.
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-v1";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);
const DEFAULT_EMBEDDING_BATCH_SIZE: usize = 10;

/// Builder for [`OpenAIConfig`].
#[derive(Clone, PartialEq)]
pub struct OpenAIConfigBuilder {
    api_key: String,
    model: Option<String>,
    embedding_model: Option<String>,
    embedding_dimensions: Option<usize>,
    embedding_batch_size: Option<usize>,
    base_url: Option<String>,
    stream: bool,
    timeout: Option<Duration>,
    options: ModelOptions,
}

impl OpenAIConfigBuilder {
    /// Creates a builder with the given API key.
    #[inline]
    pub fn with_api_key<S: Into<String>>(api_key: S) -> Self {
        Self {
            api_key: api_key.into(),
            model: None,
            embedding_model: None,
            embedding_dimensions: None,
            embedding_batch_size: None,
            base_url: None,
            stream: true,
            timeout: None,
            options: ModelOptions::default(),
        }
    }

    /// Sets the chat model to use.
    #[inline]
    pub fn with_model<S: Into<String>>(mut self, model: S) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Sets the embedding model to use.
    #[inline]
    pub fn with_embedding_model<S: Into<String>>(mut self, model: S) -> Self {
        self.embedding_model = Some(model.into());
        self
    }

    /// Declares the vector length the embedding model produces.
    #[inline]
    pub fn with_embedding_dimensions(mut self, dimensions: usize) -> Self {
        self.embedding_dimensions = Some(dimensions);
        self
    }

    /// Sets how many texts are sent in one embedding request.
    #[inline]
    pub fn with_embedding_batch_size(mut self, batch_size: usize) -> Self {
        self.embedding_batch_size = Some(batch_size.max(1));
        self
    }

    /// Sets a custom base URL.
    #[inline]
    pub fn with_base_url<S: Into<String>>(mut self, base_url: S) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    /// Chooses between server-sent events and a single JSON body.
    #[inline]
    pub fn with_streaming(mut self, stream: bool) -> Self {
        self.stream = stream;
        self
    }

    /// Sets the per-request timeout.
    #[inline]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Sets the default sampling temperature.
    #[inline]
    pub fn with_temperature(mut self, temperature: f32) -> Self {
        self.options.temperature = Some(temperature);
        self
    }

    /// Sets the default nucleus sampling probability mass.
    #[inline]
    pub fn with_top_p(mut self, top_p: f32) -> Self {
        self.options.top_p = Some(top_p);
        self
    }

    /// Builds the configuration.
    #[inline]
    pub fn build(self) -> OpenAIConfig {
        let base_url = self
            .base_url
            .unwrap_or_else(|| DEFAULT_BASE_URL.to_string());
        OpenAIConfig {
            api_key: self.api_key,
            model: self.model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            embedding_model: self
                .embedding_model
                .unwrap_or_else(|| DEFAULT_EMBEDDING_MODEL.to_string()),
            embedding_dimensions: self.embedding_dimensions,
            embedding_batch_size: self
                .embedding_batch_size
                .unwrap_or(DEFAULT_EMBEDDING_BATCH_SIZE),
            base_url: base_url.trim_end_matches('/').to_owned(),
            stream: self.stream,
            timeout: self.timeout.unwrap_or(DEFAULT_TIMEOUT),
            options: self.options,
        }
    }
}

impl Debug for OpenAIConfigBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfigBuilder")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("base_url", &self.base_url)
            .field("stream", &self.stream)
            .finish_non_exhaustive()
    }
}

/// Configuration for the OpenAI-compatible providers.
#[derive(Clone, PartialEq)]
pub struct OpenAIConfig {
    pub(crate) api_key: String,
    pub(crate) model: String,
    pub(crate) embedding_model: String,
    pub(crate) embedding_dimensions: Option<usize>,
    pub(crate) embedding_batch_size: usize,
    pub(crate) base_url: String,
    pub(crate) stream: bool,
    pub(crate) timeout: Duration,
    pub(crate) options: ModelOptions,
}

impl OpenAIConfig {
    /// Returns the chat model identifier.
    #[inline]
    pub fn model(&self) -> &str {
        &self.model
    }

    /// Returns the embedding model identifier.
    #[inline]
    pub fn embedding_model(&self) -> &str {
        &self.embedding_model
    }

    /// Returns whether completions are streamed.
    #[inline]
    pub fn is_streaming(&self) -> bool {
        self.stream
    }

    #[inline]
    pub(crate) fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }
}

impl Debug for OpenAIConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpenAIConfig")
            .field("api_key", &"<redacted>")
            .field("model", &self.model)
            .field("embedding_model", &self.embedding_model)
            .field("base_url", &self.base_url)
            .field("stream", &self.stream)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
