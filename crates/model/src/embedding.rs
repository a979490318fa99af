use crate::provider::ModelProviderError;

/// A type that converts text into fixed-length numeric vectors.
///
/// Like [`crate::ModelProvider`], an embedding provider should behave like
/// a stateless object, and its futures must be independent of `self`.
pub trait EmbeddingProvider: Send + Sync {
    /// The error type that may be returned by the provider.
    type Error: ModelProviderError;

    /// Returns the length of the produced vectors, if known up front.
    fn dimensions(&self) -> Option<usize>;

    /// Embeds a batch of texts.
    ///
    /// Implementations must return exactly one vector per input, in the
    /// same order as `texts`.
    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, Self::Error>> + Send + 'static;
}
