use std::sync::Arc;

use model_io_model::{EmbeddingProvider, ErrorKind};
use reqwest::{Client, header};

use crate::proto::{EmbeddingRequest, EmbeddingResponse};
use crate::{Error, OpenAIConfig, check_status};

/// Embedding provider for the OpenAI-compatible `/embeddings` endpoint.
///
/// Inputs are split into batches of the configured size, one request per
/// batch, since DashScope caps the number of texts per call.
#[derive(Clone, Debug)]
pub struct OpenAIEmbeddingProvider {
    client: Client,
    config: Arc<OpenAIConfig>,
}

impl OpenAIEmbeddingProvider {
    /// Creates a new `OpenAIEmbeddingProvider` with the given configuration.
    #[inline]
    pub fn new(config: OpenAIConfig) -> Self {
        Self::with_client(Client::new(), config)
    }

    /// Creates a new `OpenAIEmbeddingProvider` that shares an HTTP client.
    #[inline]
    pub fn with_client(client: Client, config: OpenAIConfig) -> Self {
        Self {
            client,
            config: Arc::new(config),
        }
    }
}

impl EmbeddingProvider for OpenAIEmbeddingProvider {
    type Error = Error;

    #[inline]
    fn dimensions(&self) -> Option<usize> {
        self.config.embedding_dimensions
    }

    fn embed(
        &self,
        texts: &[String],
    ) -> impl Future<Output = Result<Vec<Vec<f32>>, Self::Error>> + Send + 'static
    {
        // Bodies are serialized here so the future owns nothing borrowed.
        let batches: Vec<_> = texts
            .chunks(self.config.embedding_batch_size)
            .map(|batch| {
                let req = EmbeddingRequest {
                    model: &self.config.embedding_model,
                    input: batch,
                };
                let builder = self
                    .client
                    .post(self.config.endpoint("/embeddings"))
                    .header(
                        header::AUTHORIZATION,
                        format!("Bearer {}", self.config.api_key),
                    )
                    .timeout(self.config.timeout)
                    .json(&req);
                (batch.len(), builder)
            })
            .collect();
        let expected_dimensions = self.config.embedding_dimensions;

        async move {
            let mut vectors = Vec::new();
            for (len, builder) in batches {
                let resp = builder.send().await.map_err(Error::from_transport)?;
                let resp = check_status(resp).await?;
                let body = resp.bytes().await.map_err(Error::from_transport)?;
                let mut parsed: EmbeddingResponse = serde_json::from_slice(&body)
                    .map_err(|err| {
                        Error::new(format!("{err}"), ErrorKind::MalformedResponse)
                    })?;

                if parsed.data.len() != len {
                    return Err(Error::new(
                        format!(
                            "expected {len} embeddings, got {}",
                            parsed.data.len()
                        ),
                        ErrorKind::MalformedResponse,
                    ));
                }
                parsed.data.sort_by_key(|d| d.index);
                for data in parsed.data {
                    if let Some(dimensions) = expected_dimensions {
                        if data.embedding.len() != dimensions {
                            return Err(Error::new(
                                format!(
                                    "expected {dimensions} dimensions, got {}",
                                    data.embedding.len()
                                ),
                                ErrorKind::MalformedResponse,
                            ));
                        }
                    }
                    vectors.push(data.embedding);
                }
            }
            debug!("embedded {} texts", vectors.len());
            Ok(vectors)
        }
    }
}
