//! The completion client.
//!
//! [`ModelClient`] wraps a model provider behind a type-erased interface
//! and exposes the four invocation modes: [`ModelClient::invoke`],
//! [`ModelClient::invoke_blocking`], [`ModelClient::stream`] and
//! [`ModelClient::batch`]. They are equivalent at the message level and
//! only differ in delivery.

mod completion;
mod retry;

use std::error::Error as StdError;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{StreamExt, stream};
use model_io_model::{
    ErrorKind, ModelProvider, ModelProviderError, ModelRequest, ModelResponse,
    ModelResponseEvent,
};
use tracing::Instrument;

pub use completion::{Completion, CompletionOutput, CompletionStream};
pub use retry::RetryPolicy;

/// Concurrency used by [`ModelClient::batch`] when none is given.
pub const DEFAULT_BATCH_CONCURRENCY: usize = 4;

/// An error reported by the completion or embedding service.
#[derive(Debug, thiserror::Error)]
#[error("{source}")]
pub struct ModelError {
    kind: ErrorKind,
    source: Box<dyn StdError + Send + Sync>,
}

impl ModelError {
    /// Creates an error of `kind` with a message.
    #[inline]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        let message: String = message.into();
        Self {
            kind,
            source: message.into(),
        }
    }

    /// Wraps an error from a provider, keeping its kind.
    #[inline]
    pub fn from_provider<E: ModelProviderError>(err: E) -> Self {
        Self {
            kind: err.kind(),
            source: Box::new(err),
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub(crate) trait ErasedResponse: Send {
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, ModelError>>;
}

impl<R: ModelResponse> ErasedResponse for R {
    #[inline]
    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, ModelError>> {
        ModelResponse::poll_next_event(self, cx)
            .map_err(ModelError::from_provider)
    }
}

pub(crate) type BoxedResponse = Pin<Box<dyn ErasedResponse>>;
type BoxedSendRequestFuture =
    Pin<Box<dyn Future<Output = Result<BoxedResponse, ModelError>> + Send>>;
type HandlerFn = Arc<dyn Fn(ModelRequest) -> BoxedSendRequestFuture + Send + Sync>;

/// A wrapper around a model provider that maintains an execution
/// environment for the provider and provides a type-erased interface
/// for the other modules.
///
/// Cloning is cheap, clones share the provider.
#[derive(Clone)]
pub struct ModelClient {
    handler_fn: HandlerFn,
    retry_policy: RetryPolicy,
}

impl ModelClient {
    /// Creates a client for `provider` with the default retry policy.
    #[inline]
    pub fn new<P: ModelProvider + 'static>(provider: P) -> Self {
        // We have to erase the type `P`, since `ModelClient` doesn't have a
        // generic parameter and we don't want it either.
        let handler_fn: HandlerFn = Arc::new(move |req| {
            let fut = provider.send_request(&req);
            Box::pin(
                async move {
                    trace!("got a request: {:?}", req);
                    match fut.await {
                        Ok(resp) => Ok(Box::pin(resp) as BoxedResponse),
                        Err(err) => {
                            error!("got an error: {err}");
                            Err(ModelError::from_provider(err))
                        }
                    }
                }
                .instrument(trace_span!("model client req")),
            )
        });
        Self {
            handler_fn,
            retry_policy: RetryPolicy::default(),
        }
    }

    /// Sets the retry policy.
    #[inline]
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    /// Returns the retry policy.
    #[inline]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry_policy
    }

    /// Sends a request and waits for the complete response.
    ///
    /// Only the calling task is suspended. Retryable failures re-send the
    /// same request as long as the retry policy allows.
    ///
    /// # Cancel safety
    ///
    /// This method is cancel safe. The response stops streaming further
    /// events when this operation is cancelled.
    pub async fn invoke(
        &self,
        req: ModelRequest,
    ) -> Result<Completion, ModelError> {
        self.with_retry(&req, |handler_fn, req| async move {
            let resp = handler_fn(req).await?;
            CompletionStream::new(resp).collect().await
        })
        .await
    }

    /// Sends a request and blocks the current thread until the complete
    /// response arrives.
    ///
    /// This drives the request on a private current-thread runtime, so it
    /// must not be called from within an async context. Doing so returns
    /// an error instead of blocking the runtime.
    pub fn invoke_blocking(
        &self,
        req: ModelRequest,
    ) -> Result<Completion, ModelError> {
        if tokio::runtime::Handle::try_current().is_ok() {
            return Err(ModelError::new(
                ErrorKind::Other,
                "invoke_blocking called from within an async runtime",
            ));
        }
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|err| {
                ModelError::new(ErrorKind::Other, format!("{err}"))
            })?;
        runtime.block_on(self.invoke(req))
    }

    /// Sends a request and returns its events as a stream.
    ///
    /// Only the initial send is retried. Once events are flowing, an
    /// error ends the stream.
    pub async fn stream(
        &self,
        req: ModelRequest,
    ) -> Result<CompletionStream, ModelError> {
        self.with_retry(&req, |handler_fn, req| async move {
            handler_fn(req).await.map(CompletionStream::new)
        })
        .await
    }

    /// Sends independent requests concurrently.
    ///
    /// The output is positionally aligned with `reqs`, and one failed
    /// request only affects its own slot.
    pub async fn batch(
        &self,
        reqs: Vec<ModelRequest>,
        concurrency: Option<usize>,
    ) -> Vec<Result<Completion, ModelError>> {
        let concurrency = concurrency.unwrap_or(DEFAULT_BATCH_CONCURRENCY).max(1);
        debug!("sending {} requests in batch", reqs.len());
        stream::iter(reqs)
            .map(|req| self.invoke(req))
            .buffered(concurrency)
            .collect::<Vec<_>>()
            .await
    }

    async fn with_retry<T, F, Fut>(
        &self,
        req: &ModelRequest,
        op: F,
    ) -> Result<T, ModelError>
    where
        F: Fn(HandlerFn, ModelRequest) -> Fut,
        Fut: Future<Output = Result<T, ModelError>>,
    {
        let max_attempts = self.retry_policy.max_attempts.max(1);
        let mut attempt = 0;
        backoff::future::retry(self.retry_policy.backoff(), || {
            attempt += 1;
            let current = attempt;
            let fut = op(Arc::clone(&self.handler_fn), req.clone());
            async move {
                fut.await.map_err(|err| {
                    if err.kind().is_retryable() && current < max_attempts {
                        warn!("attempt {current} failed, retrying: {err}");
                        backoff::Error::transient(err)
                    } else {
                        backoff::Error::permanent(err)
                    }
                })
            }
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures_util::StreamExt;
    use model_io_model::{
        ModelFinishReason, ModelMessage, TokenUsage, ToolCallRequest,
    };
    use model_io_test_model::{
        PresetEvent, PresetResponse, TestModelProvider,
    };
    use serde_json::json;

    use super::*;

    fn greeting() -> PresetResponse {
        PresetResponse::with_events([
            PresetEvent::MessageDelta("你好，".to_owned()),
            PresetEvent::MessageDelta("我是".to_owned()),
            PresetEvent::MessageDelta("通义千问。".to_owned()),
            PresetEvent::Usage(TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 6,
                total_tokens: 16,
            }),
        ])
    }

    fn hello() -> ModelRequest {
        ModelRequest::with_messages([ModelMessage::user("你是谁？")])
    }

    fn fast_retry(attempts: u32) -> RetryPolicy {
        RetryPolicy::with_max_attempts(attempts)
            .with_initial_interval(Duration::from_millis(1))
            .with_max_interval(Duration::from_millis(2))
    }

    #[test]
    fn test_blocking_matches_async() {
        let mut provider = TestModelProvider::with_script([greeting()]);
        provider.set_repeat_last(true);
        let client = ModelClient::new(provider);

        let blocking = client.invoke_blocking(hello()).unwrap();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let invoked = runtime.block_on(client.invoke(hello())).unwrap();

        assert_eq!(blocking.content, "你好，我是通义千问。");
        assert_eq!(blocking, invoked);
        assert_eq!(blocking.finish_reason, Some(ModelFinishReason::Stop));
        assert_eq!(blocking.usage.map(|u| u.total_tokens), Some(16));
    }

    #[tokio::test]
    async fn test_blocking_inside_runtime_is_rejected() {
        let client = ModelClient::new(TestModelProvider::with_script([greeting()]));
        let err = client.invoke_blocking(hello()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_stream_concatenation() {
        let mut provider = TestModelProvider::with_script([greeting()]);
        provider.set_repeat_last(true);
        let client = ModelClient::new(provider);

        let mut stream = client.stream(hello()).await.unwrap();
        let mut chunks = vec![];
        while let Some(event) = stream.next().await {
            if let ModelResponseEvent::MessageDelta(delta) = event.unwrap() {
                chunks.push(delta);
            }
        }
        assert_eq!(chunks.len(), 3);
        // Exhausted streams stay exhausted.
        assert!(stream.next().await.is_none());

        let completion = client.invoke(hello()).await.unwrap();
        assert_eq!(chunks.concat(), completion.content);
    }

    #[tokio::test]
    async fn test_tool_call_output() {
        let call = ToolCallRequest {
            id: "call_1".to_owned(),
            name: "get_current_weather".to_owned(),
            arguments: json!({ "location": "杭州" }),
        };
        let client = ModelClient::new(TestModelProvider::with_script([
            PresetResponse::tool_calls([call.clone()]),
        ]));
        let completion = client.invoke(hello()).await.unwrap();
        assert_eq!(
            completion.output(),
            CompletionOutput::ToolCalls(std::slice::from_ref(&call))
        );
        assert_eq!(completion.finish_reason, Some(ModelFinishReason::ToolCalls));

        let message = completion.into_message();
        assert!(matches!(
            message,
            ModelMessage::Assistant { ref tool_calls, .. } if tool_calls.len() == 1
        ));
    }

    #[tokio::test]
    async fn test_batch_is_aligned() {
        let mut provider = TestModelProvider::with_script([
            PresetResponse::with_events([PresetEvent::Echo]),
        ]);
        provider.set_repeat_last(true);
        let client = ModelClient::new(provider);

        let inputs = ["甲", "乙乙", "丙丙丙", "丁", "戊戊"];
        let reqs = inputs
            .iter()
            .map(|text| ModelRequest::with_messages([ModelMessage::user(*text)]))
            .collect();
        let results = client.batch(reqs, Some(2)).await;
        assert_eq!(results.len(), inputs.len());
        for (result, input) in results.into_iter().zip(inputs) {
            assert_eq!(result.unwrap().content, input);
        }
    }

    #[tokio::test]
    async fn test_batch_failure_stays_in_slot() {
        let mut provider = TestModelProvider::with_script([
            PresetResponse::text("一"),
            PresetResponse::text("二")
                .with_failures(0)
                .with_failure_kind(ErrorKind::Authentication),
        ]);
        provider.set_delay(Duration::ZERO);
        let client = ModelClient::new(provider);

        let results = client.batch(vec![hello(), hello()], Some(1)).await;
        assert_eq!(results[0].as_ref().unwrap().content, "一");
        assert_eq!(
            results[1].as_ref().unwrap_err().kind(),
            ErrorKind::Authentication
        );
    }

    #[tokio::test]
    async fn test_errors_are_not_swallowed() {
        let client = ModelClient::new(TestModelProvider::default());
        let err = client.invoke(hello()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_transient_failures() {
        let provider = TestModelProvider::with_script([greeting()
            .with_failures(2)
            .with_failure_kind(ErrorKind::Network)]);
        let client =
            ModelClient::new(provider.clone()).with_retry_policy(fast_retry(3));
        let completion = client.invoke(hello()).await.unwrap();
        assert_eq!(completion.content, "你好，我是通义千问。");
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_gives_up() {
        let provider = TestModelProvider::with_script([greeting().with_failures(0)]);
        let client =
            ModelClient::new(provider.clone()).with_retry_policy(fast_retry(3));
        let err = client.invoke(hello()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        assert_eq!(provider.request_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_retry_for_permanent_failures() {
        let provider = TestModelProvider::with_script([greeting()
            .with_failures(0)
            .with_failure_kind(ErrorKind::Authentication)]);
        let client =
            ModelClient::new(provider.clone()).with_retry_policy(fast_retry(3));
        let err = client.invoke(hello()).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Authentication);
        assert_eq!(provider.request_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stream_retries_only_initial_send() {
        let provider = TestModelProvider::with_script([PresetResponse::with_events([
            PresetEvent::MessageDelta("半".to_owned()),
            PresetEvent::Failure(ErrorKind::Network),
        ])
        .with_failures(1)
        .with_failure_kind(ErrorKind::Network)]);
        let client =
            ModelClient::new(provider.clone()).with_retry_policy(fast_retry(3));

        let mut stream = client.stream(hello()).await.unwrap();
        assert_eq!(provider.request_count(), 2);
        assert!(matches!(
            stream.next().await,
            Some(Ok(ModelResponseEvent::MessageDelta(_)))
        ));
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
        assert!(stream.next().await.is_none());
        assert_eq!(provider.request_count(), 2);
    }
}
