use std::pin::Pin;
use std::task::{Context, Poll};

use futures_util::Stream;
use model_io_model::{
    ModelFinishReason, ModelMessage, ModelResponseEvent, TokenUsage,
    ToolCallRequest,
};

use super::{BoxedResponse, ErasedResponse, ModelError};

/// A completely received response from the model client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Completion {
    /// Concatenated text content.
    pub content: String,
    /// Tool calls requested by the model.
    pub tool_calls: Vec<ToolCallRequest>,
    /// The reason the model finished generating.
    pub finish_reason: Option<ModelFinishReason>,
    /// Token usage, if the service reported it.
    pub usage: Option<TokenUsage>,
}

/// What a completion asks the caller to do next.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionOutput<'a> {
    /// A plain text answer.
    Text(&'a str),
    /// One or more tool invocations, any accompanying text aside.
    ToolCalls(&'a [ToolCallRequest]),
}

impl Completion {
    /// Returns the output variant of this completion.
    #[inline]
    pub fn output(&self) -> CompletionOutput<'_> {
        if self.tool_calls.is_empty() {
            CompletionOutput::Text(&self.content)
        } else {
            CompletionOutput::ToolCalls(&self.tool_calls)
        }
    }

    /// Converts this completion into an assistant message for the history.
    #[inline]
    pub fn into_message(self) -> ModelMessage {
        ModelMessage::Assistant {
            content: self.content,
            tool_calls: self.tool_calls,
        }
    }

    pub(crate) fn apply(&mut self, event: ModelResponseEvent) {
        match event {
            ModelResponseEvent::MessageDelta(delta) => {
                self.content.push_str(&delta);
            }
            ModelResponseEvent::ToolCall(req) => self.tool_calls.push(req),
            ModelResponseEvent::Usage(usage) => self.usage = Some(usage),
            ModelResponseEvent::Completed(reason) => {
                self.finish_reason = Some(reason);
            }
        }
    }
}

/// A lazy sequence of response events.
///
/// The stream is finite and cannot be restarted. Dropping it before the
/// end releases the underlying response.
pub struct CompletionStream {
    resp: Option<BoxedResponse>,
}

impl CompletionStream {
    #[inline]
    pub(crate) fn new(resp: BoxedResponse) -> Self {
        Self { resp: Some(resp) }
    }

    /// Drains the remaining events into a [`Completion`].
    pub async fn collect(self) -> Result<Completion, ModelError> {
        let mut stream = self;
        let mut completion = Completion::default();
        while let Some(event) =
            std::future::poll_fn(|cx| Pin::new(&mut stream).poll_next(cx)).await
        {
            completion.apply(event?);
        }
        Ok(completion)
    }
}

impl Stream for CompletionStream {
    type Item = Result<ModelResponseEvent, ModelError>;

    fn poll_next(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(resp) = &mut this.resp else {
            return Poll::Ready(None);
        };
        match resp.as_mut().poll_next_event(cx) {
            Poll::Pending => Poll::Pending,
            Poll::Ready(Ok(Some(event))) => {
                trace!("got an event: {event:?}");
                Poll::Ready(Some(Ok(event)))
            }
            Poll::Ready(Ok(None)) => {
                this.resp = None;
                Poll::Ready(None)
            }
            Poll::Ready(Err(err)) => {
                error!("got an error: {err}");
                this.resp = None;
                Poll::Ready(Some(Err(err)))
            }
        }
    }
}
