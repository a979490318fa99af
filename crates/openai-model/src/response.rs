use std::collections::VecDeque;
use std::pin::Pin;
use std::task::{Context, Poll, ready};

use model_io_model::{
    ErrorKind, ModelFinishReason, ModelResponse, ModelResponseEvent,
};
use pin_project_lite::pin_project;

use crate::Error;
use crate::io::{Sse, SseError};
use crate::proto::{
    self, ChatCompletion, ChatCompletionChunk, ToolCall,
};

struct PartialState {
    sse: Sse,
    id: Option<String>,
    tool_calls: Vec<ToolCall>,
    // Events decoded from the stream but not yet handed to the caller.
    // Message deltas go out as soon as they arrive, tool calls only once
    // their arguments are complete.
    pending_events: VecDeque<ModelResponseEvent>,
    finish_reason: Option<ModelFinishReason>,
    done: bool,
}

impl PartialState {
    fn apply_chunk(&mut self, chunk: ChatCompletionChunk) -> Result<(), Error> {
        if self.id.get_or_insert_with(|| chunk.id.clone()) != &chunk.id {
            return Err(Error::new(
                "chunk id mismatch",
                ErrorKind::MalformedResponse,
            ));
        };

        if let Some(choice) = chunk.choices.into_iter().next() {
            if let Some(content) = choice.delta.content {
                if !content.is_empty() {
                    self.pending_events
                        .push_back(ModelResponseEvent::MessageDelta(content));
                }
            }
            if let Some(tool_calls) = choice.delta.tool_calls {
                for tool_call in tool_calls {
                    self.merge_tool_call(tool_call);
                }
            }
            if let Some(finish_reason) = choice.finish_reason {
                self.finish_reason =
                    Some(proto::parse_finish_reason(&finish_reason));
                self.flush_tool_calls();
            }
        }

        if let Some(usage) = chunk.usage {
            self.pending_events
                .push_back(ModelResponseEvent::Usage(usage.into()));
        }
        Ok(())
    }

    fn merge_tool_call(&mut self, tool_call: ToolCall) {
        let Some(partial_tool_call) = self
            .tool_calls
            .iter_mut()
            .find(|t| t.index == tool_call.index)
        else {
            self.tool_calls.push(tool_call);
            return;
        };
        // Patch the partial tool call.
        if let Some(id) = tool_call.id {
            partial_tool_call.id.get_or_insert_default().push_str(&id);
        }
        if let Some(ty) = tool_call.r#type {
            partial_tool_call.r#type.get_or_insert_default().push_str(&ty);
        }
        let Some(function) = tool_call.function else {
            return;
        };
        match partial_tool_call.function {
            Some(ref mut partial_func) => {
                if let Some(name) = function.name {
                    partial_func.name.get_or_insert_default().push_str(&name);
                }
                if let Some(arguments) = function.arguments {
                    partial_func
                        .arguments
                        .get_or_insert_default()
                        .push_str(&arguments);
                }
            }
            None => partial_tool_call.function = Some(function),
        }
    }

    fn flush_tool_calls(&mut self) {
        for tool_call in self.tool_calls.drain(..) {
            self.pending_events.push_back(ModelResponseEvent::ToolCall(
                proto::finish_tool_call(&tool_call),
            ));
        }
    }

    fn finish(&mut self) {
        let had_tool_calls = !self.tool_calls.is_empty();
        self.flush_tool_calls();
        let reason = self.finish_reason.take().unwrap_or(if had_tool_calls {
            ModelFinishReason::ToolCalls
        } else {
            ModelFinishReason::Stop
        });
        self.pending_events
            .push_back(ModelResponseEvent::Completed(reason));
        self.done = true;
    }
}

type PinnedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;
type NextEvent = Result<(Option<ModelResponseEvent>, PartialState), Error>;

pin_project! {
    /// A response from an OpenAI-compatible endpoint.
    ///
    /// Streaming responses decode server-sent events lazily, one event
    /// per poll. Non-streaming responses are decoded up front.
    pub struct OpenAIResponse {
        next_event_fut: Option<PinnedFuture<NextEvent>>,
        decoded_events: VecDeque<ModelResponseEvent>,
    }
}

impl OpenAIResponse {
    #[inline]
    pub fn from_sse(sse: Sse) -> Self {
        let partial_state = PartialState {
            sse,
            id: None,
            tool_calls: Default::default(),
            pending_events: Default::default(),
            finish_reason: None,
            done: false,
        };
        let next_event_fut = async move { next_event(partial_state).await };
        Self {
            next_event_fut: Some(Box::pin(next_event_fut)),
            decoded_events: Default::default(),
        }
    }

    pub fn from_completion(completion: ChatCompletion) -> Result<Self, Error> {
        let Some(choice) = completion.choices.into_iter().next() else {
            return Err(Error::new(
                "completion has no choices",
                ErrorKind::MalformedResponse,
            ));
        };

        let mut events = VecDeque::new();
        if let Some(content) = choice.message.content.filter(|c| !c.is_empty())
        {
            events.push_back(ModelResponseEvent::MessageDelta(content));
        }
        let tool_calls = choice.message.tool_calls.unwrap_or_default();
        for tool_call in &tool_calls {
            events.push_back(ModelResponseEvent::ToolCall(
                proto::finish_tool_call(tool_call),
            ));
        }
        if let Some(usage) = completion.usage {
            events.push_back(ModelResponseEvent::Usage(usage.into()));
        }
        let reason = match choice.finish_reason {
            Some(reason) => proto::parse_finish_reason(&reason),
            None if !tool_calls.is_empty() => ModelFinishReason::ToolCalls,
            None => ModelFinishReason::Stop,
        };
        events.push_back(ModelResponseEvent::Completed(reason));

        Ok(Self {
            next_event_fut: None,
            decoded_events: events,
        })
    }
}

impl ModelResponse for OpenAIResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.project();
        if let Some(event) = this.decoded_events.pop_front() {
            return Poll::Ready(Ok(Some(event)));
        }
        let Some(next_event_fut) = this.next_event_fut else {
            return Poll::Ready(Ok(None));
        };
        let (event, partial_state) =
            match ready!(next_event_fut.as_mut().poll(cx)) {
                Ok((Some(event), partial_state)) => (event, partial_state),
                Ok((None, _)) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Ok(None));
                }
                Err(err) => {
                    *this.next_event_fut = None;
                    return Poll::Ready(Err(err));
                }
            };

        // The stream may still have more data to pull, create a new future for
        // the next event.
        let next_event_fut = async move { next_event(partial_state).await };
        *this.next_event_fut = Some(Box::pin(next_event_fut));

        Poll::Ready(Ok(Some(event)))
    }
}

async fn next_event(mut partial_state: PartialState) -> NextEvent {
    loop {
        if let Some(event) = partial_state.pending_events.pop_front() {
            return Ok((Some(event), partial_state));
        }
        if partial_state.done {
            return Ok((None, partial_state));
        }

        let sse_event = match partial_state.sse.next_event().await {
            Ok(Some(event)) => event,
            Ok(None) => {
                partial_state.finish();
                continue;
            }
            Err(SseError::ChunksError(err)) => {
                return Err(Error::new(err.0, ErrorKind::Network));
            }
            Err(SseError::InvalidPayload) => {
                return Err(Error::new(
                    "invalid event stream payload",
                    ErrorKind::MalformedResponse,
                ));
            }
        };
        trace!("got sse event: {sse_event}");
        if sse_event == "[DONE]" {
            partial_state.finish();
            continue;
        }

        let chunk = serde_json::from_str::<ChatCompletionChunk>(&sse_event)
            .map_err(|err| {
                Error::new(format!("{err}"), ErrorKind::MalformedResponse)
            })?;
        partial_state.apply_chunk(chunk)?;
    }
}
