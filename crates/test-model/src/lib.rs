//! Local fake providers for testing purpose.

mod embedding;
mod preset;

use std::collections::VecDeque;
use std::error::Error as StdError;
use std::fmt::{self, Debug, Display, Formatter};
use std::future::ready;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use model_io_model::{
    ErrorKind, ModelMessage, ModelProvider, ModelProviderError, ModelRequest,
    ModelResponse, ModelResponseEvent,
};
use tokio::time::{Sleep, sleep};

pub use embedding::*;
pub use preset::*;

#[derive(Debug)]
pub struct Error {
    message: &'static str,
    kind: ErrorKind,
}

impl Error {
    #[inline]
    fn new(message: &'static str, kind: ErrorKind) -> Self {
        Self { message, kind }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl StdError for Error {}

impl ModelProviderError for Error {
    #[inline]
    fn kind(&self) -> ErrorKind {
        self.kind
    }
}

pub struct TestModelResponse {
    items: VecDeque<Result<ModelResponseEvent, ErrorKind>>,
    delay: Duration,
    sleep: Option<Pin<Box<Sleep>>>,
}

impl TestModelResponse {
    fn new(preset: &PresetResponse, req: &ModelRequest, delay: Duration) -> Self {
        let mut items = VecDeque::with_capacity(preset.events.len() + 1);
        for event in &preset.events {
            items.push_back(match event {
                PresetEvent::MessageDelta(msg) => {
                    Ok(ModelResponseEvent::MessageDelta(msg.clone()))
                }
                PresetEvent::Echo => Ok(ModelResponseEvent::MessageDelta(
                    last_user_input(req).to_owned(),
                )),
                PresetEvent::ToolCall(call) => {
                    Ok(ModelResponseEvent::ToolCall(call.clone()))
                }
                PresetEvent::Usage(usage) => Ok(ModelResponseEvent::Usage(*usage)),
                PresetEvent::Failure(kind) => Err(*kind),
            });
        }
        items.push_back(Ok(ModelResponseEvent::Completed(
            preset.derived_finish_reason(),
        )));
        Self {
            items,
            delay,
            sleep: None,
        }
    }
}

fn last_user_input(req: &ModelRequest) -> &str {
    req.messages
        .iter()
        .rev()
        .find_map(|msg| match msg {
            ModelMessage::User { content } => Some(content.as_str()),
            _ => None,
        })
        .unwrap_or_default()
}

impl ModelResponse for TestModelResponse {
    type Error = crate::Error;

    fn poll_next_event(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Option<ModelResponseEvent>, Self::Error>> {
        let this = self.get_mut();
        if this.items.is_empty() {
            // In case this method is called after completion.
            return Poll::Ready(Ok(None));
        }

        if !this.delay.is_zero() {
            let sleep = this
                .sleep
                .get_or_insert_with(|| Box::pin(sleep(this.delay)));
            ready!(sleep.as_mut().poll(cx));
            this.sleep = None;
        }

        match this.items.pop_front() {
            Some(Ok(event)) => Poll::Ready(Ok(Some(event))),
            Some(Err(kind)) => {
                this.items.clear();
                Poll::Ready(Err(Error::new("preset failure", kind)))
            }
            None => Poll::Ready(Ok(None)),
        }
    }
}

#[derive(Default)]
struct ScriptState {
    next_step: usize,
    attempts: Vec<u64>,
    requests: Vec<ModelRequest>,
}

/// A local fake model for testing purpose.
///
/// Before sending requests, you need to setup the script, which is how
/// the model should respond to each request. Every successful request
/// consumes one step, failed attempts stay on the same step so that a
/// retried request sees the same preset. If there are no enough steps in
/// the script, an error will be returned.
///
/// Clones share the step counter and the request log.
///
/// # Note
///
/// This type is not optimized for production use, there are heavy memory
/// copies involved. You should only use it for testing.
#[derive(Clone)]
pub struct TestModelProvider {
    script: Vec<PresetResponse>,
    repeat_last: bool,
    delay: Duration,
    state: Arc<Mutex<ScriptState>>,
}

impl Default for TestModelProvider {
    fn default() -> Self {
        Self {
            script: vec![],
            repeat_last: false,
            delay: Duration::from_millis(1),
            state: Default::default(),
        }
    }
}

impl TestModelProvider {
    /// Creates a provider that answers with the given presets in order.
    pub fn with_script(script: impl IntoIterator<Item = PresetResponse>) -> Self {
        let mut provider = Self::default();
        for preset in script {
            provider.add_response(preset);
        }
        provider
    }

    #[inline]
    pub fn add_response(&mut self, preset: PresetResponse) {
        self.script.push(preset);
    }

    /// Keeps answering with the last step once the script is exhausted.
    #[inline]
    pub fn set_repeat_last(&mut self, repeat_last: bool) {
        self.repeat_last = repeat_last;
    }

    /// Sets the delay before each event. Zero disables the delay.
    #[inline]
    pub fn set_delay(&mut self, duration: Duration) {
        self.delay = duration;
    }

    /// Returns every request received so far, failed attempts included.
    pub fn requests(&self) -> Vec<ModelRequest> {
        self.lock_state().requests.clone()
    }

    #[inline]
    pub fn request_count(&self) -> usize {
        self.lock_state().requests.len()
    }

    fn lock_state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn respond(&self, req: &ModelRequest) -> Result<TestModelResponse, Error> {
        let mut state = self.lock_state();
        state.requests.push(req.clone());

        let mut step_idx = state.next_step;
        if step_idx >= self.script.len() {
            if !self.repeat_last || self.script.is_empty() {
                return Err(Error::new("no enough steps", ErrorKind::Other));
            }
            step_idx = self.script.len() - 1;
        }
        let preset = &self.script[step_idx];

        if state.attempts.len() <= step_idx {
            state.attempts.resize(step_idx + 1, 0);
        }
        state.attempts[step_idx] += 1;
        let attempt = state.attempts[step_idx];
        match preset.failures {
            Some(0) => {
                return Err(Error::new("preset failure", preset.failure_kind));
            }
            Some(failures) if attempt <= failures => {
                return Err(Error::new("preset failure", preset.failure_kind));
            }
            _ => {}
        }

        state.next_step += 1;
        Ok(TestModelResponse::new(preset, req, self.delay))
    }
}

impl ModelProvider for TestModelProvider {
    type Error = crate::Error;
    type Response = TestModelResponse;

    fn send_request(
        &self,
        req: &ModelRequest,
    ) -> impl Future<Output = Result<Self::Response, Self::Error>> + Send + 'static
    {
        ready(self.respond(req))
    }
}

#[cfg(test)]
mod tests {
    use std::future::poll_fn;
    use std::pin::pin;

    use model_io_model::{
        ModelFinishReason, ModelTool, TokenUsage, ToolCallRequest,
    };
    use serde_json::json;

    use super::*;

    async fn collect_response(
        resp: TestModelResponse,
    ) -> Result<(String, Vec<ToolCallRequest>, ModelFinishReason), Error> {
        let mut resp = pin!(resp);
        let mut msg = String::new();
        let mut tool_calls = vec![];
        loop {
            let event = poll_fn(|cx| resp.as_mut().poll_next_event(cx))
                .await?
                .unwrap();
            match event {
                ModelResponseEvent::Completed(reason) => {
                    return Ok((msg, tool_calls, reason));
                }
                ModelResponseEvent::MessageDelta(delta) => {
                    msg.push_str(&delta);
                }
                ModelResponseEvent::ToolCall(req) => tool_calls.push(req),
                ModelResponseEvent::Usage(_) => {}
            }
        }
    }

    #[tokio::test]
    async fn test_send_request() {
        let mut provider = TestModelProvider::default();
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("你好，".to_owned()),
            PresetEvent::MessageDelta("我是通义千问。".to_owned()),
            PresetEvent::Usage(TokenUsage::default()),
        ]));
        provider.add_response(PresetResponse::with_events([
            PresetEvent::MessageDelta("让我查一下。".to_owned()),
            PresetEvent::ToolCall(ToolCallRequest {
                id: "call_1".to_owned(),
                name: "get_current_weather".to_owned(),
                arguments: json!({ "location": "杭州" }),
            }),
        ]));

        let mut req = ModelRequest::with_messages([ModelMessage::user("你是谁？")]);
        req.tools.push(ModelTool {
            name: "get_current_weather".to_owned(),
            description: "查询天气".to_owned(),
            parameters: json!({ "type": "object" }),
        });
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, calls, reason) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "你好，我是通义千问。");
        assert!(calls.is_empty());
        assert_eq!(reason, ModelFinishReason::Stop);

        req.messages.push(ModelMessage::assistant(msg));
        req.messages.push(ModelMessage::user("杭州天气怎么样？"));
        let resp = provider.send_request(&req).await.unwrap();
        let (msg, calls, reason) = collect_response(resp).await.unwrap();
        assert_eq!(msg, "让我查一下。");
        assert_eq!(calls[0].arguments, json!({ "location": "杭州" }));
        assert_eq!(reason, ModelFinishReason::ToolCalls);

        assert_eq!(provider.request_count(), 2);
        let err = provider.send_request(&req).await.err().unwrap();
        assert_eq!(err.kind(), ErrorKind::Other);
    }

    #[tokio::test]
    async fn test_failures_stay_on_step() {
        let provider = TestModelProvider::with_script([
            PresetResponse::text("ok").with_failures(2),
            PresetResponse::text("next"),
        ]);
        let req = ModelRequest::with_messages([ModelMessage::user("hi")]);
        for _ in 0..2 {
            let err = provider.send_request(&req).await.err().unwrap();
            assert_eq!(err.kind(), ErrorKind::RateLimitExceeded);
        }
        let resp = provider.send_request(&req).await.unwrap();
        assert_eq!(collect_response(resp).await.unwrap().0, "ok");
        let resp = provider.send_request(&req).await.unwrap();
        assert_eq!(collect_response(resp).await.unwrap().0, "next");
        assert_eq!(provider.requests().len(), 4);
    }

    #[tokio::test]
    async fn test_echo_and_repeat_last() {
        let mut provider =
            TestModelProvider::with_script([PresetResponse::with_events([
                PresetEvent::Echo,
            ])]);
        provider.set_repeat_last(true);
        provider.set_delay(Duration::ZERO);
        for input in ["一", "二", "三"] {
            let req = ModelRequest::with_messages([
                ModelMessage::system("复读"),
                ModelMessage::user(input),
            ]);
            let resp = provider.send_request(&req).await.unwrap();
            assert_eq!(collect_response(resp).await.unwrap().0, input);
        }
    }

    #[tokio::test]
    async fn test_mid_stream_failure() {
        let provider = TestModelProvider::with_script([PresetResponse::with_events([
            PresetEvent::MessageDelta("partial".to_owned()),
            PresetEvent::Failure(ErrorKind::Network),
        ])]);
        let req = ModelRequest::with_messages([ModelMessage::user("hi")]);
        let resp = provider.send_request(&req).await.unwrap();
        let err = collect_response(resp).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Network);
    }
}
