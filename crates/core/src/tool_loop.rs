//! The tool-calling loop.

use std::sync::Arc;

use futures_util::future::join_all;
use model_io_model::{ModelMessage, ModelOptions, ModelRequest, ToolCallResult};
use tracing::Instrument;

use crate::Error;
use crate::conversation::Conversation;
use crate::model_client::{CompletionOutput, ModelClient};
use crate::tool::ToolRegistry;

/// Default bound of completion calls in one run.
pub const DEFAULT_MAX_ITERATIONS: usize = 3;

/// Text returned when the bound is hit and the model produced no text.
pub const MAX_ITERATIONS_MESSAGE: &str = "Agent stopped due to max iterations.";

/// What to do when a tool call fails.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum ToolErrorPolicy {
    /// Abort the run with the tool error.
    #[default]
    Propagate,
    /// Send the error text back to the model as the tool result.
    ReportToModel,
}

/// How a run ended.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Answer {
    /// The model answered with plain text.
    Final(String),
    /// The bound was hit while the model still requested tools.
    ///
    /// `last_message` is the text of the capped response, or
    /// [`MAX_ITERATIONS_MESSAGE`] when it had none.
    MaxIterationsReached {
        /// The last assistant text.
        last_message: String,
    },
}

impl Answer {
    /// Returns the answer text.
    #[inline]
    pub fn text(&self) -> &str {
        match self {
            Answer::Final(text) => text,
            Answer::MaxIterationsReached { last_message } => last_message,
        }
    }
}

/// The result of [`ToolLoop::run`].
#[derive(Clone, Debug)]
pub struct LoopOutcome {
    /// How the run ended.
    pub answer: Answer,
    /// The conversation including every assistant turn and tool result.
    pub conversation: Conversation,
    /// Number of completion calls made.
    pub iterations: usize,
}

/// Drives the model through tool calls until it answers in text.
#[derive(Clone)]
pub struct ToolLoop {
    client: ModelClient,
    registry: Arc<ToolRegistry>,
    max_iterations: usize,
    error_policy: ToolErrorPolicy,
    options: ModelOptions,
}

impl ToolLoop {
    /// Creates a loop over `registry` with default settings.
    #[inline]
    pub fn new(client: ModelClient, registry: impl Into<Arc<ToolRegistry>>) -> Self {
        Self {
            client,
            registry: registry.into(),
            max_iterations: DEFAULT_MAX_ITERATIONS,
            error_policy: ToolErrorPolicy::default(),
            options: ModelOptions::default(),
        }
    }

    /// Sets the bound of completion calls, at least one.
    #[inline]
    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations.max(1);
        self
    }

    /// Sets how tool failures are handled.
    #[inline]
    pub fn with_error_policy(mut self, error_policy: ToolErrorPolicy) -> Self {
        self.error_policy = error_policy;
        self
    }

    /// Sets the sampling options sent with every request.
    #[inline]
    pub fn with_options(mut self, options: ModelOptions) -> Self {
        self.options = options;
        self
    }

    /// Returns the tool registry.
    #[inline]
    pub fn registry(&self) -> &ToolRegistry {
        &self.registry
    }

    /// Runs the loop on `conversation`.
    pub async fn run(
        &self,
        conversation: Conversation,
    ) -> Result<LoopOutcome, Error> {
        let mut conversation = conversation;
        let tools = self.registry.definitions();
        let mut iteration = 0;

        loop {
            iteration += 1;
            let req = ModelRequest {
                messages: conversation.messages().to_vec(),
                tools: tools.clone(),
                options: self.options,
            };
            let completion = self
                .client
                .invoke(req)
                .instrument(debug_span!("tool loop", iteration))
                .await?;

            if matches!(completion.output(), CompletionOutput::Text(_)) {
                let text = completion.content.clone();
                conversation.push(completion.into_message());
                return Ok(LoopOutcome {
                    answer: Answer::Final(text),
                    conversation,
                    iterations: iteration,
                });
            }

            if iteration >= self.max_iterations {
                // The capped response's calls are left unexecuted.
                info!("stopped after {iteration} iterations");
                let last_message = if completion.content.is_empty() {
                    MAX_ITERATIONS_MESSAGE.to_owned()
                } else {
                    completion.content.clone()
                };
                conversation.push(completion.into_message());
                return Ok(LoopOutcome {
                    answer: Answer::MaxIterationsReached { last_message },
                    conversation,
                    iterations: iteration,
                });
            }

            let calls = completion.tool_calls.clone();
            debug!("executing {} tool calls", calls.len());
            conversation.push(completion.into_message());
            let results =
                join_all(calls.iter().map(|call| self.registry.call(call))).await;
            for (call, result) in calls.into_iter().zip(results) {
                let content = match result {
                    Ok(content) => content,
                    Err(err) => match self.error_policy {
                        ToolErrorPolicy::Propagate => {
                            error!("tool `{}` failed: {err}", call.name);
                            return Err(err.into());
                        }
                        ToolErrorPolicy::ReportToModel => {
                            warn!("tool `{}` failed: {err}", call.name);
                            format!("Error: {err}")
                        }
                    },
                };
                conversation.push(ModelMessage::Tool(ToolCallResult {
                    id: call.id,
                    name: call.name,
                    content,
                }));
            }
        }
    }
}
