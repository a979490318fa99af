//! Conversation-related types.

use model_io_model::{ModelMessage, ToolCallResult};

/// An ordered message history.
///
/// Order is meaningful, every message is sent back to the model in the
/// order it was pushed.
#[derive(Clone, Default, Debug, PartialEq, Eq)]
pub struct Conversation {
    messages: Vec<ModelMessage>,
}

impl Conversation {
    /// Creates an empty conversation.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a conversation holding a single user message.
    #[inline]
    pub fn with_user_input<S: Into<String>>(input: S) -> Self {
        Self {
            messages: vec![ModelMessage::user(input)],
        }
    }

    /// Appends a message.
    #[inline]
    pub fn push(&mut self, msg: ModelMessage) {
        self.messages.push(msg);
    }

    /// Returns all messages.
    #[inline]
    pub fn messages(&self) -> &[ModelMessage] {
        &self.messages
    }

    /// Returns the number of messages.
    #[inline]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if the conversation has no messages.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    /// Returns the content of the latest assistant message.
    pub fn last_assistant_content(&self) -> Option<&str> {
        self.messages.iter().rev().find_map(|msg| match msg {
            ModelMessage::Assistant { content, .. } => Some(content.as_str()),
            _ => None,
        })
    }

    /// Returns the tool results in the conversation.
    pub fn tool_results(&self) -> impl Iterator<Item = &ToolCallResult> {
        self.messages.iter().filter_map(|msg| match msg {
            ModelMessage::Tool(result) => Some(result),
            _ => None,
        })
    }

    /// Consumes the conversation and returns its messages.
    #[inline]
    pub fn into_messages(self) -> Vec<ModelMessage> {
        self.messages
    }
}

impl From<Vec<ModelMessage>> for Conversation {
    #[inline]
    fn from(messages: Vec<ModelMessage>) -> Self {
        Self { messages }
    }
}

impl Extend<ModelMessage> for Conversation {
    #[inline]
    fn extend<I: IntoIterator<Item = ModelMessage>>(&mut self, iter: I) {
        self.messages.extend(iter);
    }
}
