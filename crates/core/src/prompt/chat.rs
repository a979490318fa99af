use std::collections::BTreeMap;
use std::str::FromStr;

use model_io_model::ModelMessage;

use super::{PromptError, PromptTemplate, Variables};

/// The author of a templated chat message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Role {
    /// System instructions.
    System,
    /// The human side of the conversation.
    User,
    /// The model side of the conversation.
    Assistant,
}

impl Role {
    fn message(self, content: String) -> ModelMessage {
        match self {
            Role::System => ModelMessage::system(content),
            Role::User => ModelMessage::user(content),
            Role::Assistant => ModelMessage::assistant(content),
        }
    }
}

impl FromStr for Role {
    type Err = PromptError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "system" => Ok(Role::System),
            "human" | "user" => Ok(Role::User),
            "ai" | "assistant" => Ok(Role::Assistant),
            other => Err(PromptError::InvalidTemplate(format!(
                "unknown message role `{other}`"
            ))),
        }
    }
}

/// A slot in a chat template that is filled with a list of messages.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessagesPlaceholder {
    name: String,
    optional: bool,
}

impl MessagesPlaceholder {
    /// Creates a required placeholder.
    #[inline]
    pub fn new<S: Into<String>>(name: S) -> Self {
        Self {
            name: name.into(),
            optional: false,
        }
    }

    /// Makes the placeholder expand to nothing when no messages are given.
    #[inline]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    /// Returns the placeholder name.
    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }
}

#[derive(Clone, Debug)]
enum ChatItem {
    Message(Role, PromptTemplate),
    Placeholder(MessagesPlaceholder),
}

/// An ordered list of templated messages.
#[derive(Clone, Debug, Default)]
pub struct ChatPromptTemplate {
    items: Vec<ChatItem>,
}

impl ChatPromptTemplate {
    /// Creates an empty chat template.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a chat template from `(role, template)` pairs.
    ///
    /// Roles are `system`, `human`/`user` and `ai`/`assistant`. Templates
    /// use the [`super::TemplateFormat::FString`] syntax.
    pub fn from_messages<'a, I>(messages: I) -> Result<Self, PromptError>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut chat = Self::new();
        for (role, template) in messages {
            chat = chat.with_message(role.parse()?, PromptTemplate::new(template)?);
        }
        Ok(chat)
    }

    /// Appends a templated message.
    #[inline]
    pub fn with_message(mut self, role: Role, template: PromptTemplate) -> Self {
        self.items.push(ChatItem::Message(role, template));
        self
    }

    /// Appends a placeholder for a list of messages.
    #[inline]
    pub fn with_placeholder(mut self, placeholder: MessagesPlaceholder) -> Self {
        self.items.push(ChatItem::Placeholder(placeholder));
        self
    }

    /// Returns the text variables used by any message.
    pub fn input_variables(&self) -> Vec<&str> {
        let mut variables: Vec<&str> = vec![];
        for item in &self.items {
            if let ChatItem::Message(_, template) = item {
                for name in template.input_variables() {
                    if !variables.contains(&name) {
                        variables.push(name);
                    }
                }
            }
        }
        variables
    }

    /// Renders every message. Fails if the template has a required
    /// placeholder.
    #[inline]
    pub fn format_messages(
        &self,
        vars: &Variables,
    ) -> Result<Vec<ModelMessage>, PromptError> {
        self.format_messages_with(vars, &BTreeMap::new())
    }

    /// Renders every message, expanding placeholders from `placeholders`.
    pub fn format_messages_with(
        &self,
        vars: &Variables,
        placeholders: &BTreeMap<String, Vec<ModelMessage>>,
    ) -> Result<Vec<ModelMessage>, PromptError> {
        let mut messages = Vec::with_capacity(self.items.len());
        for item in &self.items {
            match item {
                ChatItem::Message(role, template) => {
                    messages.push(role.message(template.format(vars)?));
                }
                ChatItem::Placeholder(placeholder) => {
                    match placeholders.get(&placeholder.name) {
                        Some(filled) => messages.extend(filled.iter().cloned()),
                        None if placeholder.optional => {}
                        None => {
                            return Err(PromptError::MissingVariable(
                                placeholder.name.clone(),
                            ));
                        }
                    }
                }
            }
        }
        Ok(messages)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::variables;

    fn assistant_chat() -> ChatPromptTemplate {
        ChatPromptTemplate::from_messages([
            ("system", "你是一个有帮助的AI机器人，你的名字是{name}。"),
            ("human", "你好，最近怎么样？"),
            ("ai", "我很好，谢谢！"),
            ("human", "{user_input}"),
        ])
        .unwrap()
    }

    #[test]
    fn test_format_messages() {
        let chat = assistant_chat();
        assert_eq!(chat.input_variables(), ["name", "user_input"]);

        let messages = chat
            .format_messages(&variables([
                ("name", "小张"),
                ("user_input", "你叫什么名字？"),
            ]))
            .unwrap();
        assert_eq!(
            messages,
            [
                ModelMessage::system("你是一个有帮助的AI机器人，你的名字是小张。"),
                ModelMessage::user("你好，最近怎么样？"),
                ModelMessage::assistant("我很好，谢谢！"),
                ModelMessage::user("你叫什么名字？"),
            ]
        );
    }

    #[test]
    fn test_unknown_role() {
        let err = ChatPromptTemplate::from_messages([("robot", "hi")]).unwrap_err();
        assert!(matches!(err, PromptError::InvalidTemplate(_)));
    }

    #[test]
    fn test_placeholders() {
        let chat = ChatPromptTemplate::new()
            .with_message(Role::System, PromptTemplate::new("你是助手").unwrap())
            .with_placeholder(MessagesPlaceholder::new("chat_history").optional())
            .with_message(Role::User, PromptTemplate::new("{input}").unwrap())
            .with_placeholder(MessagesPlaceholder::new("agent_scratchpad"));
        let vars = variables([("input", "北京天气")]);

        let err = chat.format_messages(&vars).unwrap_err();
        assert!(matches!(err, PromptError::MissingVariable(name) if name == "agent_scratchpad"));

        let scratchpad = vec![ModelMessage::assistant("让我查一下")];
        let placeholders =
            BTreeMap::from([("agent_scratchpad".to_owned(), scratchpad.clone())]);
        let messages = chat.format_messages_with(&vars, &placeholders).unwrap();
        assert_eq!(
            messages,
            [
                ModelMessage::system("你是助手"),
                ModelMessage::user("北京天气"),
                scratchpad[0].clone(),
            ]
        );
    }
}
