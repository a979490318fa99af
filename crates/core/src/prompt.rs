//! Prompt assembly.
//!
//! Templates turn runtime variables into prompt text or message lists.
//! [`FewShotPromptTemplate`] additionally asks an [`ExampleSelector`] for
//! worked examples and renders them between a prefix and a suffix.

mod chat;
mod few_shot;
mod selector;
mod template;

use std::collections::BTreeMap;

pub use chat::{ChatPromptTemplate, MessagesPlaceholder, Role};
pub use few_shot::{DEFAULT_EXAMPLE_SEPARATOR, FewShotPromptTemplate};
pub use selector::{
    Example, ExampleSelector, SemanticSimilarityExampleSelector,
    StaticExampleSelector,
};
pub use template::{PromptTemplate, TemplateFormat};

use crate::index::IndexError;

/// Named values substituted into templates.
pub type Variables = BTreeMap<String, String>;

/// Builds [`Variables`] from string pairs.
pub fn variables<I, K, V>(pairs: I) -> Variables
where
    I: IntoIterator<Item = (K, V)>,
    K: Into<String>,
    V: Into<String>,
{
    pairs
        .into_iter()
        .map(|(k, v)| (k.into(), v.into()))
        .collect()
}

/// An error from prompt assembly.
#[derive(Debug, thiserror::Error)]
pub enum PromptError {
    /// A variable required by the template was not provided.
    #[error("missing variable `{0}`")]
    MissingVariable(String),
    /// The template text could not be parsed.
    #[error("invalid template: {0}")]
    InvalidTemplate(String),
    /// The template engine failed while rendering.
    #[error("failed to render template: {0}")]
    Render(String),
    /// Selecting examples from the similarity index failed.
    #[error("failed to select examples: {0}")]
    Index(#[from] IndexError),
}
