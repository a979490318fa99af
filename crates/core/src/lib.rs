//! Core logic: the completion client, prompt assembly, the similarity
//! index, structured parsing and the tool loop.
//!
//! A typical flow renders a prompt with [`prompt`], sends it through a
//! [`ModelClient`], hands tool calls to a [`ToolLoop`] and finally
//! validates the answer with a [`parser::StructuredParser`].

#![deny(missing_docs)]
#![deny(clippy::missing_safety_doc)]

#[macro_use]
extern crate tracing;

pub mod chain;
pub mod conversation;
pub mod index;
pub mod model_client;
pub mod parser;
pub mod prompt;
pub mod tool;
pub mod tool_loop;

pub use chain::ExtractionChain;
pub use conversation::Conversation;
pub use index::{DistanceMetric, IndexError, SimilarityIndex, VectorStore};
pub use model_client::{
    Completion, CompletionOutput, CompletionStream, ModelClient, ModelError,
    RetryPolicy,
};
pub use parser::{ParseError, StructuredParser, StructuredRecord};
pub use prompt::PromptError;
pub use tool::{Tool, ToolRegistry};
pub use tool_loop::{Answer, LoopOutcome, ToolErrorPolicy, ToolLoop};

/// Any error produced by this crate.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The completion or embedding service failed.
    #[error(transparent)]
    Model(#[from] ModelError),
    /// A prompt could not be assembled.
    #[error(transparent)]
    Prompt(#[from] PromptError),
    /// The similarity index rejected an operation.
    #[error(transparent)]
    Index(#[from] IndexError),
    /// A completion could not be parsed into a record.
    #[error(transparent)]
    Parse(#[from] ParseError),
    /// A tool call failed.
    #[error(transparent)]
    Tool(#[from] tool::Error),
}
