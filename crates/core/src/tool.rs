//! Tool call supports.

mod error;
mod object;
mod registry;
mod spec;

use serde::de::DeserializeOwned;

pub use error::{Error, ErrorKind};
pub use registry::ToolRegistry;
pub use spec::{ParameterSpec, ParameterType, ToolSpec};

/// The result of a tool call.
pub type ToolResult = Result<String, Error>;

/// A tool that can be called by the model.
///
/// Implementations of this trait should be stateless, and may not maintain any
/// internal state.
///
/// The tool can be context-aware, meaning it can access additional information
/// about the current execution context, such as an API key or an HTTP client.
/// To do this, make the context an immutable state of the tool, which can be
/// set during initialization, and copy it when executing.
pub trait Tool: Send + Sync + 'static {
    /// The type of input that the tool accepts.
    type Input: DeserializeOwned;

    /// Returns the advertised signature of the tool.
    ///
    /// Arguments are checked against it before they are deserialized into
    /// [`Self::Input`].
    fn spec(&self) -> &ToolSpec;

    /// Executes the tool with the given input.
    ///
    /// This method must return a future that is fully independent of `self`,
    /// and the future should be cancellation safe.
    fn execute(
        &self,
        input: Self::Input,
    ) -> impl Future<Output = ToolResult> + Send + 'static;
}
