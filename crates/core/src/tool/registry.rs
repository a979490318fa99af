use std::collections::HashMap;
use std::fmt::{self, Debug};
use std::future::ready;

use model_io_model::{ModelTool, ToolCallRequest};

use super::object::{BoxedToolFuture, ToolObject, ToolObjectImpl};
use super::{Error, Tool};

/// An explicit mapping from tool names to tools.
///
/// Definitions are advertised in registration order.
#[derive(Default)]
pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolObject>>,
    by_name: HashMap<String, usize>,
}

impl ToolRegistry {
    /// Creates an empty registry.
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a tool.
    ///
    /// Fails if the tool signature is malformed or the name is already taken.
    pub fn register<T: Tool>(&mut self, tool: T) -> Result<(), Error> {
        let spec = tool.spec();
        spec.validate()?;
        if self.by_name.contains_key(&spec.name) {
            return Err(Error::registration()
                .with_reason(format!("duplicate tool name `{}`", spec.name)));
        }
        debug!("registered tool `{}`", spec.name);
        self.by_name.insert(spec.name.clone(), self.tools.len());
        self.tools.push(Box::new(ToolObjectImpl(tool)));
        Ok(())
    }

    /// Registers a tool, returning the registry for chaining.
    #[inline]
    pub fn with_tool<T: Tool>(mut self, tool: T) -> Result<Self, Error> {
        self.register(tool)?;
        Ok(self)
    }

    /// Returns the number of registered tools.
    #[inline]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    /// Returns `true` if no tool is registered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Returns `true` if a tool named `name` is registered.
    #[inline]
    pub fn contains(&self, name: &str) -> bool {
        self.by_name.contains_key(name)
    }

    /// Returns the definitions to advertise to the model.
    pub fn definitions(&self) -> Vec<ModelTool> {
        self.tools
            .iter()
            .map(|tool| {
                let spec = tool.spec();
                ModelTool {
                    name: spec.name.clone(),
                    description: spec.description.clone(),
                    parameters: spec.parameters_schema(),
                }
            })
            .collect()
    }

    /// Starts handling a tool call request.
    ///
    /// The returned future does not borrow the registry.
    pub fn call(&self, req: &ToolCallRequest) -> BoxedToolFuture {
        let Some(&idx) = self.by_name.get(&req.name) else {
            warn!("tool not found: {}", req.name);
            return Box::pin(ready(Err(Error::unknown_tool(&req.name))));
        };
        trace!("calling a tool ({}) with args: {:?}", req.id, req.arguments);
        self.tools[idx].execute(req.arguments.clone())
    }
}

impl Debug for ToolRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.tools.iter().map(|tool| &tool.spec().name))
            .finish()
    }
}
