//! Named tool registry

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use parley_core::{Tool, ToolName};

use crate::error::{GatewayError, GatewayResult};

/// Concurrent registry of the tools agents may call.
///
/// # Example
///
/// ```rust
/// use async_trait::async_trait;
/// use parley_core::{Tool, ToolError, ToolName};
/// use parley_tools::ToolRegistry;
/// use serde_json::Value;
/// use std::sync::Arc;
///
/// struct EchoTool;
///
/// #[async_trait]
/// impl Tool for EchoTool {
///     fn name(&self) -> &str { "echo" }
///     async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
///         Ok(arguments.clone())
///     }
/// }
///
/// let registry = ToolRegistry::new();
/// registry.register(Arc::new(EchoTool)).unwrap();
/// assert!(registry.contains(&ToolName::parse("echo").unwrap()));
/// ```
#[derive(Default)]
pub struct ToolRegistry {
    tools: DashMap<ToolName, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool under the name it reports
    pub fn register(&self, tool: Arc<dyn Tool>) -> GatewayResult<ToolName> {
        let name =
            ToolName::parse(tool.name()).map_err(|source| GatewayError::InvalidToolName {
                name: tool.name().to_string(),
                source,
            })?;
        match self.tools.entry(name.clone()) {
            Entry::Occupied(_) => Err(GatewayError::DuplicateTool(name)),
            Entry::Vacant(slot) => {
                slot.insert(tool);
                tracing::debug!(tool = %name, "Registered tool");
                Ok(name)
            }
        }
    }

    /// Builder-style registration
    pub fn with_tool(self, tool: Arc<dyn Tool>) -> GatewayResult<Self> {
        self.register(tool)?;
        Ok(self)
    }

    /// Remove a tool. In-flight executions keep their handle and complete.
    pub fn unregister(&self, name: &ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.remove(name).map(|(_, tool)| tool)
    }

    pub fn get(&self, name: &ToolName) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).map(|tool| Arc::clone(tool.value()))
    }

    pub fn contains(&self, name: &ToolName) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<ToolName> {
        let mut names: Vec<ToolName> = self.tools.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use parley_core::ToolError;
    use serde_json::Value;

    struct Named(&'static str);

    #[async_trait]
    impl Tool for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn execute(&self, arguments: &Value) -> Result<Value, ToolError> {
            Ok(arguments.clone())
        }
    }

    #[test]
    fn register_lookup_and_unregister() {
        let registry = ToolRegistry::new()
            .with_tool(Arc::new(Named("search")))
            .unwrap()
            .with_tool(Arc::new(Named("calc")))
            .unwrap();
        let search = ToolName::parse("search").unwrap();
        assert_eq!(registry.len(), 2);
        assert!(registry.get(&search).is_some());
        assert_eq!(registry.names()[0].as_str(), "calc");

        assert!(registry.unregister(&search).is_some());
        assert!(!registry.contains(&search));
    }

    #[test]
    fn rejects_duplicates_and_invalid_names() {
        let registry = ToolRegistry::new();
        registry.register(Arc::new(Named("search"))).unwrap();
        assert!(matches!(
            registry.register(Arc::new(Named("search"))),
            Err(GatewayError::DuplicateTool(_))
        ));
        assert!(matches!(
            registry.register(Arc::new(Named("bad name"))),
            Err(GatewayError::InvalidToolName { .. })
        ));
    }
}
