use crate::function_calling::{ToolDefinition, ToolProvider};

/// Snapshot of the tools advertised by the provider at startup.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: Vec<ToolDefinition>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<ToolDefinition>) -> Self {
        Self { tools }
    }

    /// Ask the provider for its tools. Called once per session.
    ///
    /// An empty list is valid. A provider failure is logged and yields an
    /// empty registry; the session continues without tools.
    pub async fn load(provider: &dyn ToolProvider) -> Self {
        match provider.list_tools().await {
            Ok(tools) => {
                tracing::info!(count = tools.len(), "loaded tool list");
                for tool in &tools {
                    tracing::debug!(tool = %tool.name, "  - {}", tool.description);
                }
                Self::new(tools)
            }
            Err(e) => {
                tracing::error!("failed to list tools, continuing without tools: {}", e);
                Self::default()
            }
        }
    }

    pub fn definitions(&self) -> &[ToolDefinition] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&ToolDefinition> {
        self.tools.iter().find(|tool| tool.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tools.iter().map(|tool| tool.name.as_str())
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
