//! Registry of tools advertised by the module manager.
//!
//! The registry keeps the descriptor list in advertisement order (for
//! `tools/list`) and a name index for lookups. Registration is all-or-nothing:
//! a duplicate name rejects the whole set.

use std::collections::HashMap;

use tracing::debug;

use crate::core::error::{Result, ServerError};
use crate::core::module::ModuleManager;
use crate::core::protocol::Tool;

#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    /// Registered tools, in the order the module advertised them
    tools: Vec<Tool>,
    /// Tool name -> position in `tools`
    index: HashMap<String, usize>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register every tool the module manager advertises.
    pub fn from_module(module: &dyn ModuleManager) -> Result<Self> {
        let mut registry = Self::new();
        for tool in module.get_tools() {
            registry.register(tool)?;
        }
        Ok(registry)
    }

    /// Add a tool descriptor. Fails if the name is already taken.
    pub fn register(&mut self, tool: Tool) -> Result<()> {
        if self.index.contains_key(&tool.name) {
            return Err(ServerError::DuplicateTool(tool.name));
        }
        debug!(tool = %tool.name, "Registered tool");
        self.index.insert(tool.name.clone(), self.tools.len());
        self.tools.push(tool);
        Ok(())
    }

    pub fn list(&self) -> &[Tool] {
        &self.tools
    }

    pub fn get(&self, name: &str) -> Option<&Tool> {
        self.index.get(name).map(|&i| &self.tools[i])
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
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
    use serde_json::json;

    fn tool(name: &str) -> Tool {
        Tool::new(name, format!("{name} tool"), json!({"type": "object"}))
    }

    #[test]
    fn keeps_advertisement_order() {
        let mut registry = ToolRegistry::new();
        for name in ["b", "a", "c"] {
            registry.register(tool(name)).unwrap();
        }
        let names: Vec<_> = registry.list().iter().map(|t| t.name.as_str()).collect();
        assert_eq!(names, ["b", "a", "c"]);
        assert_eq!(registry.get("a"), Some(&tool("a")));
        assert!(registry.get("z").is_none());
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let mut registry = ToolRegistry::new();
        registry.register(tool("echo")).unwrap();
        let err = registry.register(tool("echo")).unwrap_err();
        assert!(matches!(err, ServerError::DuplicateTool(name) if name == "echo"));
        assert_eq!(registry.len(), 1);
    }
}
