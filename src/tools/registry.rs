//! Static tool registry
//!
//! Tools are registered once at startup through [`ToolRegistryBuilder`];
//! the built [`ToolRegistry`] is immutable and shared by `Arc`. Dispatch is a
//! map lookup followed by a call on the tool's [`ToolHandler`].

use super::permissions::Permission;
use super::schema::is_object_schema;
use crate::error::{GuardError, Result};
use crate::sandbox::SandboxContext;
use crate::types::RiskTier;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Broad class of side effect a tool has; selects parameter treatment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolKind {
    /// Runs shell commands; shell metacharacters are expected in its input
    Shell,
    /// Reads or writes files; path parameters are canonicalized
    Filesystem,
    /// Talks to remote hosts; URL parameters are protocol-restricted
    Network,
    /// Queries a database
    Database,
    /// Pure computation
    Compute,
}

impl fmt::Display for ToolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ToolKind::Shell => write!(f, "shell"),
            ToolKind::Filesystem => write!(f, "filesystem"),
            ToolKind::Network => write!(f, "network"),
            ToolKind::Database => write!(f, "database"),
            ToolKind::Compute => write!(f, "compute"),
        }
    }
}

/// Entry point of a tool's business logic
///
/// Handlers run inside the sandbox and must go through `ctx` for memory,
/// CPU, network, and filesystem access so the caps hold.
#[async_trait]
pub trait ToolHandler: Send + Sync {
    async fn execute(&self, params: Value, ctx: SandboxContext) -> Result<Value>;
}

/// Fixed-shape record describing one tool
#[derive(Clone)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema (object) for the parameters
    pub schema: Value,
    pub permissions: Vec<Permission>,
    pub risk_tier: RiskTier,
    pub kind: ToolKind,
    pub handler: Arc<dyn ToolHandler>,
}

impl fmt::Debug for ToolDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ToolDefinition")
            .field("name", &self.name)
            .field("risk_tier", &self.risk_tier)
            .field("kind", &self.kind)
            .field("permissions", &self.permissions)
            .finish_non_exhaustive()
    }
}

impl ToolDefinition {
    /// A tool accepting any object, requiring no permissions
    pub fn new(
        name: impl Into<String>,
        kind: ToolKind,
        risk_tier: RiskTier,
        handler: Arc<dyn ToolHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            schema: serde_json::json!({"type": "object"}),
            permissions: Vec::new(),
            risk_tier,
            kind,
            handler,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = schema;
        self
    }

    pub fn require(mut self, permission: Permission) -> Self {
        self.permissions.push(permission);
        self
    }
}

/// Collects definitions before the registry is frozen
#[derive(Default)]
pub struct ToolRegistryBuilder {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a tool; names must be unique and schemas must describe objects
    pub fn register(mut self, tool: ToolDefinition) -> Result<Self> {
        if tool.name.trim().is_empty() {
            return Err(GuardError::Config("Tool name must not be empty".to_string()));
        }
        if !is_object_schema(&tool.schema) {
            return Err(GuardError::Config(format!(
                "Tool '{}' parameter schema must be an object schema",
                tool.name
            )));
        }
        if self.tools.contains_key(&tool.name) {
            return Err(GuardError::Config(format!(
                "Tool '{}' is already registered",
                tool.name
            )));
        }
        tracing::debug!(tool = %tool.name, risk_tier = %tool.risk_tier, kind = %tool.kind, "Registered tool");
        self.tools.insert(tool.name.clone(), Arc::new(tool));
        Ok(self)
    }

    pub fn build(self) -> ToolRegistry {
        ToolRegistry { tools: self.tools }
    }
}

/// Immutable name → definition map
#[derive(Debug, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<ToolDefinition>>,
}

impl ToolRegistry {
    pub fn builder() -> ToolRegistryBuilder {
        ToolRegistryBuilder::new()
    }

    pub fn get(&self, name: &str) -> Option<Arc<ToolDefinition>> {
        self.tools.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Registered names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.tools.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}
