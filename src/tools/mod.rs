//! Tool registry, permissions, and call validation

pub mod params;
pub mod permissions;
pub mod registry;
pub mod schema;
pub mod validator;

pub use permissions::{Action, Permission};
pub use registry::{ToolDefinition, ToolHandler, ToolKind, ToolRegistry, ToolRegistryBuilder};
pub use validator::{ToolCallValidator, ValidatedCall, ValidationOutcome, Violation, ViolationKind};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A tool invocation proposed by the agent
///
/// Fields are optional so that malformed calls still deserialize and are
/// rejected by validation with a proper violation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub parameters: Option<Value>,
    #[serde(default)]
    pub request_id: String,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, parameters: Value) -> Self {
        Self {
            name: Some(name.into()),
            parameters: Some(parameters),
            request_id: String::new(),
        }
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }
}
