//! Tool-call validation
//!
//! Runs the ordered admission checks for a single tool call:
//!
//! 1. structure (`name` and object `parameters` present)
//! 2. registry lookup
//! 3. parameter schema
//! 4. actor permissions
//! 5. per-tool, per-actor call budget (sliding window)
//! 6. parameter threat scan
//! 7. parameter sanitization
//!
//! Steps 1–5 stop at the first failure. A call is valid only when the tool
//! resolved and no violation is critical.

use super::params::{self, ParamFinding, ParamThreat};
use super::permissions::missing_permissions;
use super::registry::{ToolDefinition, ToolRegistry};
use super::schema;
use super::ToolCall;
use crate::config::ToolBudgets;
use crate::error::{GuardError, Result};
use crate::ratelimit::{count_at, CounterStore, KeyedLocks, Window};
use crate::types::{now_millis, RequestContext, Severity};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

const CALLS_FIELD: &str = "calls";

/// What a violation is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ViolationKind {
    MalformedCall,
    UnknownTool,
    SchemaViolation,
    PermissionDenied,
    RateLimited,
    PathTraversal,
    CommandInjection,
    SqlInjection,
    DisallowedProtocol,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::MalformedCall => "malformed_call",
            ViolationKind::UnknownTool => "unknown_tool",
            ViolationKind::SchemaViolation => "schema_violation",
            ViolationKind::PermissionDenied => "permission_denied",
            ViolationKind::RateLimited => "rate_limited",
            ViolationKind::PathTraversal => "path_traversal",
            ViolationKind::CommandInjection => "command_injection",
            ViolationKind::SqlInjection => "sql_injection",
            ViolationKind::DisallowedProtocol => "disallowed_protocol",
        }
    }
}

impl From<ParamThreat> for ViolationKind {
    fn from(threat: ParamThreat) -> Self {
        match threat {
            ParamThreat::PathTraversal => ViolationKind::PathTraversal,
            ParamThreat::CommandInjection => ViolationKind::CommandInjection,
            ParamThreat::SqlInjection => ViolationKind::SqlInjection,
            ParamThreat::DisallowedProtocol => ViolationKind::DisallowedProtocol,
        }
    }
}

/// A single failed check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Violation {
    pub kind: ViolationKind,
    pub severity: Severity,
    pub detail: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl Violation {
    fn new(kind: ViolationKind, severity: Severity, detail: impl Into<String>) -> Self {
        Self {
            kind,
            severity,
            detail: detail.into(),
            path: None,
            retry_after_ms: None,
        }
    }

    fn from_finding(finding: ParamFinding) -> Self {
        Self {
            kind: finding.threat.into(),
            severity: finding.threat.severity(),
            detail: finding.detail,
            path: Some(finding.path),
            retry_after_ms: None,
        }
    }

    pub fn is_critical(&self) -> bool {
        self.severity == Severity::Critical
    }
}

/// Result of [`ToolCallValidator::validate`]
#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub valid: bool,
    pub tool_name: String,
    pub tool: Option<Arc<ToolDefinition>>,
    pub sanitized_parameters: Option<Value>,
    pub violations: Vec<Violation>,
}

/// A call that passed validation, ready for the sandbox
#[derive(Debug, Clone)]
pub struct ValidatedCall {
    pub tool: Arc<ToolDefinition>,
    pub parameters: Value,
    /// Non-critical violations carried as findings
    pub warnings: Vec<Violation>,
}

impl ValidationOutcome {
    fn rejected(tool_name: &str, tool: Option<Arc<ToolDefinition>>, violation: Violation) -> Self {
        Self {
            valid: false,
            tool_name: tool_name.to_string(),
            tool,
            sanitized_parameters: None,
            violations: vec![violation],
        }
    }

    /// The violation that makes this call invalid, if any
    pub fn blocking_violation(&self) -> Option<&Violation> {
        self.violations
            .iter()
            .find(|v| v.is_critical())
            .or_else(|| self.violations.iter().find(|v| v.kind == ViolationKind::UnknownTool))
    }

    /// Convert into a [`ValidatedCall`] or the error matching the blocking violation
    pub fn into_result(self) -> Result<ValidatedCall> {
        if self.valid {
            if let (Some(tool), Some(parameters)) = (self.tool, self.sanitized_parameters) {
                return Ok(ValidatedCall {
                    tool,
                    parameters,
                    warnings: self.violations,
                });
            }
            return Err(GuardError::Validation(format!(
                "Tool call '{}' validated without parameters",
                self.tool_name
            )));
        }

        let Some(violation) = self.blocking_violation() else {
            return Err(GuardError::Validation(format!(
                "Tool call '{}' rejected",
                self.tool_name
            )));
        };
        let tool = self.tool_name.clone();
        Err(match violation.kind {
            ViolationKind::MalformedCall | ViolationKind::SchemaViolation => {
                GuardError::Validation(violation.detail.clone())
            }
            ViolationKind::UnknownTool => GuardError::UnknownTool(tool),
            ViolationKind::PermissionDenied => GuardError::PermissionDenied {
                tool,
                missing: violation.detail.clone(),
            },
            ViolationKind::RateLimited => GuardError::RateLimited {
                reason: violation.detail.clone(),
                retry_after_ms: violation.retry_after_ms.unwrap_or(0),
            },
            ViolationKind::PathTraversal
            | ViolationKind::CommandInjection
            | ViolationKind::SqlInjection
            | ViolationKind::DisallowedProtocol => GuardError::Security {
                category: violation.kind.as_str().to_string(),
                detail: match &violation.path {
                    Some(path) => format!("{} at {}", violation.detail, path),
                    None => violation.detail.clone(),
                },
            },
        })
    }
}

/// Authorization and argument checks for tool calls
pub struct ToolCallValidator {
    registry: Arc<ToolRegistry>,
    store: Arc<dyn CounterStore>,
    budgets: ToolBudgets,
    locks: KeyedLocks,
}

impl ToolCallValidator {
    pub fn new(registry: Arc<ToolRegistry>, store: Arc<dyn CounterStore>, budgets: ToolBudgets) -> Self {
        Self {
            registry,
            store,
            budgets,
            locks: KeyedLocks::default(),
        }
    }

    pub fn registry(&self) -> &Arc<ToolRegistry> {
        &self.registry
    }

    /// Run every check for `call` on behalf of `ctx`
    ///
    /// `Err` only for counter store failures; rejections are reported in
    /// the outcome.
    pub async fn validate(&self, call: &ToolCall, ctx: &RequestContext) -> Result<ValidationOutcome> {
        let outcome = self.run_checks(call, ctx).await?;
        if !outcome.valid {
            if let Some(v) = outcome.blocking_violation() {
                tracing::warn!(
                    tool = %outcome.tool_name,
                    actor = %ctx.actor_id,
                    kind = v.kind.as_str(),
                    severity = %v.severity,
                    "Tool call rejected"
                );
            }
        }
        Ok(outcome)
    }

    async fn run_checks(&self, call: &ToolCall, ctx: &RequestContext) -> Result<ValidationOutcome> {
        // 1. structure
        let name = match call.name.as_deref().map(str::trim) {
            Some(name) if !name.is_empty() => name,
            _ => {
                return Ok(ValidationOutcome::rejected(
                    "",
                    None,
                    Violation::new(ViolationKind::MalformedCall, Severity::Critical, "missing tool name"),
                ))
            }
        };
        let parameters = match &call.parameters {
            Some(p @ Value::Object(_)) => p,
            Some(_) => {
                return Ok(ValidationOutcome::rejected(
                    name,
                    None,
                    Violation::new(
                        ViolationKind::MalformedCall,
                        Severity::Critical,
                        "parameters must be an object",
                    ),
                ))
            }
            None => {
                return Ok(ValidationOutcome::rejected(
                    name,
                    None,
                    Violation::new(ViolationKind::MalformedCall, Severity::Critical, "missing parameters"),
                ))
            }
        };

        // 2. registry
        let Some(tool) = self.registry.get(name) else {
            return Ok(ValidationOutcome::rejected(
                name,
                None,
                Violation::new(ViolationKind::UnknownTool, Severity::High, format!("unknown tool '{}'", name)),
            ));
        };

        // 3. schema
        let schema_errors = schema::validate(parameters, &tool.schema);
        if !schema_errors.is_empty() {
            let detail = schema_errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("; ");
            return Ok(ValidationOutcome::rejected(
                name,
                Some(tool),
                Violation::new(ViolationKind::SchemaViolation, Severity::Critical, detail),
            ));
        }

        // 4. permissions
        let missing = missing_permissions(&ctx.permissions, &tool.permissions);
        if !missing.is_empty() {
            let detail = missing
                .iter()
                .map(|p| p.to_string())
                .collect::<Vec<_>>()
                .join(", ");
            return Ok(ValidationOutcome::rejected(
                name,
                Some(tool),
                Violation::new(ViolationKind::PermissionDenied, Severity::Critical, detail),
            ));
        }

        // 5. call budget
        if let Some(violation) = self.consume_budget(&tool, &ctx.actor_id).await? {
            return Ok(ValidationOutcome::rejected(name, Some(tool), violation));
        }

        // 6. threat scan
        let mut violations: Vec<Violation> = params::scan(parameters, tool.kind)
            .into_iter()
            .map(Violation::from_finding)
            .collect();

        // 7. sanitized copy
        let sanitized = params::sanitize(parameters, tool.kind, &tool.schema);
        violations.extend(sanitized.findings.into_iter().map(Violation::from_finding));

        let valid = !violations.iter().any(Violation::is_critical);
        Ok(ValidationOutcome {
            valid,
            tool_name: name.to_string(),
            tool: Some(tool),
            sanitized_parameters: valid.then_some(sanitized.value),
            violations,
        })
    }

    /// Sliding-window budget: previous window weighted by the unelapsed share
    async fn consume_budget(&self, tool: &ToolDefinition, actor: &str) -> Result<Option<Violation>> {
        let ceiling = self.budgets.for_tier(tool.risk_tier);
        let window = Window::at(now_millis(), self.budgets.window_ms);

        let _guard = self.locks.lock(&format!("{}:{}", tool.name, actor)).await;

        let current_key = format!("tb:{}:{}:{}", tool.name, actor, window.index);
        let previous = match window.index.checked_sub(1) {
            Some(prev) => {
                let previous_key = format!("tb:{}:{}:{}", tool.name, actor, prev);
                self.store.get(&previous_key, CALLS_FIELD).await?.max(0) as f64
            }
            None => 0.0,
        };

        let counts = self
            .store
            .increment(&current_key, &[(CALLS_FIELD, 1)], window.ttl() * 2)
            .await?;
        let current = count_at(&counts, 0) as f64;
        let weighted = previous * (1.0 - window.elapsed_fraction()) + current;

        if weighted > ceiling as f64 {
            self.store.decrement(&current_key, &[(CALLS_FIELD, 1)]).await?;
            let mut violation = Violation::new(
                ViolationKind::RateLimited,
                Severity::Critical,
                format!("call budget of {} per window exhausted", ceiling),
            );
            violation.retry_after_ms = Some(window.remaining_ms());
            return Ok(Some(violation));
        }
        Ok(None)
    }
}
