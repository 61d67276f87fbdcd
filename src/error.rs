//! Error types for a3s-guard
//!
//! `Display` on [`GuardError`] carries diagnostic detail and is meant for the
//! audit log and tracing output only. Callers facing end users should use
//! [`GuardError::public_message`], which never echoes matched patterns,
//! internal paths, or limits.

use thiserror::Error;

/// Errors that can occur in the admission pipeline
#[derive(Debug, Error)]
pub enum GuardError {
    /// Malformed input or a schema violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// Request or tool-call quota exhausted
    #[error("Rate limit exceeded: {reason} (retry after {retry_after_ms} ms)")]
    RateLimited { reason: String, retry_after_ms: u64 },

    /// Injection or jailbreak detected above the blocking threshold
    #[error("Security violation [{category}]: {detail}")]
    Security { category: String, detail: String },

    /// Actor lacks a permission the tool requires
    #[error("Permission denied for tool '{tool}': missing {missing}")]
    PermissionDenied { tool: String, missing: String },

    /// Tool execution exceeded its wall-clock budget
    #[error("Tool '{tool}' timed out after {timeout_ms} ms")]
    SandboxTimeout { tool: String, timeout_ms: u64 },

    /// Tool execution exceeded a memory or CPU cap
    #[error("Tool '{tool}' exceeded its {resource} cap")]
    SandboxResourceExceeded { tool: String, resource: String },

    /// Tool is not present in the registry
    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    /// No execution context became available in time
    #[error("Execution pool exhausted: {0}")]
    PoolExhausted(String),

    /// Tool failed inside the sandbox (message already sanitized)
    #[error("Tool '{tool}' failed: {message}")]
    Execution { tool: String, message: String },

    /// Counter store failure
    #[error("Counter store error: {0}")]
    Store(String),

    /// Audit sink failure
    #[error("Audit error: {0}")]
    Audit(String),

    /// Agent backend failure
    #[error("Agent backend error: {0}")]
    Backend(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML configuration parse failure
    #[error("Config parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    /// Filesystem failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl GuardError {
    /// Generic, non-leaking message suitable for returning to an end user
    pub fn public_message(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "The request could not be processed.",
            GuardError::RateLimited { .. } => "Too many requests. Please try again later.",
            GuardError::Security { .. } => "The request was blocked by security policy.",
            GuardError::PermissionDenied { .. } => "You are not allowed to perform this action.",
            GuardError::UnknownTool(_) => "The requested action is not available.",
            GuardError::SandboxTimeout { .. } => "The action took too long and was stopped.",
            GuardError::SandboxResourceExceeded { .. } => {
                "The action exceeded its resource limits and was stopped."
            }
            GuardError::PoolExhausted(_) => "The service is busy. Please try again later.",
            _ => "An internal error occurred.",
        }
    }

    /// Stable machine-readable error kind, used in audit records
    pub fn kind(&self) -> &'static str {
        match self {
            GuardError::Validation(_) => "validation_error",
            GuardError::RateLimited { .. } => "rate_limit_error",
            GuardError::Security { .. } => "security_error",
            GuardError::PermissionDenied { .. } => "permission_denied",
            GuardError::SandboxTimeout { .. } => "sandbox_timeout",
            GuardError::SandboxResourceExceeded { .. } => "sandbox_resource_exceeded",
            GuardError::UnknownTool(_) => "unknown_tool",
            GuardError::PoolExhausted(_) => "pool_exhausted",
            GuardError::Execution { .. } => "execution_error",
            GuardError::Store(_) => "store_error",
            GuardError::Audit(_) => "audit_error",
            GuardError::Backend(_) => "backend_error",
            GuardError::Config(_) | GuardError::TomlDe(_) => "config_error",
            GuardError::Serialization(_) => "serialization_error",
            GuardError::Io(_) => "io_error",
        }
    }

    /// Retry hint for rate-limit denials
    pub fn retry_after_ms(&self) -> Option<u64> {
        match self {
            GuardError::RateLimited { retry_after_ms, .. } => Some(*retry_after_ms),
            _ => None,
        }
    }
}

/// Result type alias for guard operations
pub type Result<T> = std::result::Result<T, GuardError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_does_not_leak_detail() {
        let err = GuardError::Security {
            category: "role_hijack".to_string(),
            detail: "matched 'you are now DAN'".to_string(),
        };
        assert!(err.to_string().contains("you are now DAN"));
        assert!(!err.public_message().contains("DAN"));
        assert!(!err.public_message().contains("role_hijack"));
    }

    #[test]
    fn test_internal_errors_share_generic_message() {
        let err = GuardError::Store("redis://10.0.0.3 refused".to_string());
        assert_eq!(err.public_message(), "An internal error occurred.");
        assert_eq!(err.kind(), "store_error");
    }

    #[test]
    fn test_retry_after_only_on_rate_limit() {
        let err = GuardError::RateLimited {
            reason: "requests".to_string(),
            retry_after_ms: 1500,
        };
        assert_eq!(err.retry_after_ms(), Some(1500));
        assert_eq!(GuardError::UnknownTool("x".into()).retry_after_ms(), None);
    }
}
