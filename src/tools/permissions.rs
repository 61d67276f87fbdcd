//! Resource × action permissions
//!
//! Resources are colon-separated names (`data:users`, `fs:workspace`).
//! A granted resource ending in `*` covers every resource sharing its
//! prefix, so `data:*` covers `data:users` and `data:orders:archive`, and a
//! bare `*` covers everything.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What may be done to a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    Read,
    Write,
    Execute,
    Delete,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Read => write!(f, "read"),
            Action::Write => write!(f, "write"),
            Action::Execute => write!(f, "execute"),
            Action::Delete => write!(f, "delete"),
        }
    }
}

/// A single grant or requirement
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Permission {
    pub resource: String,
    pub action: Action,
}

impl Permission {
    pub fn new(resource: impl Into<String>, action: Action) -> Self {
        Self {
            resource: resource.into(),
            action,
        }
    }

    pub fn read(resource: impl Into<String>) -> Self {
        Self::new(resource, Action::Read)
    }

    pub fn write(resource: impl Into<String>) -> Self {
        Self::new(resource, Action::Write)
    }

    pub fn execute(resource: impl Into<String>) -> Self {
        Self::new(resource, Action::Execute)
    }

    pub fn delete(resource: impl Into<String>) -> Self {
        Self::new(resource, Action::Delete)
    }

    /// Whether this grant satisfies `required`
    pub fn grants(&self, required: &Permission) -> bool {
        self.action == required.action && resource_matches(&self.resource, &required.resource)
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.action, self.resource)
    }
}

/// Match a granted resource pattern against a concrete resource
pub fn resource_matches(pattern: &str, resource: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => resource.starts_with(prefix),
        None => pattern == resource,
    }
}

/// Required permissions not covered by any grant
pub fn missing_permissions<'a>(granted: &[Permission], required: &'a [Permission]) -> Vec<&'a Permission> {
    required
        .iter()
        .filter(|req| !granted.iter().any(|g| g.grants(req)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exact_match() {
        assert!(resource_matches("data:users", "data:users"));
        assert!(!resource_matches("data:users", "data:orders"));
    }

    #[test]
    fn test_trailing_wildcard() {
        assert!(resource_matches("data:*", "data:users"));
        assert!(resource_matches("data:*", "data:orders:archive"));
        assert!(!resource_matches("data:*", "fs:workspace"));
        assert!(resource_matches("*", "anything"));
    }

    #[test]
    fn test_action_must_match() {
        let grant = Permission::read("data:*");
        assert!(grant.grants(&Permission::read("data:users")));
        assert!(!grant.grants(&Permission::write("data:users")));
    }

    #[test]
    fn test_missing_permissions() {
        let granted = vec![Permission::read("fs:*"), Permission::execute("shell")];
        let required = vec![
            Permission::read("fs:workspace"),
            Permission::write("fs:workspace"),
            Permission::execute("shell"),
        ];
        let missing = missing_permissions(&granted, &required);
        assert_eq!(missing, vec![&Permission::write("fs:workspace")]);
    }

    #[test]
    fn test_display() {
        assert_eq!(Permission::delete("data:users").to_string(), "delete data:users");
    }
}
