//! Resource caps derived from a tool's risk tier
//!
//! The table is fixed and monotonic: every cap of a higher tier is at least
//! as strict as the one below it. Nothing supplied with a call can widen it.

use crate::types::RiskTier;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

const MIB: u64 = 1024 * 1024;

/// Outbound network access, ordered from most to least restrictive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NetworkMode {
    None,
    /// Only hosts on the allow-list
    Restricted,
    Full,
}

/// Filesystem access, ordered from most to least restrictive
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FilesystemMode {
    None,
    /// Reads inside the workspace only
    #[serde(rename = "readonly")]
    ReadOnly,
    /// Reads and writes inside the workspace only
    Restricted,
    Full,
}

impl fmt::Display for NetworkMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkMode::None => write!(f, "none"),
            NetworkMode::Restricted => write!(f, "restricted"),
            NetworkMode::Full => write!(f, "full"),
        }
    }
}

impl fmt::Display for FilesystemMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FilesystemMode::None => write!(f, "none"),
            FilesystemMode::ReadOnly => write!(f, "readonly"),
            FilesystemMode::Restricted => write!(f, "restricted"),
            FilesystemMode::Full => write!(f, "full"),
        }
    }
}

/// Caps applied to one tool execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxConfig {
    pub memory_bytes: u64,
    /// Metered compute, in milliseconds
    pub cpu_ms: u64,
    /// Wall-clock limit, in milliseconds
    pub timeout_ms: u64,
    pub network: NetworkMode,
    pub filesystem: FilesystemMode,
}

impl SandboxConfig {
    pub fn for_tier(tier: RiskTier) -> Self {
        match tier {
            RiskTier::Low => Self {
                memory_bytes: 512 * MIB,
                cpu_ms: 10_000,
                timeout_ms: 30_000,
                network: NetworkMode::Full,
                filesystem: FilesystemMode::Restricted,
            },
            RiskTier::Medium => Self {
                memory_bytes: 256 * MIB,
                cpu_ms: 5_000,
                timeout_ms: 15_000,
                network: NetworkMode::Restricted,
                filesystem: FilesystemMode::Restricted,
            },
            RiskTier::High => Self {
                memory_bytes: 128 * MIB,
                cpu_ms: 2_000,
                timeout_ms: 10_000,
                network: NetworkMode::Restricted,
                filesystem: FilesystemMode::ReadOnly,
            },
            RiskTier::Critical => Self {
                memory_bytes: 64 * MIB,
                cpu_ms: 1_000,
                timeout_ms: 5_000,
                network: NetworkMode::None,
                filesystem: FilesystemMode::None,
            },
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Whether no cap of `self` is looser than the matching cap of `other`
    pub fn is_at_least_as_strict_as(&self, other: &SandboxConfig) -> bool {
        self.memory_bytes <= other.memory_bytes
            && self.cpu_ms <= other.cpu_ms
            && self.timeout_ms <= other.timeout_ms
            && self.network <= other.network
            && self.filesystem <= other.filesystem
    }
}
