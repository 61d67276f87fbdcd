//! Capability handle passed to tool handlers
//!
//! Handlers account for memory and compute through the context and ask it
//! before touching the network or filesystem. A charge that would cross a
//! cap is refused, so the recorded usage never exceeds the caps.

use super::config::{FilesystemMode, NetworkMode, SandboxConfig};
use super::network::{parse_url, NetworkPolicy};
use crate::error::{GuardError, Result};
use crate::tools::params::canonicalize_path;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Resource usage of one execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceUsage {
    /// Peak memory charged
    pub memory_bytes: u64,
    pub cpu_ms: u64,
    pub wall_ms: u64,
}

impl ResourceUsage {
    pub fn within(&self, config: &SandboxConfig) -> bool {
        self.memory_bytes <= config.memory_bytes
            && self.cpu_ms <= config.cpu_ms
            && self.wall_ms <= config.timeout_ms
    }
}

#[derive(Debug, Default)]
pub(crate) struct Meter {
    memory_current: AtomicU64,
    memory_peak: AtomicU64,
    cpu_ms: AtomicU64,
}

impl Meter {
    /// Add `amount` to `counter` unless the result would pass `cap`
    fn charge(counter: &AtomicU64, amount: u64, cap: u64) -> std::result::Result<u64, u64> {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(amount).filter(|next| *next <= cap)
            })
            .map(|previous| previous + amount)
    }
}

#[derive(Clone)]
pub struct SandboxContext {
    tool: String,
    slot_id: usize,
    config: SandboxConfig,
    meter: Arc<Meter>,
    network: Arc<NetworkPolicy>,
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("tool", &self.tool)
            .field("slot_id", &self.slot_id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxContext {
    pub(crate) fn new(
        tool: &str,
        slot_id: usize,
        config: SandboxConfig,
        meter: Arc<Meter>,
        network: Arc<NetworkPolicy>,
    ) -> Self {
        Self {
            tool: tool.to_string(),
            slot_id,
            config,
            meter,
            network,
        }
    }

    /// A context outside any pool, for exercising handlers directly
    pub fn detached(tool: &str, config: SandboxConfig) -> Self {
        Self::new(
            tool,
            0,
            config,
            Arc::new(Meter::default()),
            Arc::new(NetworkPolicy::default()),
        )
    }

    pub fn tool(&self) -> &str {
        &self.tool
    }

    pub fn slot_id(&self) -> usize {
        self.slot_id
    }

    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    fn exceeded(&self, resource: &str) -> GuardError {
        tracing::warn!(tool = %self.tool, resource, "Sandbox cap exceeded");
        GuardError::SandboxResourceExceeded {
            tool: self.tool.clone(),
            resource: resource.to_string(),
        }
    }

    /// Reserve `bytes` of memory
    pub fn charge_memory(&self, bytes: u64) -> Result<()> {
        let current = Meter::charge(&self.meter.memory_current, bytes, self.config.memory_bytes)
            .map_err(|_| self.exceeded("memory"))?;
        self.meter.memory_peak.fetch_max(current, Ordering::SeqCst);
        Ok(())
    }

    /// Give back memory reserved with [`charge_memory`](Self::charge_memory)
    pub fn release_memory(&self, bytes: u64) {
        let _ = self
            .meter
            .memory_current
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |c| Some(c.saturating_sub(bytes)));
    }

    /// Account `ms` of compute
    pub fn charge_cpu(&self, ms: u64) -> Result<()> {
        Meter::charge(&self.meter.cpu_ms, ms, self.config.cpu_ms)
            .map(|_| ())
            .map_err(|_| self.exceeded("cpu"))
    }

    /// Whether the sandbox may open a connection to `url`
    pub fn check_network(&self, url: &str) -> Result<()> {
        let allowed = match self.config.network {
            NetworkMode::None => false,
            NetworkMode::Full => parse_url(url).is_some(),
            NetworkMode::Restricted => parse_url(url).is_some_and(|(scheme, host)| {
                matches!(scheme.as_str(), "http" | "https") && self.network.allows_host(&host)
            }),
        };
        if allowed {
            Ok(())
        } else {
            Err(self.exceeded("network"))
        }
    }

    /// Whether the sandbox may read (or write) `path`
    ///
    /// Workspace-confined modes accept only relative paths that stay inside
    /// the workspace after lexical normalization.
    pub fn check_path(&self, path: &str, write: bool) -> Result<()> {
        let allowed = match self.config.filesystem {
            FilesystemMode::None => false,
            FilesystemMode::Full => true,
            FilesystemMode::ReadOnly => !write && inside_workspace(path),
            FilesystemMode::Restricted => inside_workspace(path),
        };
        if allowed {
            Ok(())
        } else {
            Err(self.exceeded("filesystem"))
        }
    }

    /// Usage so far, clamped to the caps
    pub fn usage(&self, wall: Duration) -> ResourceUsage {
        ResourceUsage {
            memory_bytes: self
                .meter
                .memory_peak
                .load(Ordering::SeqCst)
                .min(self.config.memory_bytes),
            cpu_ms: self.meter.cpu_ms.load(Ordering::SeqCst).min(self.config.cpu_ms),
            wall_ms: (wall.as_millis() as u64).min(self.config.timeout_ms),
        }
    }
}

fn inside_workspace(path: &str) -> bool {
    let path = path.trim();
    if path.is_empty() || path.starts_with('/') || path.starts_with('~') || path.contains(':') {
        return false;
    }
    let mut depth: i64 = 0;
    for segment in canonicalize_path(path).split('/') {
        match segment {
            ".." => depth -= 1,
            "." | "" => {}
            _ => depth += 1,
        }
        if depth < 0 {
            return false;
        }
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::RiskTier;

    fn ctx(tier: RiskTier) -> SandboxContext {
        SandboxContext::detached("probe", SandboxConfig::for_tier(tier))
    }

    #[test]
    fn test_memory_cap() {
        let ctx = ctx(RiskTier::Critical);
        let cap = ctx.config().memory_bytes;
        ctx.charge_memory(cap - 10).unwrap();
        let err = ctx.charge_memory(11).unwrap_err();
        assert!(matches!(err, GuardError::SandboxResourceExceeded { ref resource, .. } if resource == "memory"));

        ctx.release_memory(cap);
        ctx.charge_memory(cap).unwrap();
        assert_eq!(ctx.usage(Duration::ZERO).memory_bytes, cap);
    }

    #[test]
    fn test_cpu_cap() {
        let ctx = ctx(RiskTier::High);
        ctx.charge_cpu(1_500).unwrap();
        assert!(ctx.charge_cpu(600).is_err());
        assert_eq!(ctx.usage(Duration::ZERO).cpu_ms, 1_500);
    }

    #[test]
    fn test_usage_never_exceeds_caps() {
        let ctx = ctx(RiskTier::Critical);
        let _ = ctx.charge_cpu(u64::MAX);
        let _ = ctx.charge_memory(u64::MAX);
        let usage = ctx.usage(Duration::from_secs(3_600));
        assert!(usage.within(ctx.config()));
    }

    #[test]
    fn test_network_modes() {
        assert!(ctx(RiskTier::Low).check_network("https://example.com").is_ok());
        assert!(ctx(RiskTier::Medium).check_network("https://api.github.com/repos").is_ok());
        assert!(ctx(RiskTier::Medium).check_network("https://example.com").is_err());
        assert!(ctx(RiskTier::Medium).check_network("ftp://pypi.org").is_err());
        assert!(ctx(RiskTier::Critical).check_network("https://api.github.com").is_err());
    }

    #[test]
    fn test_filesystem_modes() {
        assert!(ctx(RiskTier::Low).check_path("out/report.txt", true).is_ok());
        assert!(ctx(RiskTier::Low).check_path("/etc/passwd", false).is_err());
        assert!(ctx(RiskTier::Low).check_path("a/../../b", false).is_err());
        assert!(ctx(RiskTier::High).check_path("docs/readme.md", false).is_ok());
        assert!(ctx(RiskTier::High).check_path("docs/readme.md", true).is_err());
        assert!(ctx(RiskTier::Critical).check_path("docs/readme.md", false).is_err());
    }
}
