//! Pipeline configuration
//!
//! Every section has defaults matching the reference policy, so an empty
//! TOML document (or a missing file) yields a working configuration.

use crate::error::{GuardError, Result};
use crate::types::{RiskTier, Severity, Tier};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Top-level configuration for a [`SecurityPipeline`](crate::SecurityPipeline)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GuardConfig {
    #[serde(default)]
    pub sanitizer: SanitizerConfig,

    #[serde(default)]
    pub rate_limits: TierLimits,

    #[serde(default)]
    pub jailbreak: JailbreakConfig,

    #[serde(default)]
    pub tool_budgets: ToolBudgets,

    #[serde(default)]
    pub pool: PoolConfig,

    #[serde(default)]
    pub output: OutputFilterConfig,

    #[serde(default)]
    pub network: NetworkPolicyConfig,

    #[serde(default)]
    pub audit: AuditConfig,
}

impl GuardConfig {
    /// Parse configuration from a TOML string and validate it
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GuardConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    /// Returns default config if the file does not exist.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            tracing::debug!(path = %path.display(), "Guard config not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            GuardError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_toml_str(&content)
    }

    /// Write the configuration as pretty TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| GuardError::Config(format!("Failed to serialize config: {}", e)))?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject out-of-range thresholds, zero ceilings, and bad regexes
    pub fn validate(&self) -> Result<()> {
        if self.sanitizer.block_threshold == 0 || self.sanitizer.block_threshold > 100 {
            return Err(GuardError::Config(
                "sanitizer.block_threshold must be in 1..=100".to_string(),
            ));
        }
        for pattern in self
            .sanitizer
            .extra_patterns
            .iter()
            .chain(self.jailbreak.extra_patterns.iter())
        {
            regex::Regex::new(&pattern.pattern).map_err(|e| {
                GuardError::Config(format!(
                    "Invalid pattern for category '{}': {}",
                    pattern.category, e
                ))
            })?;
        }
        for (name, limit) in [
            ("free", &self.rate_limits.free),
            ("pro", &self.rate_limits.pro),
            ("enterprise", &self.rate_limits.enterprise),
        ] {
            if limit.requests == 0 || limit.tokens == 0 || limit.max_tokens_per_request == 0 {
                return Err(GuardError::Config(format!(
                    "rate_limits.{} ceilings must be positive",
                    name
                )));
            }
        }
        if self.rate_limits.window_ms == 0 || self.tool_budgets.window_ms == 0 {
            return Err(GuardError::Config("window_ms must be positive".to_string()));
        }
        for (name, value) in [
            ("jailbreak.block_confidence", self.jailbreak.block_confidence),
            ("jailbreak.similarity_threshold", self.jailbreak.similarity_threshold),
            ("jailbreak.escalation_threshold", self.jailbreak.escalation_threshold),
            ("output.pii_threshold", self.output.pii_threshold),
            ("output.block_threshold", self.output.block_threshold),
            ("output.redact_threshold", self.output.redact_threshold),
        ] {
            if !(0.0..=1.0).contains(&value) {
                return Err(GuardError::Config(format!("{} must be in [0, 1]", name)));
            }
        }
        if self.pool.size == 0 {
            return Err(GuardError::Config("pool.size must be positive".to_string()));
        }
        if self.audit.memory_capacity == 0 || self.audit.max_file_bytes == 0 {
            return Err(GuardError::Config(
                "audit.memory_capacity and audit.max_file_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// An extra regex category supplied by configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomPattern {
    pub category: String,
    pub pattern: String,
    #[serde(default = "default_custom_severity")]
    pub severity: Severity,
}

fn default_custom_severity() -> Severity {
    Severity::Medium
}

// ─── Sanitizer ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SanitizerConfig {
    /// Risk score at or above which the pipeline blocks (default: 70)
    #[serde(default = "default_block_threshold")]
    pub block_threshold: u32,

    /// Appended after the built-in categories
    #[serde(default)]
    pub extra_patterns: Vec<CustomPattern>,
}

fn default_block_threshold() -> u32 {
    70
}

impl Default for SanitizerConfig {
    fn default() -> Self {
        Self {
            block_threshold: default_block_threshold(),
            extra_patterns: Vec::new(),
        }
    }
}

// ─── Rate limits ─────────────────────────────────────────────────

/// Ceilings for a single tier within one window
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierLimit {
    pub requests: u64,
    pub tokens: u64,
    pub max_tokens_per_request: u64,
}

/// Per-tier ceilings and the fixed window length
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TierLimits {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_free_limit")]
    pub free: TierLimit,

    #[serde(default = "default_pro_limit")]
    pub pro: TierLimit,

    #[serde(default = "default_enterprise_limit")]
    pub enterprise: TierLimit,
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_free_limit() -> TierLimit {
    TierLimit {
        requests: 10,
        tokens: 5_000,
        max_tokens_per_request: 1_000,
    }
}

fn default_pro_limit() -> TierLimit {
    TierLimit {
        requests: 60,
        tokens: 100_000,
        max_tokens_per_request: 16_000,
    }
}

fn default_enterprise_limit() -> TierLimit {
    TierLimit {
        requests: 300,
        tokens: 500_000,
        max_tokens_per_request: 64_000,
    }
}

impl Default for TierLimits {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            free: default_free_limit(),
            pro: default_pro_limit(),
            enterprise: default_enterprise_limit(),
        }
    }
}

impl TierLimits {
    pub fn for_tier(&self, tier: Tier) -> TierLimit {
        match tier {
            Tier::Free => self.free,
            Tier::Pro => self.pro,
            Tier::Enterprise => self.enterprise,
        }
    }
}

// ─── Jailbreak ───────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JailbreakConfig {
    /// Confidence above which the pipeline blocks (default: 0.7)
    #[serde(default = "default_block_confidence")]
    pub block_confidence: f64,

    /// Cosine similarity above which a known attack counts as a hit (default: 0.85)
    #[serde(default = "default_similarity_threshold")]
    pub similarity_threshold: f64,

    /// Multi-turn escalation score that raises a signal (default: 0.6)
    #[serde(default = "default_escalation_threshold")]
    pub escalation_threshold: f64,

    #[serde(default)]
    pub extra_patterns: Vec<CustomPattern>,
}

fn default_block_confidence() -> f64 {
    0.7
}

fn default_similarity_threshold() -> f64 {
    0.85
}

fn default_escalation_threshold() -> f64 {
    0.6
}

impl Default for JailbreakConfig {
    fn default() -> Self {
        Self {
            block_confidence: default_block_confidence(),
            similarity_threshold: default_similarity_threshold(),
            escalation_threshold: default_escalation_threshold(),
            extra_patterns: Vec::new(),
        }
    }
}

// ─── Tool budgets ────────────────────────────────────────────────

/// Per-tool, per-actor call budgets keyed by risk tier
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolBudgets {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
    #[serde(default = "default_low_budget")]
    pub low: u64,
    #[serde(default = "default_medium_budget")]
    pub medium: u64,
    #[serde(default = "default_high_budget")]
    pub high: u64,
    #[serde(default = "default_critical_budget")]
    pub critical: u64,
}

fn default_low_budget() -> u64 {
    100
}

fn default_medium_budget() -> u64 {
    30
}

fn default_high_budget() -> u64 {
    10
}

fn default_critical_budget() -> u64 {
    3
}

impl Default for ToolBudgets {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            low: default_low_budget(),
            medium: default_medium_budget(),
            high: default_high_budget(),
            critical: default_critical_budget(),
        }
    }
}

impl ToolBudgets {
    pub fn for_tier(&self, tier: RiskTier) -> u64 {
        match tier {
            RiskTier::Low => self.low,
            RiskTier::Medium => self.medium,
            RiskTier::High => self.high,
            RiskTier::Critical => self.critical,
        }
    }
}

// ─── Execution pool ──────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of reusable execution contexts (default: 8)
    #[serde(default = "default_pool_size")]
    pub size: usize,

    /// Callers already waiting beyond this are rejected outright (default: 32)
    #[serde(default = "default_max_waiters")]
    pub max_waiters: usize,

    /// How long a caller waits for a context (default: 5000 ms)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
}

fn default_pool_size() -> usize {
    8
}

fn default_max_waiters() -> usize {
    32
}

fn default_acquire_timeout_ms() -> u64 {
    5_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            size: default_pool_size(),
            max_waiters: default_max_waiters(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
        }
    }
}

// ─── Output filter ───────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputFilterConfig {
    /// PII confidence at or above which a span is redacted (default: 0.5)
    #[serde(default = "default_half")]
    pub pii_threshold: f64,

    /// Harmful-instruction score at or above which output is blocked (default: 0.5)
    #[serde(default = "default_half")]
    pub block_threshold: f64,

    /// Score at or above which other categories are redacted instead of warned (default: 0.7)
    #[serde(default = "default_redact_threshold")]
    pub redact_threshold: f64,

    /// Text that replaces blocked output
    #[serde(default = "default_policy_message")]
    pub policy_message: String,
}

fn default_half() -> f64 {
    0.5
}

fn default_redact_threshold() -> f64 {
    0.7
}

fn default_policy_message() -> String {
    "This response was withheld because it violates the content policy.".to_string()
}

impl Default for OutputFilterConfig {
    fn default() -> Self {
        Self {
            pii_threshold: default_half(),
            block_threshold: default_half(),
            redact_threshold: default_redact_threshold(),
            policy_message: default_policy_message(),
        }
    }
}

// ─── Network policy ──────────────────────────────────────────────

/// Hosts reachable from sandboxes running in `restricted` network mode
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkPolicyConfig {
    /// Exact hosts or `*.suffix` wildcards
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
}

fn default_allowed_domains() -> Vec<String> {
    vec![
        "api.github.com".to_string(),
        "*.githubusercontent.com".to_string(),
        "pypi.org".to_string(),
        "registry.npmjs.org".to_string(),
        "crates.io".to_string(),
    ]
}

impl Default for NetworkPolicyConfig {
    fn default() -> Self {
        Self {
            allowed_domains: default_allowed_domains(),
        }
    }
}

// ─── Audit ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Records kept by the in-memory sink (default: 10000)
    #[serde(default = "default_memory_capacity")]
    pub memory_capacity: usize,

    /// Active JSONL file size that triggers rotation (default: 10 MiB)
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,

    /// Prune rotated JSONL files beyond this many, oldest first
    /// (default: none, every record is kept)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_rotated_files: Option<usize>,
}

fn default_memory_capacity() -> usize {
    10_000
}

fn default_max_file_bytes() -> u64 {
    10 * 1024 * 1024
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            memory_capacity: default_memory_capacity(),
            max_file_bytes: default_max_file_bytes(),
            max_rotated_files: None,
        }
    }
}
