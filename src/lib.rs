//! # a3s-guard
//!
//! Security admission pipeline for LLM agents.
//!
//! ## Overview
//!
//! Every user turn passes through an ordered set of checks before the agent
//! sees it, every tool call the agent emits is validated and executed in a
//! capped sandbox, and every response is filtered before delivery. Each
//! stage can admit, annotate, or block; a block stops the run and is
//! reported to the caller as a sanitized error.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_guard::{GuardConfig, RequestContext, SecurityPipeline, Tier, ToolRegistry};
//! use std::sync::Arc;
//!
//! # async fn example() -> a3s_guard::Result<()> {
//! let pipeline = SecurityPipeline::from_config(
//!     GuardConfig::default(),
//!     Arc::new(ToolRegistry::default()),
//! )?;
//!
//! let ctx = RequestContext::new("user-42", Tier::Pro, "session-1");
//! let admitted = pipeline
//!     .process_input("Summarize the attached report", &ctx)
//!     .await?;
//! println!("risk score: {}", admitted.risk.risk_score());
//!
//! let outcome = pipeline
//!     .filter_output("Your card 4532 1234 5678 9012 is on file.", &ctx)
//!     .await?;
//! assert_eq!(outcome.filtered, "Your card [CARD REDACTED] is on file.");
//! # Ok(())
//! # }
//! ```
//!
//! ## Stages
//!
//! - **sanitizer**: Unicode normalization and injection-pattern scoring
//! - **ratelimit**: per-actor request and token quotas over fixed windows
//! - **jailbreak**: pattern, decoded-payload, similarity, and multi-turn detection
//! - **tools**: registry, schema, permission, parameter, and budget validation
//! - **sandbox**: pooled execution contexts with memory, CPU, time, network, and filesystem caps
//! - **output**: PII redaction and content-policy filtering
//! - **audit**: one record per run, in memory or as rotating JSONL files
//!
//! ## Architecture
//!
//! - **SecurityPipeline**: the orchestrator; `process_input`, `process_tool_call`, `filter_output`, `run`
//! - **CounterStore** trait: atomic counters behind quotas and tool budgets
//! - **ToolHandler** trait: what a registered tool runs inside its sandbox
//! - **ContentClassifier** / **EmbeddingModel** traits: pluggable models
//! - **AuditSink** trait: where audit records go

pub mod audit;
pub mod config;
pub mod error;
pub mod jailbreak;
pub mod normalize;
pub mod output;
pub mod pipeline;
pub mod ratelimit;
pub mod sandbox;
pub mod sanitizer;
pub mod tools;
pub mod types;

// Re-export core types
pub use audit::{AuditRecord, AuditSink, Disposition, JsonlAuditSink, MemoryAuditSink, StageOutcome};
pub use config::GuardConfig;
pub use error::{GuardError, Result};
pub use jailbreak::{JailbreakCategory, JailbreakDetector, JailbreakVerdict};
pub use output::{ContentClassifier, FilterAction, FilterOutcome, OutputFilter};
pub use pipeline::{
    AgentBackend, AgentTurn, BlockedRun, Delivery, PipelineOutcome, PipelineState, ProcessedInput,
    SecurityPipeline, SecurityPipelineBuilder,
};
pub use ratelimit::{CounterStore, MemoryCounterStore, RateDecision, RateLimiter};
pub use sandbox::{ContextPool, ExecutionResult, SandboxConfig, SandboxContext, SandboxExecutor};
pub use sanitizer::{SanitizedInput, Sanitizer};
pub use tools::{
    Action, Permission, ToolCall, ToolCallValidator, ToolDefinition, ToolHandler, ToolKind,
    ToolRegistry, ValidationOutcome,
};
pub use types::{
    Finding, Request, RequestContext, RiskAssessment, RiskTier, Severity, Tier, Turn,
};
