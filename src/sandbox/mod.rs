//! Resource-bounded tool execution
//!
//! The executor leases a context from the [`ContextPool`], derives the caps
//! from the tool's risk tier, spawns the handler and races it against the
//! wall-clock timeout. On timeout the task is aborted. The lease moves into
//! the task, so a context only returns to the pool once its handler has
//! actually stopped. Errors and panics are reduced to a scrubbed one-line
//! message before they leave the executor.

pub mod config;
pub mod context;
pub mod network;
pub mod pool;

pub use config::{FilesystemMode, NetworkMode, SandboxConfig};
pub use context::{ResourceUsage, SandboxContext};
pub use network::NetworkPolicy;
pub use pool::{ContextLease, ContextPool};

use crate::error::{GuardError, Result};
use crate::tools::ToolDefinition;
use crate::types::Finding;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::Instrument;

const MAX_ERROR_MESSAGE_CHARS: usize = 200;

/// Why an execution did not succeed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionErrorKind {
    Timeout,
    ResourceExceeded,
    Failed,
}

/// Outcome of one sandboxed execution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub tool: String,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ExecutionErrorKind>,
    /// Scrubbed, single-line error description
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub usage: ResourceUsage,
    pub duration_ms: u64,
    /// Non-blocking observations added after execution
    #[serde(default)]
    pub findings: Vec<Finding>,
}

impl ExecutionResult {
    fn succeeded(tool: &str, output: Value, usage: ResourceUsage) -> Self {
        Self {
            tool: tool.to_string(),
            success: true,
            output: Some(output),
            error_kind: None,
            message: None,
            usage,
            duration_ms: usage.wall_ms,
            findings: Vec::new(),
        }
    }

    fn failed(tool: &str, kind: ExecutionErrorKind, message: String, usage: ResourceUsage) -> Self {
        Self {
            tool: tool.to_string(),
            success: false,
            output: None,
            error_kind: Some(kind),
            message: Some(message),
            usage,
            duration_ms: usage.wall_ms,
            findings: Vec::new(),
        }
    }

    /// Convert a failed execution into its terminal error
    pub fn into_result(self, config: &SandboxConfig) -> Result<ExecutionResult> {
        let tool = self.tool.clone();
        match self.error_kind {
            None => Ok(self),
            Some(ExecutionErrorKind::Timeout) => Err(GuardError::SandboxTimeout {
                tool,
                timeout_ms: config.timeout_ms,
            }),
            Some(ExecutionErrorKind::ResourceExceeded) => Err(GuardError::SandboxResourceExceeded {
                tool,
                resource: self.message.unwrap_or_default(),
            }),
            Some(ExecutionErrorKind::Failed) => Err(GuardError::Execution {
                tool,
                message: self.message.unwrap_or_default(),
            }),
        }
    }
}

/// Runs validated tool calls inside leased contexts
pub struct SandboxExecutor {
    pool: ContextPool,
    network: Arc<NetworkPolicy>,
}

impl SandboxExecutor {
    pub fn new(pool: ContextPool) -> Self {
        Self {
            pool,
            network: Arc::new(NetworkPolicy::default()),
        }
    }

    pub fn with_network_policy(mut self, policy: NetworkPolicy) -> Self {
        self.network = Arc::new(policy);
        self
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    /// Execute `tool` with already-sanitized `params`
    ///
    /// `Err` only when no context could be leased; every other outcome,
    /// including timeouts, is an [`ExecutionResult`].
    pub async fn execute(&self, tool: Arc<ToolDefinition>, params: Value) -> Result<ExecutionResult> {
        let config = SandboxConfig::for_tier(tool.risk_tier);
        let lease = self.pool.acquire().await?;
        let ctx = SandboxContext::new(
            &tool.name,
            lease.slot_id(),
            config,
            lease.meter(),
            self.network.clone(),
        );

        let span = tracing::info_span!(
            "a3s.guard.sandbox",
            tool = %tool.name,
            risk_tier = %tool.risk_tier,
            slot = lease.slot_id()
        );
        let handler = tool.handler.clone();
        let task_ctx = ctx.clone();
        let started = Instant::now();
        let mut task = AbortOnDrop(tokio::spawn(
            async move {
                let _lease = lease;
                handler.execute(params, task_ctx).await
            }
            .instrument(span),
        ));

        let joined = tokio::time::timeout(config.timeout(), &mut task.0).await;
        let usage = ctx.usage(started.elapsed());

        let result = match joined {
            Ok(Ok(Ok(output))) => {
                tracing::debug!(tool = %tool.name, wall_ms = usage.wall_ms, "Tool execution completed");
                ExecutionResult::succeeded(&tool.name, output, usage)
            }
            Ok(Ok(Err(GuardError::SandboxResourceExceeded { resource, .. }))) => ExecutionResult::failed(
                &tool.name,
                ExecutionErrorKind::ResourceExceeded,
                resource,
                usage,
            ),
            Ok(Ok(Err(e))) => {
                tracing::warn!(tool = %tool.name, error = %e, "Tool execution failed");
                ExecutionResult::failed(&tool.name, ExecutionErrorKind::Failed, scrub_error(&e.to_string()), usage)
            }
            Ok(Err(join_error)) => {
                tracing::error!(tool = %tool.name, panicked = join_error.is_panic(), "Tool task did not complete");
                ExecutionResult::failed(
                    &tool.name,
                    ExecutionErrorKind::Failed,
                    "tool terminated unexpectedly".to_string(),
                    usage,
                )
            }
            Err(_) => {
                task.0.abort();
                tracing::warn!(tool = %tool.name, timeout_ms = config.timeout_ms, "Tool execution timed out, aborted");
                ExecutionResult::failed(
                    &tool.name,
                    ExecutionErrorKind::Timeout,
                    format!("timed out after {} ms", config.timeout_ms),
                    usage,
                )
            }
        };

        Ok(result)
    }
}

/// Aborts the task if the caller stops waiting for it
struct AbortOnDrop<T>(JoinHandle<T>);

impl<T> Drop for AbortOnDrop<T> {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn path_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"(^|[\s'"(\[=:])(~?/[^\s'")\]]+|[A-Za-z]:\\[^\s'")\]]*)"#).unwrap()
    })
}

fn ip_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b\d{1,3}(?:\.\d{1,3}){3}(?::\d+)?\b").unwrap())
}

/// First line only, filesystem paths and IP addresses replaced
pub(crate) fn scrub_error(message: &str) -> String {
    let first_line = message.lines().next().unwrap_or_default();
    let no_ips = ip_regex().replace_all(first_line, "[ip]");
    let no_paths = path_regex().replace_all(&no_ips, "${1}[path]");
    let mut scrubbed: String = no_paths.chars().take(MAX_ERROR_MESSAGE_CHARS).collect();
    if scrubbed.len() < no_paths.len() {
        scrubbed.push('…');
    }
    scrubbed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::PoolConfig;
    use crate::tools::{ToolHandler, ToolKind};
    use crate::types::RiskTier;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    struct Echo;

    #[async_trait]
    impl ToolHandler for Echo {
        async fn execute(&self, params: Value, ctx: SandboxContext) -> Result<Value> {
            ctx.charge_memory(1024)?;
            ctx.charge_cpu(5)?;
            Ok(params)
        }
    }

    struct Sleeper;

    #[async_trait]
    impl ToolHandler for Sleeper {
        async fn execute(&self, _params: Value, _ctx: SandboxContext) -> Result<Value> {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(Value::Null)
        }
    }

    /// Never yields until released
    struct Blocking {
        release: Arc<AtomicBool>,
        running: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl ToolHandler for Blocking {
        async fn execute(&self, _params: Value, _ctx: SandboxContext) -> Result<Value> {
            self.running.fetch_add(1, Ordering::SeqCst);
            while !self.release.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(10));
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    struct Hog;

    #[async_trait]
    impl ToolHandler for Hog {
        async fn execute(&self, _params: Value, ctx: SandboxContext) -> Result<Value> {
            loop {
                ctx.charge_memory(16 * 1024 * 1024)?;
            }
        }
    }

    struct Leaky;

    #[async_trait]
    impl ToolHandler for Leaky {
        async fn execute(&self, _params: Value, _ctx: SandboxContext) -> Result<Value> {
            Err(GuardError::Config(
                "cannot open /srv/app/secrets.toml from 192.168.1.20\n  at main.rs:10".to_string(),
            ))
        }
    }

    struct Panics;

    #[async_trait]
    impl ToolHandler for Panics {
        async fn execute(&self, _params: Value, _ctx: SandboxContext) -> Result<Value> {
            panic!("boom at /home/user/tool.rs");
        }
    }

    fn tool(handler: Arc<dyn ToolHandler>, tier: RiskTier) -> Arc<ToolDefinition> {
        Arc::new(ToolDefinition::new("worker", ToolKind::Compute, tier, handler))
    }

    fn executor() -> SandboxExecutor {
        SandboxExecutor::new(ContextPool::new(&PoolConfig::default()))
    }

    /// Let aborted tasks finish tearing down
    async fn settle(pool: &ContextPool) {
        for _ in 0..100 {
            if pool.available() == pool.size() {
                return;
            }
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test]
    async fn test_successful_execution() {
        let executor = executor();
        let result = executor
            .execute(tool(Arc::new(Echo), RiskTier::Low), json!({"x": 1}))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output, Some(json!({"x": 1})));
        assert_eq!(result.usage.memory_bytes, 1024);
        assert_eq!(result.usage.cpu_ms, 5);
        assert_eq!(executor.pool().available(), executor.pool().size());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_aborts() {
        let executor = executor();
        let result = executor
            .execute(tool(Arc::new(Sleeper), RiskTier::Critical), json!({}))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error_kind, Some(ExecutionErrorKind::Timeout));
        assert!(result.usage.wall_ms <= 5_000);
        settle(executor.pool()).await;
        assert_eq!(executor.pool().available(), executor.pool().size());

        let config = SandboxConfig::for_tier(RiskTier::Critical);
        assert!(matches!(
            result.into_result(&config),
            Err(GuardError::SandboxTimeout { timeout_ms: 5_000, .. })
        ));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_timed_out_handler_keeps_its_context() {
        let executor = SandboxExecutor::new(ContextPool::new(&PoolConfig {
            size: 1,
            max_waiters: 4,
            acquire_timeout_ms: 50,
        }));
        let release = Arc::new(AtomicBool::new(false));
        let running = Arc::new(AtomicUsize::new(0));
        let blocking = Arc::new(Blocking {
            release: release.clone(),
            running: running.clone(),
        });

        let result = executor
            .execute(tool(blocking, RiskTier::Critical), json!({}))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ExecutionErrorKind::Timeout));

        // Abort cannot interrupt a handler that never yields
        assert_eq!(running.load(Ordering::SeqCst), 1);
        assert_eq!(executor.pool().available(), 0);
        let second = executor
            .execute(tool(Arc::new(Echo), RiskTier::Low), json!({}))
            .await;
        assert!(matches!(second, Err(GuardError::PoolExhausted(_))));

        release.store(true, Ordering::SeqCst);
        for _ in 0..200 {
            if executor.pool().available() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(running.load(Ordering::SeqCst), 0);
        assert_eq!(executor.pool().available(), 1);
        let third = executor
            .execute(tool(Arc::new(Echo), RiskTier::Low), json!({}))
            .await
            .unwrap();
        assert!(third.success);
    }

    #[tokio::test]
    async fn test_dropped_call_frees_context() {
        let executor = executor();
        let handler: Arc<dyn ToolHandler> = Arc::new(Sleeper);
        let call = executor.execute(tool(handler.clone(), RiskTier::Low), json!({}));
        let _ = tokio::time::timeout(Duration::from_millis(20), call).await;
        settle(executor.pool()).await;
        assert_eq!(executor.pool().available(), executor.pool().size());
        // The spawned task is gone too, not left running detached
        assert_eq!(Arc::strong_count(&handler), 1);
    }

    #[tokio::test]
    async fn test_resource_exceeded() {
        let result = executor()
            .execute(tool(Arc::new(Hog), RiskTier::High), json!({}))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ExecutionErrorKind::ResourceExceeded));
        assert_eq!(result.message.as_deref(), Some("memory"));
        assert!(result.usage.within(&SandboxConfig::for_tier(RiskTier::High)));
    }

    #[tokio::test]
    async fn test_error_message_scrubbed() {
        let result = executor()
            .execute(tool(Arc::new(Leaky), RiskTier::Low), json!({}))
            .await
            .unwrap();
        let message = result.message.unwrap();
        assert!(!message.contains("/srv/app"));
        assert!(!message.contains("192.168"));
        assert!(!message.contains("main.rs"));
        assert!(message.contains("[path]"));
        assert!(message.contains("[ip]"));
    }

    #[tokio::test]
    async fn test_panic_contained() {
        let executor = executor();
        let result = executor
            .execute(tool(Arc::new(Panics), RiskTier::Low), json!({}))
            .await
            .unwrap();
        assert_eq!(result.error_kind, Some(ExecutionErrorKind::Failed));
        assert!(!result.message.unwrap().contains("/home"));
        assert_eq!(executor.pool().available(), executor.pool().size());
    }

    #[test]
    fn test_scrub_error() {
        assert_eq!(
            scrub_error("open '/var/lib/key.pem' failed via 10.0.0.5:8080"),
            "open '[path]' failed via [ip]"
        );
        assert_eq!(scrub_error("and/or stays"), "and/or stays");
        assert_eq!(scrub_error(r"read C:\Users\x\a.txt"), "read [path]");
    }
}
