//! Pipeline orchestration
//!
//! ```text
//! Received → Sanitized → RateChecked → JailbreakChecked → ToolPhase* → OutputFiltered → Delivered
//!     └───────────┴────────────┴──────────────┴──────────────┴─────────────┴──→ Blocked
//! ```
//!
//! A stage that produces a blocking violation moves the run straight to
//! `Blocked`; later stages never run. Every stage appends one entry to the
//! run's audit trail whether it passes or not, and each run writes exactly
//! one [`AuditRecord`](crate::audit::AuditRecord) to the sink.
//!
//! Callers see [`GuardError::public_message`] only; diagnostic detail goes to
//! the audit record and tracing.

use crate::audit::{AuditSink, AuditTrail, Disposition, MemoryAuditSink};
use crate::config::GuardConfig;
use crate::error::{GuardError, Result};
use crate::jailbreak::embedding::{AttackEmbeddingStore, EmbeddingModel};
use crate::jailbreak::{JailbreakDetector, JailbreakPatternSet, JailbreakVerdict};
use crate::output::{ContentClassifier, FilterOutcome, HeuristicClassifier, OutputFilter};
use crate::ratelimit::{CounterStore, MemoryCounterStore, RateDecision, RateLimiter};
use crate::sandbox::{ContextPool, ExecutionResult, NetworkPolicy, SandboxConfig, SandboxExecutor};
use crate::sanitizer::{Sanitizer, ThreatPatternSet};
use crate::tools::{ToolCall, ToolCallValidator, ToolRegistry};
use crate::types::{estimate_tokens, Finding, Request, RequestContext, RiskAssessment, Severity};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use tracing::Instrument;

/// Where a run is in the admission state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineState {
    Received,
    Sanitized,
    RateChecked,
    JailbreakChecked,
    ToolPhase,
    OutputFiltered,
    Delivered,
    Blocked,
}

impl fmt::Display for PipelineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PipelineState::Received => "received",
            PipelineState::Sanitized => "sanitized",
            PipelineState::RateChecked => "rate_checked",
            PipelineState::JailbreakChecked => "jailbreak_checked",
            PipelineState::ToolPhase => "tool_phase",
            PipelineState::OutputFiltered => "output_filtered",
            PipelineState::Delivered => "delivered",
            PipelineState::Blocked => "blocked",
        };
        f.write_str(name)
    }
}

/// What the agent produced for one admitted input
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AgentTurn {
    pub reply: String,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
}

/// The opaque text-generation step between admission and delivery
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn generate(&self, input: &str) -> Result<AgentTurn>;
}

/// Admitted input, ready for the agent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessedInput {
    pub request: Request,
    /// Sanitized text for the agent
    pub normalized: String,
    pub risk: RiskAssessment,
    pub rate: RateDecision,
    pub jailbreak: JailbreakVerdict,
    /// Non-blocking observations
    pub findings: Vec<Finding>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Delivery {
    pub request_id: String,
    pub reply: String,
    pub tool_results: Vec<ExecutionResult>,
    pub findings: Vec<Finding>,
}

/// Caller-facing description of a blocked run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockedRun {
    pub request_id: String,
    pub stage: PipelineState,
    pub kind: &'static str,
    pub message: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum PipelineOutcome {
    Delivered(Delivery),
    Blocked(BlockedRun),
}

impl PipelineOutcome {
    pub fn request_id(&self) -> &str {
        match self {
            PipelineOutcome::Delivered(d) => &d.request_id,
            PipelineOutcome::Blocked(b) => &b.request_id,
        }
    }

    pub fn is_delivered(&self) -> bool {
        matches!(self, PipelineOutcome::Delivered(_))
    }
}

/// Builds a [`SecurityPipeline`]; every collaborator has an in-memory default
pub struct SecurityPipelineBuilder {
    config: GuardConfig,
    registry: Option<Arc<ToolRegistry>>,
    store: Option<Arc<dyn CounterStore>>,
    sink: Option<Arc<dyn AuditSink>>,
    classifier: Option<Arc<dyn ContentClassifier>>,
    embeddings: Option<(Arc<dyn EmbeddingModel>, Arc<AttackEmbeddingStore>)>,
    pool: Option<ContextPool>,
}

impl SecurityPipelineBuilder {
    fn new() -> Self {
        Self {
            config: GuardConfig::default(),
            registry: None,
            store: None,
            sink: None,
            classifier: None,
            embeddings: None,
            pool: None,
        }
    }

    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    pub fn registry(mut self, registry: Arc<ToolRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn counter_store(mut self, store: Arc<dyn CounterStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn audit_sink(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sink = Some(sink);
        self
    }

    pub fn classifier(mut self, classifier: Arc<dyn ContentClassifier>) -> Self {
        self.classifier = Some(classifier);
        self
    }

    pub fn embeddings(mut self, model: Arc<dyn EmbeddingModel>, store: Arc<AttackEmbeddingStore>) -> Self {
        self.embeddings = Some((model, store));
        self
    }

    pub fn pool(mut self, pool: ContextPool) -> Self {
        self.pool = Some(pool);
        self
    }

    pub fn build(self) -> Result<SecurityPipeline> {
        let config = self.config;
        config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(MemoryCounterStore::new()));
        let registry = self.registry.unwrap_or_default();

        let sanitizer = Sanitizer::new(Arc::new(ThreatPatternSet::from_config(&config.sanitizer)?));
        let mut detector =
            JailbreakDetector::new(Arc::new(JailbreakPatternSet::from_config(&config.jailbreak)?))
                .with_config(&config.jailbreak);
        if let Some((model, attacks)) = self.embeddings {
            detector = detector.with_embeddings(model, attacks);
        }

        let pool = self.pool.unwrap_or_else(|| ContextPool::new(&config.pool));
        let executor = SandboxExecutor::new(pool).with_network_policy(NetworkPolicy::from_config(&config.network));
        let classifier = self
            .classifier
            .unwrap_or_else(|| Arc::new(HeuristicClassifier::new()));

        tracing::info!(
            tools = registry.len(),
            pool_size = executor.pool().size(),
            "Security pipeline ready"
        );

        Ok(SecurityPipeline {
            sanitizer,
            rate_limiter: RateLimiter::new(store.clone(), config.rate_limits.clone()),
            detector,
            validator: ToolCallValidator::new(registry, store, config.tool_budgets.clone()),
            executor,
            output: OutputFilter::new(classifier, config.output.clone()),
            sink: self
                .sink
                .unwrap_or_else(|| Arc::new(MemoryAuditSink::from_config(&config.audit))),
            config,
        })
    }
}

/// The admission pipeline
pub struct SecurityPipeline {
    config: GuardConfig,
    sanitizer: Sanitizer,
    rate_limiter: RateLimiter,
    detector: JailbreakDetector,
    validator: ToolCallValidator,
    executor: SandboxExecutor,
    output: OutputFilter,
    sink: Arc<dyn AuditSink>,
}

impl SecurityPipeline {
    pub fn builder() -> SecurityPipelineBuilder {
        SecurityPipelineBuilder::new()
    }

    /// Pipeline with default collaborators and the given tools
    pub fn from_config(config: GuardConfig, registry: Arc<ToolRegistry>) -> Result<Self> {
        Self::builder().config(config).registry(registry).build()
    }

    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    pub fn audit_sink(&self) -> &Arc<dyn AuditSink> {
        &self.sink
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    pub fn executor(&self) -> &SandboxExecutor {
        &self.executor
    }

    // ─── Entry points ────────────────────────────────────────────

    /// Sanitize, rate-check, and jailbreak-check `raw_text`
    pub async fn process_input(&self, raw_text: &str, ctx: &RequestContext) -> Result<ProcessedInput> {
        let request = Request::receive(raw_text, ctx);
        let mut trail = AuditTrail::new(request.id(), ctx.actor_id.as_str(), ctx.session_id.as_str());
        let span = tracing::info_span!("a3s.guard.input", request_id = %request.id(), actor = %ctx.actor_id);

        let result = self.admit(request, ctx, &mut trail).instrument(span).await;
        let disposition = match &result {
            Ok(_) => Disposition::Admitted,
            Err(_) => Disposition::Blocked,
        };
        self.emit(trail, disposition).await;
        result
    }

    /// Validate and execute one tool call emitted by the agent
    pub async fn process_tool_call(&self, call: &ToolCall, ctx: &RequestContext) -> Result<ExecutionResult> {
        let request_id = if call.request_id.is_empty() {
            format!("req-{}", uuid::Uuid::new_v4())
        } else {
            call.request_id.clone()
        };
        let mut trail = AuditTrail::new(request_id.as_str(), ctx.actor_id.as_str(), ctx.session_id.as_str());
        let span = tracing::info_span!(
            "a3s.guard.tool",
            request_id = %request_id,
            tool = call.name.as_deref().unwrap_or("")
        );

        let result = self.tool_phase(call, ctx, &mut trail).instrument(span).await;
        let disposition = match &result {
            Ok(_) => Disposition::Executed,
            Err(_) => Disposition::Blocked,
        };
        self.emit(trail, disposition).await;
        result
    }

    /// Redact or block text about to be delivered
    pub async fn filter_output(&self, text: &str, ctx: &RequestContext) -> Result<FilterOutcome> {
        let request_id = format!("req-{}", uuid::Uuid::new_v4());
        let mut trail = AuditTrail::new(request_id, ctx.actor_id.as_str(), ctx.session_id.as_str());
        let outcome = self.output.filter(text);
        Self::record_filter(&mut trail, &outcome);
        let disposition = if outcome.allowed {
            Disposition::Delivered
        } else {
            Disposition::Blocked
        };
        self.emit(trail, disposition).await;
        Ok(outcome)
    }

    /// Full run: admission, the agent, its tool calls, output filtering
    pub async fn run(&self, raw_text: &str, ctx: &RequestContext, backend: &dyn AgentBackend) -> PipelineOutcome {
        let request = Request::receive(raw_text, ctx);
        let request_id = request.id().to_string();
        let mut trail = AuditTrail::new(request_id.as_str(), ctx.actor_id.as_str(), ctx.session_id.as_str());
        let span = tracing::info_span!("a3s.guard.run", request_id = %request_id, actor = %ctx.actor_id);

        let result = self
            .run_stages(request, ctx, backend, &mut trail)
            .instrument(span)
            .await;

        let outcome = match result {
            Ok(delivery) => {
                tracing::info!(request_id = %request_id, tool_calls = delivery.tool_results.len(), "Response delivered");
                PipelineOutcome::Delivered(delivery)
            }
            Err(e) => {
                let stage = trail
                    .entries()
                    .last()
                    .map(|entry| entry.stage)
                    .unwrap_or(PipelineState::Blocked);
                tracing::warn!(request_id = %request_id, stage = %stage, kind = e.kind(), "Request blocked");
                PipelineOutcome::Blocked(BlockedRun {
                    request_id: request_id.clone(),
                    stage,
                    kind: e.kind(),
                    message: e.public_message(),
                    retry_after_ms: e.retry_after_ms(),
                })
            }
        };
        let disposition = if outcome.is_delivered() {
            Disposition::Delivered
        } else {
            Disposition::Blocked
        };
        self.emit(trail, disposition).await;
        outcome
    }

    // ─── Stages ──────────────────────────────────────────────────

    async fn run_stages(
        &self,
        request: Request,
        ctx: &RequestContext,
        backend: &dyn AgentBackend,
        trail: &mut AuditTrail,
    ) -> Result<Delivery> {
        let request_id = request.id().to_string();
        let admitted = self.admit(request, ctx, trail).await?;
        let mut findings = admitted.findings;

        let turn = match backend.generate(&admitted.normalized).await {
            Ok(turn) => turn,
            Err(e) => {
                trail.fail(PipelineState::Blocked, Severity::High, format!("agent backend failed: {}", e));
                return Err(e);
            }
        };

        let mut tool_results = Vec::with_capacity(turn.tool_calls.len());
        for call in &turn.tool_calls {
            let call = if call.request_id.is_empty() {
                call.clone().with_request_id(request_id.as_str())
            } else {
                call.clone()
            };
            let result = self.tool_phase(&call, ctx, trail).await?;
            tool_results.push(result);
        }

        let reply = self.output.filter(&turn.reply);
        Self::record_filter(trail, &reply);
        if !reply.allowed {
            return Err(Self::output_blocked("reply"));
        }
        findings.extend(reply.findings());

        for result in &mut tool_results {
            if self.filter_tool_output(result) {
                trail.fail(
                    PipelineState::OutputFiltered,
                    Severity::Critical,
                    format!("tool '{}' output blocked", result.tool),
                );
                return Err(Self::output_blocked("tool output"));
            }
        }

        Ok(Delivery {
            request_id,
            reply: reply.filtered,
            tool_results,
            findings,
        })
    }

    async fn admit(&self, request: Request, ctx: &RequestContext, trail: &mut AuditTrail) -> Result<ProcessedInput> {
        // Received
        if ctx.actor_id.trim().is_empty() {
            trail.fail(PipelineState::Received, Severity::Medium, "missing actor id");
            return Err(GuardError::Validation("missing actor id".to_string()));
        }
        if request.text().trim().is_empty() {
            trail.fail(PipelineState::Received, Severity::Low, "empty input");
            return Err(GuardError::Validation("empty input".to_string()));
        }
        trail.pass(
            PipelineState::Received,
            format!("{} chars, tier {}", request.text().chars().count(), request.tier()),
        );

        let mut findings = Vec::new();

        // Sanitized
        let sanitized = {
            let _span = tracing::debug_span!("a3s.guard.sanitize").entered();
            self.sanitizer.sanitize(request.text())
        };
        let risk = sanitized.assessment;
        if risk.risk_score() >= self.config.sanitizer.block_threshold {
            let detail = format!(
                "risk score {} [{}]",
                risk.risk_score(),
                risk.categories().join(", ")
            );
            trail.fail(PipelineState::Sanitized, Severity::High, detail.as_str());
            tracing::warn!(
                request_id = %request.id(),
                risk_score = risk.risk_score(),
                categories = ?risk.categories(),
                "Input blocked by sanitizer"
            );
            return Err(GuardError::Security {
                category: "prompt_injection".to_string(),
                detail,
            });
        }
        if risk.is_clean() {
            trail.pass(PipelineState::Sanitized, "risk score 0");
        } else {
            let severity = risk
                .detections()
                .iter()
                .map(|d| d.severity)
                .max()
                .unwrap_or(Severity::Low);
            trail.warn(
                PipelineState::Sanitized,
                severity,
                format!("risk score {} [{}]", risk.risk_score(), risk.categories().join(", ")),
            );
            findings.extend(risk.categories().into_iter().map(|category| {
                Finding::new(
                    "sanitizer",
                    category,
                    severity,
                    format!("filtered, risk score {}", risk.risk_score()),
                )
            }));
        }

        // RateChecked
        let tokens = estimate_tokens(request.text());
        let rate = self
            .rate_limiter
            .check(request.actor_id(), request.tier(), tokens)
            .await
            .inspect_err(|e| {
                trail.fail(PipelineState::RateChecked, Severity::High, e.to_string());
            })?;
        if !rate.allowed {
            let reason = rate.reason.map(|r| r.to_string()).unwrap_or_default();
            trail.fail(
                PipelineState::RateChecked,
                Severity::Medium,
                format!("{} ({} estimated tokens)", reason, tokens),
            );
            return Err(rate.into_result().err().unwrap_or_else(|| GuardError::RateLimited {
                reason,
                retry_after_ms: 0,
            }));
        }
        let ceiling = self.config.rate_limits.for_tier(request.tier()).requests;
        if rate.remaining_requests.saturating_mul(10) <= ceiling {
            findings.push(Finding::new(
                "rate_limiter",
                "quota_nearly_exhausted",
                Severity::Low,
                format!("{} requests left in window", rate.remaining_requests),
            ));
        }
        trail.pass(
            PipelineState::RateChecked,
            format!(
                "{} requests, {} tokens remaining",
                rate.remaining_requests, rate.remaining_tokens
            ),
        );

        // JailbreakChecked
        let jailbreak = {
            let _span = tracing::debug_span!("a3s.guard.jailbreak").entered();
            self.detector.analyze(&sanitized.normalized, &ctx.history)
        };
        let category = jailbreak.category.map(|c| c.as_str()).unwrap_or("none");
        if jailbreak.confidence > self.config.jailbreak.block_confidence {
            let detail = format!("{} at confidence {:.2}", category, jailbreak.confidence);
            trail.fail(PipelineState::JailbreakChecked, Severity::Critical, detail.as_str());
            tracing::warn!(
                request_id = %request.id(),
                category,
                confidence = jailbreak.confidence,
                "Input blocked as jailbreak"
            );
            return Err(GuardError::Security {
                category: category.to_string(),
                detail,
            });
        }
        if jailbreak.is_jailbreak {
            trail.warn(
                PipelineState::JailbreakChecked,
                Severity::Medium,
                format!("{} at confidence {:.2}", category, jailbreak.confidence),
            );
            findings.push(Finding::new(
                "jailbreak",
                category,
                Severity::Medium,
                format!("confidence {:.2} below blocking threshold", jailbreak.confidence),
            ));
        } else {
            trail.pass(
                PipelineState::JailbreakChecked,
                format!("confidence {:.2}", jailbreak.confidence),
            );
        }

        tracing::info!(
            request_id = %request.id(),
            risk_score = risk.risk_score(),
            findings = findings.len(),
            "Input admitted"
        );
        Ok(ProcessedInput {
            request,
            normalized: sanitized.normalized,
            risk,
            rate,
            jailbreak,
            findings,
        })
    }

    async fn tool_phase(&self, call: &ToolCall, ctx: &RequestContext, trail: &mut AuditTrail) -> Result<ExecutionResult> {
        let name = call.name.clone().unwrap_or_default();

        let outcome = self.validator.validate(call, ctx).await.inspect_err(|e| {
            trail.fail(PipelineState::ToolPhase, Severity::High, e.to_string());
        })?;
        let mut findings: Vec<Finding> = Vec::new();
        if !outcome.valid {
            let severity = outcome
                .blocking_violation()
                .map(|v| v.severity)
                .unwrap_or(Severity::High);
            let violations = outcome
                .violations
                .iter()
                .map(|v| format!("{}: {}", v.kind.as_str(), v.detail))
                .collect::<Vec<_>>()
                .join("; ");
            trail.fail(PipelineState::ToolPhase, severity, format!("tool '{}' rejected: {}", name, violations));
            return Err(outcome
                .into_result()
                .err()
                .unwrap_or_else(|| GuardError::Validation(format!("tool '{}' rejected", name))));
        }
        for v in &outcome.violations {
            trail.warn(PipelineState::ToolPhase, v.severity, format!("{}: {}", v.kind.as_str(), v.detail));
            findings.push(Finding::new("tool_validator", v.kind.as_str(), v.severity, v.detail.as_str()));
        }
        let validated = outcome.into_result().inspect_err(|e| {
            trail.fail(PipelineState::ToolPhase, Severity::High, e.to_string());
        })?;

        let tool = validated.tool.clone();
        let config = SandboxConfig::for_tier(tool.risk_tier);
        let executed = self
            .executor
            .execute(tool.clone(), validated.parameters)
            .await
            .and_then(|result| result.into_result(&config));
        let mut result = match executed {
            Ok(result) => result,
            Err(e) => {
                trail.fail(PipelineState::ToolPhase, Severity::High, e.to_string());
                return Err(e);
            }
        };

        // Tool output is untrusted input for the agent
        if let Some(output) = &result.output {
            let scan = self.sanitizer.sanitize(&collect_text(output));
            if !scan.assessment.is_clean() {
                let categories = scan.assessment.categories().join(", ");
                tracing::warn!(tool = %tool.name, categories = %categories, "Injection patterns in tool output");
                trail.warn(
                    PipelineState::ToolPhase,
                    Severity::Medium,
                    format!("tool '{}' output matched [{}]", tool.name, categories),
                );
                findings.push(Finding::new(
                    "tool_output",
                    "indirect_injection",
                    Severity::Medium,
                    format!("matched [{}]", categories),
                ));
            }
        }

        trail.pass(
            PipelineState::ToolPhase,
            format!(
                "tool '{}' executed in {} ms (memory {} B, cpu {} ms)",
                tool.name, result.duration_ms, result.usage.memory_bytes, result.usage.cpu_ms
            ),
        );
        result.findings.extend(findings);
        Ok(result)
    }

    // ─── Helpers ─────────────────────────────────────────────────

    fn record_filter(trail: &mut AuditTrail, outcome: &FilterOutcome) {
        let summary = outcome
            .violations
            .iter()
            .map(|v| format!("{}:{:?}", v.category, v.action))
            .collect::<Vec<_>>()
            .join(", ");
        if !outcome.allowed {
            trail.fail(PipelineState::OutputFiltered, Severity::Critical, format!("blocked [{}]", summary));
        } else if outcome.violations.is_empty() {
            trail.pass(PipelineState::OutputFiltered, "clean");
        } else {
            trail.warn(PipelineState::OutputFiltered, Severity::Medium, format!("filtered [{}]", summary));
        }
    }

    fn output_blocked(what: &str) -> GuardError {
        GuardError::Security {
            category: "output_policy".to_string(),
            detail: format!("{} blocked by output filter", what),
        }
    }

    /// Filter every string in a tool result; true when any was blocked
    fn filter_tool_output(&self, result: &mut ExecutionResult) -> bool {
        let Some(output) = result.output.take() else {
            return false;
        };
        let mut blocked = false;
        let mut findings = Vec::new();
        let filtered = map_strings(output, &mut |s: String| {
            let outcome = self.output.filter(&s);
            blocked |= !outcome.allowed;
            findings.extend(outcome.findings());
            outcome.filtered
        });
        result.output = Some(filtered);
        result.findings.extend(findings);
        blocked
    }

    async fn emit(&self, trail: AuditTrail, disposition: Disposition) {
        let record = trail.finish(disposition);
        if let Err(e) = self.sink.append(&record).await {
            tracing::error!(request_id = %record.request_id, error = %e, "Failed to write audit record");
        }
    }
}

fn collect_text(value: &Value) -> String {
    fn walk(value: &Value, out: &mut Vec<String>) {
        match value {
            Value::String(s) => out.push(s.clone()),
            Value::Array(items) => items.iter().for_each(|v| walk(v, out)),
            Value::Object(map) => map.values().for_each(|v| walk(v, out)),
            _ => {}
        }
    }
    let mut parts = Vec::new();
    walk(value, &mut parts);
    parts.join("\n")
}

fn map_strings(value: Value, f: &mut dyn FnMut(String) -> String) -> Value {
    match value {
        Value::String(s) => Value::String(f(s)),
        Value::Array(items) => Value::Array(items.into_iter().map(|v| map_strings(v, f)).collect()),
        Value::Object(map) => Value::Object(map.into_iter().map(|(k, v)| (k, map_strings(v, f))).collect()),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_state_names() {
        assert_eq!(PipelineState::JailbreakChecked.to_string(), "jailbreak_checked");
        assert_eq!(serde_json::to_value(PipelineState::ToolPhase).unwrap(), "tool_phase");
    }

    #[test]
    fn test_collect_text() {
        let value = json!({"a": "one", "b": [1, "two", {"c": "three"}], "d": null});
        let text = collect_text(&value);
        assert!(text.contains("one") && text.contains("two") && text.contains("three"));
    }

    #[test]
    fn test_map_strings() {
        let value = json!({"a": "x", "b": ["y", 2]});
        let mapped = map_strings(value, &mut |s: String| s.to_uppercase());
        assert_eq!(mapped, json!({"a": "X", "b": ["Y", 2]}));
    }

    #[test]
    fn test_builder_rejects_invalid_config() {
        let mut config = GuardConfig::default();
        config.pool.size = 0;
        assert!(SecurityPipeline::builder().config(config).build().is_err());
    }

    #[tokio::test]
    async fn test_empty_input_is_validation_error() {
        let pipeline = SecurityPipeline::builder().build().unwrap();
        let ctx = RequestContext::new("alice", crate::types::Tier::Free, "s-1");
        let err = pipeline.process_input("   ", &ctx).await.unwrap_err();
        assert!(matches!(err, GuardError::Validation(_)));
    }

    #[tokio::test]
    async fn test_filter_output_records_audit() {
        let sink = Arc::new(MemoryAuditSink::new(10));
        let pipeline = SecurityPipeline::builder().audit_sink(sink.clone()).build().unwrap();
        let ctx = RequestContext::new("alice", crate::types::Tier::Free, "s-1");

        let outcome = pipeline.filter_output("mail me at a@b.com", &ctx).await.unwrap();
        assert_eq!(outcome.filtered, "mail me at [EMAIL REDACTED]");
        let records = sink.by_actor("alice", 1).await.unwrap();
        assert_eq!(records[0].disposition, Disposition::Delivered);
        assert_eq!(records[0].entries[0].stage, PipelineState::OutputFiltered);
    }
}
