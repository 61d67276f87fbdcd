//! Audit trail of pipeline runs
//!
//! Every run produces exactly one [`AuditRecord`]: one entry per state
//! transition, pass or fail, plus the final disposition. Records carry the
//! full diagnostic detail that is kept out of caller-facing errors.
//!
//! Two sinks ship with the crate: [`MemoryAuditSink`] (bounded, evicts the
//! oldest) and [`JsonlAuditSink`] (append-only JSONL with size-based
//! rotation).

use crate::config::AuditConfig;
use crate::error::{GuardError, Result};
use crate::pipeline::PipelineState;
use crate::types::Severity;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::{Mutex, RwLock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StageOutcome {
    Pass,
    Warn,
    Fail,
}

/// How a run ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Disposition {
    /// Input admitted for the agent
    Admitted,
    /// A single tool call ran in the sandbox
    Executed,
    /// Output filtered and returned to the caller
    Delivered,
    Blocked,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StageEntry {
    pub stage: PipelineState,
    pub outcome: StageOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<Severity>,
    pub detail: String,
    /// Milliseconds since epoch
    pub timestamp: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditRecord {
    pub id: String,
    pub request_id: String,
    pub actor_id: String,
    pub session_id: String,
    pub entries: Vec<StageEntry>,
    pub disposition: Disposition,
    pub created_at: i64,
}

impl AuditRecord {
    /// The entry that blocked the run, if any
    pub fn blocking_entry(&self) -> Option<&StageEntry> {
        self.entries.iter().find(|e| e.outcome == StageOutcome::Fail)
    }
}

/// Collects entries during a run; frozen into an [`AuditRecord`] by
/// [`finish`](Self::finish)
#[derive(Debug)]
pub struct AuditTrail {
    request_id: String,
    actor_id: String,
    session_id: String,
    entries: Vec<StageEntry>,
    created_at: i64,
}

impl AuditTrail {
    pub fn new(request_id: impl Into<String>, actor_id: impl Into<String>, session_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            actor_id: actor_id.into(),
            session_id: session_id.into(),
            entries: Vec::new(),
            created_at: chrono::Utc::now().timestamp_millis(),
        }
    }

    pub fn record(
        &mut self,
        stage: PipelineState,
        outcome: StageOutcome,
        severity: Option<Severity>,
        detail: impl Into<String>,
    ) {
        self.entries.push(StageEntry {
            stage,
            outcome,
            severity,
            detail: detail.into(),
            timestamp: chrono::Utc::now().timestamp_millis(),
        });
    }

    pub fn pass(&mut self, stage: PipelineState, detail: impl Into<String>) {
        self.record(stage, StageOutcome::Pass, None, detail);
    }

    pub fn warn(&mut self, stage: PipelineState, severity: Severity, detail: impl Into<String>) {
        self.record(stage, StageOutcome::Warn, Some(severity), detail);
    }

    pub fn fail(&mut self, stage: PipelineState, severity: Severity, detail: impl Into<String>) {
        self.record(stage, StageOutcome::Fail, Some(severity), detail);
    }

    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    pub fn entries(&self) -> &[StageEntry] {
        &self.entries
    }

    pub fn finish(self, disposition: Disposition) -> AuditRecord {
        AuditRecord {
            id: uuid::Uuid::new_v4().to_string(),
            request_id: self.request_id,
            actor_id: self.actor_id,
            session_id: self.session_id,
            entries: self.entries,
            disposition,
            created_at: self.created_at,
        }
    }
}

/// Append-only destination for audit records
#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn append(&self, record: &AuditRecord) -> Result<()>;

    async fn by_request(&self, request_id: &str) -> Result<Vec<AuditRecord>>;

    /// Most recent records for `actor_id`, newest first
    async fn by_actor(&self, actor_id: &str, limit: usize) -> Result<Vec<AuditRecord>>;
}

// ─── In-memory sink ──────────────────────────────────────────────

/// Bounded in-memory sink
#[derive(Debug)]
pub struct MemoryAuditSink {
    records: RwLock<VecDeque<AuditRecord>>,
    capacity: usize,
    total: AtomicU64,
}

impl MemoryAuditSink {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(VecDeque::with_capacity(capacity.min(1024))),
            capacity: capacity.max(1),
            total: AtomicU64::new(0),
        }
    }

    pub fn from_config(config: &AuditConfig) -> Self {
        Self::new(config.memory_capacity)
    }

    /// Records ever appended, including evicted ones
    pub fn total_count(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Newest first
    pub async fn recent(&self, limit: usize) -> Vec<AuditRecord> {
        self.records.read().await.iter().rev().take(limit).cloned().collect()
    }
}

impl Default for MemoryAuditSink {
    fn default() -> Self {
        Self::from_config(&AuditConfig::default())
    }
}

#[async_trait]
impl AuditSink for MemoryAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut records = self.records.write().await;
        if records.len() >= self.capacity {
            records.pop_front();
        }
        records.push_back(record.clone());
        self.total.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    async fn by_request(&self, request_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .filter(|r| r.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn by_actor(&self, actor_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self
            .records
            .read()
            .await
            .iter()
            .rev()
            .filter(|r| r.actor_id == actor_id)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ─── JSONL sink ──────────────────────────────────────────────────

const ACTIVE_FILE: &str = "audit.jsonl";
const ROTATED_PREFIX: &str = "audit-";

/// Append-only JSONL file sink with size-based rotation
///
/// When the active file reaches `max_file_bytes` it is renamed with a
/// timestamp suffix and a fresh file is started. Rotated files are kept
/// unless `max_rotated_files` is set, in which case only the newest that
/// many survive. Queries read rotated files oldest first, then the active
/// file.
pub struct JsonlAuditSink {
    dir: PathBuf,
    active_path: PathBuf,
    max_file_bytes: u64,
    max_rotated_files: Option<usize>,
    write_lock: Mutex<()>,
}

impl JsonlAuditSink {
    /// Open (creating if needed) the audit directory
    pub async fn open(dir: impl AsRef<Path>, config: &AuditConfig) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir).await.map_err(|e| {
            GuardError::Audit(format!("Failed to create audit directory {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            active_path: dir.join(ACTIVE_FILE),
            dir,
            max_file_bytes: config.max_file_bytes,
            max_rotated_files: config.max_rotated_files,
            write_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    async fn maybe_rotate(&self) -> Result<()> {
        let Ok(meta) = fs::metadata(&self.active_path).await else {
            return Ok(());
        };
        if meta.len() < self.max_file_bytes {
            return Ok(());
        }

        let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.6f").to_string();
        // Fixed-width suffix keeps lexical order equal to rotation order
        let mut counter = 0u32;
        let mut rotated = self.dir.join(format!("{}{}-{:04}.jsonl", ROTATED_PREFIX, ts, counter));
        while fs::try_exists(&rotated).await.unwrap_or(false) {
            counter += 1;
            rotated = self.dir.join(format!("{}{}-{:04}.jsonl", ROTATED_PREFIX, ts, counter));
        }
        fs::rename(&self.active_path, &rotated)
            .await
            .map_err(|e| GuardError::Audit(format!("Failed to rotate audit file: {}", e)))?;
        tracing::debug!(rotated = %rotated.display(), "Rotated audit file");

        let Some(keep) = self.max_rotated_files else {
            return Ok(());
        };
        let mut files = self.rotated_files().await?;
        while files.len() > keep {
            let oldest = files.remove(0);
            if let Err(e) = fs::remove_file(&oldest).await {
                tracing::warn!(path = %oldest.display(), error = %e, "Failed to prune audit file");
            }
        }
        Ok(())
    }

    /// Rotated files, oldest first
    async fn rotated_files(&self) -> Result<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = fs::read_dir(&self.dir)
            .await
            .map_err(|e| GuardError::Audit(format!("Failed to read audit dir: {}", e)))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| GuardError::Audit(format!("Failed to read audit dir entry: {}", e)))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with(ROTATED_PREFIX) && name.ends_with(".jsonl") {
                files.push(entry.path());
            }
        }
        files.sort();
        Ok(files)
    }

    async fn load_file(path: &Path) -> Vec<AuditRecord> {
        let Ok(file) = fs::File::open(path).await else {
            return Vec::new();
        };
        let mut lines = BufReader::new(file).lines();
        let mut records = Vec::new();
        while let Ok(Some(line)) = lines.next_line().await {
            match serde_json::from_str::<AuditRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(path = %path.display(), error = %e, "Skipping unreadable audit line"),
            }
        }
        records
    }

    /// Every persisted record, oldest first
    pub async fn load_all(&self) -> Result<Vec<AuditRecord>> {
        let mut records = Vec::new();
        for path in self.rotated_files().await? {
            records.extend(Self::load_file(&path).await);
        }
        records.extend(Self::load_file(&self.active_path).await);
        Ok(records)
    }
}

#[async_trait]
impl AuditSink for JsonlAuditSink {
    async fn append(&self, record: &AuditRecord) -> Result<()> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;
        self.maybe_rotate().await?;
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.active_path)
            .await
            .map_err(|e| {
                GuardError::Audit(format!(
                    "Failed to open audit file {}: {}",
                    self.active_path.display(),
                    e
                ))
            })?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| GuardError::Audit(format!("Failed to write audit record: {}", e)))?;
        file.flush()
            .await
            .map_err(|e| GuardError::Audit(format!("Failed to flush audit record: {}", e)))?;
        Ok(())
    }

    async fn by_request(&self, request_id: &str) -> Result<Vec<AuditRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .filter(|r| r.request_id == request_id)
            .collect())
    }

    async fn by_actor(&self, actor_id: &str, limit: usize) -> Result<Vec<AuditRecord>> {
        Ok(self
            .load_all()
            .await?
            .into_iter()
            .rev()
            .filter(|r| r.actor_id == actor_id)
            .take(limit)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(request_id: &str, actor: &str, disposition: Disposition) -> AuditRecord {
        let mut trail = AuditTrail::new(request_id, actor, "s-1");
        trail.pass(PipelineState::Received, "received");
        trail.pass(PipelineState::Sanitized, "risk 0");
        if disposition == Disposition::Blocked {
            trail.fail(PipelineState::RateChecked, Severity::High, "request ceiling");
        }
        trail.finish(disposition)
    }

    #[test]
    fn test_trail_builds_record() {
        let record = record("req-1", "alice", Disposition::Blocked);
        assert_eq!(record.entries.len(), 3);
        assert_eq!(record.request_id, "req-1");
        let blocking = record.blocking_entry().unwrap();
        assert_eq!(blocking.stage, PipelineState::RateChecked);
        assert_eq!(blocking.severity, Some(Severity::High));
    }

    #[test]
    fn test_record_serialization() {
        let json = serde_json::to_value(record("req-1", "alice", Disposition::Admitted)).unwrap();
        assert_eq!(json["requestId"], "req-1");
        assert_eq!(json["disposition"], "admitted");
        assert_eq!(json["entries"][0]["outcome"], "pass");
        assert!(json["entries"][0].get("severity").is_none());
    }

    #[tokio::test]
    async fn test_memory_sink_queries() {
        let sink = MemoryAuditSink::new(10);
        sink.append(&record("req-1", "alice", Disposition::Admitted)).await.unwrap();
        sink.append(&record("req-2", "bob", Disposition::Blocked)).await.unwrap();
        sink.append(&record("req-3", "alice", Disposition::Delivered)).await.unwrap();

        assert_eq!(sink.by_request("req-2").await.unwrap().len(), 1);
        let alice = sink.by_actor("alice", 10).await.unwrap();
        assert_eq!(alice.len(), 2);
        assert_eq!(alice[0].request_id, "req-3");
        assert_eq!(sink.by_actor("alice", 1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_memory_sink_capacity_eviction() {
        let sink = MemoryAuditSink::new(2);
        for i in 0..5 {
            sink.append(&record(&format!("req-{}", i), "alice", Disposition::Admitted))
                .await
                .unwrap();
        }
        assert_eq!(sink.len().await, 2);
        assert_eq!(sink.total_count(), 5);
        assert!(sink.by_request("req-0").await.unwrap().is_empty());
        assert_eq!(sink.recent(1).await[0].request_id, "req-4");
    }

    #[tokio::test]
    async fn test_jsonl_sink_append_and_query() {
        let dir = tempfile::tempdir().unwrap();
        let sink = JsonlAuditSink::open(dir.path().join("audit"), &AuditConfig::default())
            .await
            .unwrap();
        sink.append(&record("req-1", "alice", Disposition::Admitted)).await.unwrap();
        sink.append(&record("req-2", "bob", Disposition::Blocked)).await.unwrap();

        let found = sink.by_request("req-2").await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].disposition, Disposition::Blocked);
        assert_eq!(sink.by_actor("alice", 5).await.unwrap().len(), 1);

        // A reopened sink sees the same records
        let reopened = JsonlAuditSink::open(dir.path().join("audit"), &AuditConfig::default())
            .await
            .unwrap();
        assert_eq!(reopened.load_all().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_jsonl_sink_keeps_every_rotated_file_by_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            max_file_bytes: 1,
            ..AuditConfig::default()
        };
        let sink = JsonlAuditSink::open(dir.path(), &config).await.unwrap();
        for i in 0..8 {
            sink.append(&record(&format!("req-{}", i), "alice", Disposition::Admitted))
                .await
                .unwrap();
        }

        assert_eq!(sink.rotated_files().await.unwrap().len(), 7);
        assert_eq!(sink.load_all().await.unwrap().len(), 8);
        assert_eq!(sink.by_request("req-0").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_jsonl_sink_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let config = AuditConfig {
            max_file_bytes: 1,
            max_rotated_files: Some(2),
            ..AuditConfig::default()
        };
        let sink = JsonlAuditSink::open(dir.path(), &config).await.unwrap();
        for i in 0..5 {
            sink.append(&record(&format!("req-{}", i), "alice", Disposition::Admitted))
                .await
                .unwrap();
        }

        // Two rotated files plus the active one survive
        assert_eq!(sink.rotated_files().await.unwrap().len(), 2);
        let ids: Vec<String> = sink
            .load_all()
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.request_id)
            .collect();
        assert_eq!(ids, vec!["req-2", "req-3", "req-4"]);
    }
}
