//! Query/audit log collaborator. Writes are best-effort and time-boxed: a
//! failed or slow audit write never fails the request that produced it.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// One audit line: who asked what, what was retrieved, what was answered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Requesting user, when known.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    /// Raw question text.
    pub question: String,
    /// Chunk ids cited as sources.
    pub sources: Vec<String>,
    /// Final answer text (possibly the degraded template).
    pub answer: String,
    /// Terminal query outcome label.
    pub outcome: String,
    /// Wall-clock time of the answer.
    pub unix_ms: u64,
}

impl AuditRecord {
    /// Stamps the record with the current wall clock.
    pub fn stamp(mut self) -> Self {
        self.unix_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|dur| dur.as_millis() as u64)
            .unwrap_or(0);
        self
    }
}

/// Audit sink collaborator.
pub trait AuditSink: Send + Sync {
    /// Appends one record.
    fn append(&self, record: &AuditRecord) -> Result<()>;
}

/// Append-only JSONL file sink.
pub struct JsonlAuditSink {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonlAuditSink {
    /// Builds a sink appending to `path`.
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            lock: Mutex::new(()),
        }
    }
}

impl AuditSink for JsonlAuditSink {
    fn append(&self, record: &AuditRecord) -> Result<()> {
        let _guard = self
            .lock
            .lock()
            .map_err(|_| anyhow::anyhow!("audit sink lock poisoned"))?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("failed to open audit log {:?}", self.path))?;
        let line = serde_json::to_string(record).context("failed to serialize audit record")?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        Ok(())
    }
}

/// Emits a record within `budget`, swallowing every failure mode. Returns
/// whether the write landed.
pub async fn emit_best_effort(
    sink: std::sync::Arc<dyn AuditSink>,
    record: AuditRecord,
    budget: Duration,
) -> bool {
    let work = tokio::task::spawn_blocking(move || sink.append(&record));
    match tokio::time::timeout(budget, work).await {
        Ok(Ok(Ok(()))) => true,
        Ok(Ok(Err(err))) => {
            warn!(error = %err, "audit write failed; dropping record");
            false
        }
        Ok(Err(join_err)) => {
            warn!(error = %join_err, "audit worker lost; dropping record");
            false
        }
        Err(_) => {
            warn!(budget_ms = budget.as_millis() as u64, "audit write timed out");
            false
        }
    }
}
