//! Tool-call audit log.
//!
//! Append-only, in-memory, bounded: a single writer task drains a bounded
//! channel into a ring capped at a configured record count. Recording is
//! fire-and-forget from the call path; a full channel drops the record and
//! bumps a counter surfaced through status.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};

const CHANNEL_CAPACITY: usize = 512;

/// One observed tool invocation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    pub tool: String,

    /// Owning service, or the CustomMCP marker
    pub server: String,

    pub args: Value,

    pub success: bool,

    #[serde(rename = "durationMs")]
    pub duration_ms: u64,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub at: DateTime<Utc>,
}

enum AuditMsg {
    Record(AuditRecord),
    Flush(oneshot::Sender<()>),
}

struct AuditInner {
    records: Mutex<VecDeque<AuditRecord>>,
    dropped: AtomicU64,
    max_records: usize,
}

/// Handle to the audit writer. Cheap to clone; all clones feed the same ring.
#[derive(Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AuditMsg>,
    inner: Arc<AuditInner>,
}

impl AuditLog {
    pub fn new(max_records: usize) -> Self {
        let (tx, mut rx) = mpsc::channel(CHANNEL_CAPACITY);
        let inner = Arc::new(AuditInner {
            records: Mutex::new(VecDeque::with_capacity(max_records.min(1024))),
            dropped: AtomicU64::new(0),
            max_records,
        });

        let writer_inner = inner.clone();
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                match msg {
                    AuditMsg::Record(record) => {
                        let mut records = writer_inner.records.lock().unwrap();
                        if records.len() >= writer_inner.max_records {
                            records.pop_front();
                            writer_inner.dropped.fetch_add(1, Ordering::Relaxed);
                        }
                        records.push_back(record);
                    }
                    AuditMsg::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
        });

        Self { tx, inner }
    }

    /// Record one invocation. Never blocks the call path; a full channel
    /// loses the record and counts it.
    pub fn record(&self, record: AuditRecord) {
        if self.tx.try_send(AuditMsg::Record(record)).is_err() {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::warn!("audit channel full, dropping record");
        }
    }

    /// Wait until everything recorded so far has landed in the ring
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(AuditMsg::Flush(tx)).await.is_ok() {
            let _ = rx.await;
        }
    }

    pub fn snapshot(&self) -> Vec<AuditRecord> {
        self.inner.records.lock().unwrap().iter().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records lost to ring eviction or channel overflow
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(tool: &str) -> AuditRecord {
        AuditRecord {
            tool: tool.to_string(),
            server: "svc".to_string(),
            args: json!({"a": 1}),
            success: true,
            duration_ms: 5,
            error: None,
            at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_record_and_snapshot() {
        let log = AuditLog::new(10);
        log.record(record("one"));
        log.record(record("two"));
        log.flush().await;

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(snapshot[0].tool, "one");
        assert_eq!(snapshot[1].tool, "two");
        assert_eq!(log.dropped(), 0);
    }

    #[tokio::test]
    async fn test_ring_drops_oldest() {
        let log = AuditLog::new(3);
        for i in 0..5 {
            log.record(record(&format!("t{}", i)));
        }
        log.flush().await;

        let snapshot = log.snapshot();
        assert_eq!(snapshot.len(), 3);
        assert_eq!(snapshot[0].tool, "t2");
        assert_eq!(snapshot[2].tool, "t4");
        assert_eq!(log.dropped(), 2);
    }

    #[tokio::test]
    async fn test_failed_calls_keep_error_text() {
        let log = AuditLog::new(10);
        let mut r = record("boom");
        r.success = false;
        r.error = Some("tool disabled".to_string());
        log.record(r);
        log.flush().await;

        let snapshot = log.snapshot();
        assert!(!snapshot[0].success);
        assert_eq!(snapshot[0].error.as_deref(), Some("tool disabled"));
    }
}
