//! Offline write queue.
//!
//! A persistent, ordered list of pending mutations. Items are appended when
//! a write fails with a transport error (or the client already knows it is
//! offline) and drained by the sync engine. The queue does no network I/O
//! itself; its only side effect is persistence.

use chrono::{DateTime, Utc};
use rusqlite::params;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::info;

use crate::db::DbState;

/// Mutation kinds the queue can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum QueueOp {
    CreateStat,
    CreateInvoice,
    UpdateStat,
    UpdateInvoice,
    DeleteStat,
    DeleteInvoice,
}

impl QueueOp {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueOp::CreateStat => "create_statistic",
            QueueOp::CreateInvoice => "create_invoice",
            QueueOp::UpdateStat => "update_statistic",
            QueueOp::UpdateInvoice => "update_invoice",
            QueueOp::DeleteStat => "delete_statistic",
            QueueOp::DeleteInvoice => "delete_invoice",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "create_statistic" => Some(QueueOp::CreateStat),
            "create_invoice" => Some(QueueOp::CreateInvoice),
            "update_statistic" => Some(QueueOp::UpdateStat),
            "update_invoice" => Some(QueueOp::UpdateInvoice),
            "delete_statistic" => Some(QueueOp::DeleteStat),
            "delete_invoice" => Some(QueueOp::DeleteInvoice),
            _ => None,
        }
    }

    /// Creates are batched; updates and deletes replay sequentially.
    pub fn is_create(self) -> bool {
        matches!(self, QueueOp::CreateStat | QueueOp::CreateInvoice)
    }

    pub fn is_invoice(self) -> bool {
        matches!(
            self,
            QueueOp::CreateInvoice | QueueOp::UpdateInvoice | QueueOp::DeleteInvoice
        )
    }

    /// Human-facing label used in the failure log.
    pub fn item_type(self) -> &'static str {
        if self.is_invoice() {
            "invoice"
        } else {
            "statistic"
        }
    }
}

/// One pending mutation. `queued_at` is the client time of the original
/// action and is what conflict detection compares against the server's
/// `updated_at`.
#[derive(Debug, Clone)]
pub struct QueueItem {
    pub id: i64,
    pub op: QueueOp,
    pub payload: Value,
    pub queued_at: DateTime<Utc>,
    pub retry_count: i64,
    pub last_error: Option<String>,
}

/// Append-only diagnostics record for failed/conflicted sync attempts.
#[derive(Debug, Clone, Serialize)]
pub struct SyncFailureLogEntry {
    pub id: i64,
    pub item_type: String,
    pub message: String,
    pub created_at: String,
}

/// The queue service. Cheap to clone; all state lives in the local database
/// so items survive a full process restart.
#[derive(Clone)]
pub struct OfflineQueue {
    db: Arc<DbState>,
}

impl OfflineQueue {
    pub fn new(db: Arc<DbState>) -> Self {
        Self { db }
    }

    /// Append a mutation with `queued_at = now()` and a zero retry count.
    pub fn enqueue(&self, op: QueueOp, payload: &Value) -> Result<QueueItem, String> {
        let queued_at = Utc::now();
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO sync_queue (op, payload, queued_at, retry_count)
             VALUES (?1, ?2, ?3, 0)",
            params![
                op.as_str(),
                payload.to_string(),
                queued_at.to_rfc3339()
            ],
        )
        .map_err(|e| format!("enqueue: {e}"))?;
        let id = conn.last_insert_rowid();
        info!(op = op.as_str(), queue_id = id, "queued offline mutation");
        Ok(QueueItem {
            id,
            op,
            payload: payload.clone(),
            queued_at,
            retry_count: 0,
            last_error: None,
        })
    }

    /// Remove an item by id. Removing a missing id is a no-op, not an error.
    pub fn dequeue(&self, id: i64) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM sync_queue WHERE id = ?1", params![id])
            .map_err(|e| format!("dequeue: {e}"))?;
        Ok(())
    }

    /// Empty the queue. Only ever called by an explicit user action
    /// ("discard unsynced changes"), never automatically.
    pub fn clear(&self) -> Result<usize, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute("DELETE FROM sync_queue", [])
            .map_err(|e| format!("clear queue: {e}"))
    }

    /// Ordered read-only snapshot. The sync engine snapshots before
    /// processing so concurrent enqueues cannot interleave with a drain.
    pub fn peek_all(&self) -> Result<Vec<QueueItem>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, op, payload, queued_at, retry_count, last_error
                 FROM sync_queue
                 ORDER BY id ASC",
            )
            .map_err(|e| e.to_string())?;

        let rows = stmt
            .query_map([], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                    row.get::<_, String>(3)?,
                    row.get::<_, i64>(4)?,
                    row.get::<_, Option<String>>(5)?,
                ))
            })
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .filter_map(|(id, op, payload, queued_at, retry_count, last_error)| {
                let op = QueueOp::parse(&op)?;
                let payload = serde_json::from_str(&payload).ok()?;
                let queued_at = DateTime::parse_from_rfc3339(&queued_at)
                    .ok()?
                    .with_timezone(&Utc);
                Some(QueueItem {
                    id,
                    op,
                    payload,
                    queued_at,
                    retry_count,
                    last_error,
                })
            })
            .collect();
        Ok(rows)
    }

    pub fn len(&self) -> Result<usize, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.query_row("SELECT COUNT(*) FROM sync_queue", [], |row| {
            row.get::<_, i64>(0)
        })
        .map(|n| n as usize)
        .map_err(|e| e.to_string())
    }

    pub fn is_empty(&self) -> Result<bool, String> {
        Ok(self.len()? == 0)
    }

    /// Record a non-conflict failure: bump the retry counter and remember
    /// the error for the UI.
    pub fn record_retry_failure(&self, id: i64, error: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE sync_queue
             SET retry_count = retry_count + 1, last_error = ?2
             WHERE id = ?1",
            params![id, error],
        )
        .map_err(|e| format!("record retry failure: {e}"))?;
        Ok(())
    }

    /// Reset every retry counter so a manual "retry all" reconsiders items
    /// that exhausted the ceiling.
    pub fn reset_retries(&self) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "UPDATE sync_queue SET retry_count = 0, last_error = NULL",
            [],
        )
        .map_err(|e| format!("reset retries: {e}"))?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Failure log
    // -----------------------------------------------------------------------

    /// Append a diagnostics entry. Never consulted by retry logic.
    pub fn record_failure(&self, item_type: &str, message: &str) -> Result<(), String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        conn.execute(
            "INSERT INTO sync_failure_log (item_type, message) VALUES (?1, ?2)",
            params![item_type, message],
        )
        .map_err(|e| format!("record failure: {e}"))?;
        Ok(())
    }

    pub fn recent_failures(&self, limit: i64) -> Result<Vec<SyncFailureLogEntry>, String> {
        let conn = self.db.conn.lock().map_err(|e| e.to_string())?;
        let mut stmt = conn
            .prepare(
                "SELECT id, item_type, message, created_at
                 FROM sync_failure_log
                 ORDER BY id DESC
                 LIMIT ?1",
            )
            .map_err(|e| e.to_string())?;
        let rows = stmt
            .query_map(params![limit.max(1)], |row| {
                Ok(SyncFailureLogEntry {
                    id: row.get(0)?,
                    item_type: row.get(1)?,
                    message: row.get(2)?,
                    created_at: row.get(3)?,
                })
            })
            .map_err(|e| e.to_string())?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db;

    fn queue() -> OfflineQueue {
        OfflineQueue::new(Arc::new(db::test_db()))
    }

    #[test]
    fn test_enqueue_preserves_insertion_order() {
        let queue = queue();
        for n in 0..5 {
            queue
                .enqueue(QueueOp::CreateStat, &serde_json::json!({ "n": n }))
                .unwrap();
        }
        let items = queue.peek_all().unwrap();
        assert_eq!(items.len(), 5);
        for (n, item) in items.iter().enumerate() {
            assert_eq!(item.payload.get("n").and_then(Value::as_i64), Some(n as i64));
            assert_eq!(item.retry_count, 0);
        }
    }

    #[test]
    fn test_dequeue_is_idempotent() {
        let queue = queue();
        let item = queue
            .enqueue(QueueOp::DeleteInvoice, &serde_json::json!({ "id": "inv-1" }))
            .unwrap();
        queue.dequeue(item.id).unwrap();
        // Second removal of the same id is a no-op.
        queue.dequeue(item.id).unwrap();
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_clear_empties_queue() {
        let queue = queue();
        queue
            .enqueue(QueueOp::CreateInvoice, &serde_json::json!({}))
            .unwrap();
        queue
            .enqueue(QueueOp::UpdateStat, &serde_json::json!({}))
            .unwrap();
        assert_eq!(queue.clear().unwrap(), 2);
        assert!(queue.is_empty().unwrap());
    }

    #[test]
    fn test_retry_tracking_and_reset() {
        let queue = queue();
        let item = queue
            .enqueue(QueueOp::UpdateInvoice, &serde_json::json!({ "id": "inv-1" }))
            .unwrap();
        queue
            .record_retry_failure(item.id, "store server error (HTTP 503)")
            .unwrap();
        queue.record_retry_failure(item.id, "timed out").unwrap();

        let items = queue.peek_all().unwrap();
        assert_eq!(items[0].retry_count, 2);
        assert_eq!(items[0].last_error.as_deref(), Some("timed out"));

        queue.reset_retries().unwrap();
        let items = queue.peek_all().unwrap();
        assert_eq!(items[0].retry_count, 0);
        assert!(items[0].last_error.is_none());
    }

    #[test]
    fn test_queue_survives_restart() {
        // File-backed database: enqueue, drop every handle, reopen, and the
        // same items come back in the same order.
        let dir = std::env::temp_dir().join(format!("eggdesk-test-{}", uuid::Uuid::new_v4()));
        {
            let db = Arc::new(db::init(&dir).expect("init db"));
            let queue = OfflineQueue::new(db);
            queue
                .enqueue(QueueOp::CreateStat, &serde_json::json!({ "seq": 1 }))
                .unwrap();
            queue
                .enqueue(QueueOp::UpdateStat, &serde_json::json!({ "seq": 2 }))
                .unwrap();
            queue
                .enqueue(QueueOp::DeleteInvoice, &serde_json::json!({ "seq": 3 }))
                .unwrap();
        }

        let db = Arc::new(db::init(&dir).expect("reopen db"));
        let queue = OfflineQueue::new(db);
        let items = queue.peek_all().unwrap();
        assert_eq!(items.len(), 3);
        let seqs: Vec<i64> = items
            .iter()
            .filter_map(|i| i.payload.get("seq").and_then(Value::as_i64))
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(items[1].op, QueueOp::UpdateStat);

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_failure_log_is_append_only() {
        let queue = queue();
        queue.record_failure("invoice", "conflict: server version newer").unwrap();
        queue.record_failure("statistic", "retry ceiling reached").unwrap();

        let entries = queue.recent_failures(10).unwrap();
        assert_eq!(entries.len(), 2);
        // Most recent first
        assert_eq!(entries[0].item_type, "statistic");
        assert_eq!(entries[1].item_type, "invoice");
    }
}
