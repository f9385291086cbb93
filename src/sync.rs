//! Sync engine.
//!
//! Drains the offline write queue against the hosted store: creates are
//! batched per type, updates and deletes replay sequentially in enqueue
//! order with per-update conflict detection against the server-maintained
//! `updated_at`. Conflicts resolve server-wins: the stale local edit is
//! dropped and only an aggregated count reaches the user.
//!
//! A drain can be triggered by the network coming back, by startup with a
//! non-empty queue, or manually. An atomic in-progress guard makes the entry
//! point reentrant-safe, because the startup path and the online-transition
//! path can fire near-simultaneously while a prior drain's I/O is still
//! suspended.

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{self, Filter, RemoteStore};
use crate::events::{AppEvent, Notifier};
use crate::models::{TABLE_FARMS, TABLE_INVOICES, TABLE_STATISTICS};
use crate::queue::{OfflineQueue, QueueItem, QueueOp};
use crate::stats::StatisticsStore;

/// Items that failed this many drains are parked until a manual retry-all.
pub const MAX_SYNC_RETRIES: i64 = 5;

// ---------------------------------------------------------------------------
// Connectivity flag
// ---------------------------------------------------------------------------

/// Process-wide connectivity flag. The write boundary consults it to decide
/// between a direct store call and the offline queue; the sync loop keeps it
/// current from the health probe.
pub struct Connectivity {
    online: AtomicBool,
}

impl Default for Connectivity {
    fn default() -> Self {
        Self::new()
    }
}

impl Connectivity {
    pub fn new() -> Self {
        Self {
            online: AtomicBool::new(true),
        }
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Returns the previous value.
    pub fn set_online(&self, online: bool) -> bool {
        self.online.swap(online, Ordering::SeqCst)
    }
}

/// Probe the store with a head-only count. Any response that made it through
/// the transport counts as "online", even an auth failure.
pub async fn check_network_status(store: &dyn RemoteStore) -> bool {
    match store.count(TABLE_FARMS, &Filter::new()).await {
        Ok(_) => true,
        Err(e) => !e.is_network(),
    }
}

// ---------------------------------------------------------------------------
// Reports & status
// ---------------------------------------------------------------------------

/// Aggregated outcome of one drain pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub success: u32,
    pub conflicts: u32,
    pub failed: u32,
}

/// Snapshot of engine state for UI indicators.
#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub pending: usize,
    pub in_progress: bool,
    pub online: bool,
    pub last_sync: Option<String>,
}

enum ItemOutcome {
    Applied,
    Conflict(String),
    Failed(String),
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    store: Arc<dyn RemoteStore>,
    queue: OfflineQueue,
    notifier: Notifier,
    connectivity: Arc<Connectivity>,
    stats: Arc<StatisticsStore>,
    in_progress: AtomicBool,
    running: AtomicBool,
    last_sync: Mutex<Option<String>>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        queue: OfflineQueue,
        notifier: Notifier,
        connectivity: Arc<Connectivity>,
        stats: Arc<StatisticsStore>,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            connectivity,
            stats,
            in_progress: AtomicBool::new(false),
            running: AtomicBool::new(false),
            last_sync: Mutex::new(None),
        }
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            pending: self.queue.len().unwrap_or(0),
            in_progress: self.in_progress.load(Ordering::SeqCst),
            online: self.connectivity.is_online(),
            last_sync: self.last_sync.lock().ok().and_then(|g| g.clone()),
        }
    }

    /// Manual user-initiated retry: reconsiders parked items too.
    pub async fn force_sync(&self) -> Result<SyncReport, String> {
        self.process_queue(true).await
    }

    /// Drain the queue once. Reentrant-safe: a second call while a drain is
    /// running returns an empty report immediately.
    pub async fn process_queue(&self, force_retry_all: bool) -> Result<SyncReport, String> {
        if self
            .in_progress
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            debug!("drain already in progress; skipping");
            return Ok(SyncReport::default());
        }

        let result = self.drain(force_retry_all).await;
        self.in_progress.store(false, Ordering::SeqCst);

        match &result {
            Ok(report) => {
                if let Ok(mut guard) = self.last_sync.lock() {
                    *guard = Some(Utc::now().to_rfc3339());
                }
                self.notifier.emit(AppEvent::SyncCompleted {
                    success: report.success,
                    conflicts: report.conflicts,
                    failed: report.failed,
                });
            }
            Err(e) => warn!("drain failed: {e}"),
        }
        result
    }

    async fn drain(&self, force_retry_all: bool) -> Result<SyncReport, String> {
        if force_retry_all {
            self.queue.reset_retries()?;
        }

        // Snapshot first so concurrent enqueues cannot interleave with this
        // pass.
        let snapshot = self.queue.peek_all()?;
        if snapshot.is_empty() {
            return Ok(SyncReport::default());
        }
        self.notifier.emit(AppEvent::SyncStarted);
        info!(items = snapshot.len(), "draining offline queue");

        let mut report = SyncReport::default();
        let mut touched = TupleSet::new();

        // Batch phase: pure creates grouped per type, one multi-row insert
        // each, all-or-nothing per group.
        for op in [QueueOp::CreateStat, QueueOp::CreateInvoice] {
            let group: Vec<&QueueItem> = snapshot
                .iter()
                .filter(|item| item.op == op && item.retry_count < MAX_SYNC_RETRIES)
                .collect();
            if group.is_empty() {
                continue;
            }
            let rows: Vec<Value> = group.iter().map(|item| item.payload.clone()).collect();
            match self.store.insert(table_for(op), &rows).await {
                Ok(()) => {
                    for item in &group {
                        self.queue.dequeue(item.id)?;
                        report.success += 1;
                        if op == QueueOp::CreateInvoice {
                            touched.add(&item.payload);
                        }
                    }
                    info!(op = op.as_str(), count = group.len(), "batch applied");
                }
                Err(e) => {
                    // No partial dequeue: the batch call fails atomically, so
                    // the whole group stays queued for the next attempt.
                    warn!(op = op.as_str(), error = %e, "batch failed; keeping group queued");
                    for item in &group {
                        self.record_item_failure(item, &e.to_string())?;
                        report.failed += 1;
                    }
                }
            }
        }

        // Sequential phase: updates and deletes in original enqueue order.
        for item in snapshot
            .iter()
            .filter(|item| !item.op.is_create() && item.retry_count < MAX_SYNC_RETRIES)
        {
            match self.apply_item(item).await {
                ItemOutcome::Applied => {
                    self.queue.dequeue(item.id)?;
                    report.success += 1;
                    if item.op.is_invoice() {
                        touched.add(&item.payload);
                        if let Some(prior) = item.payload.get("prior") {
                            touched.add(prior);
                        }
                        if let Some(patch) = item.payload.get("patch") {
                            touched.add(patch);
                        }
                    }
                }
                ItemOutcome::Conflict(message) => {
                    // Server wins: drop the stale edit, count it, log it.
                    self.queue.dequeue(item.id)?;
                    report.conflicts += 1;
                    self.queue
                        .record_failure(item.op.item_type(), &format!("conflict: {message}"))?;
                    info!(queue_id = item.id, "offline edit superseded by server");
                }
                ItemOutcome::Failed(message) => {
                    self.record_item_failure(item, &message)?;
                    report.failed += 1;
                }
            }
        }

        // Invoices that landed during this drain change sales aggregates;
        // settle the touched statistics now that the rows exist remotely.
        for (farm_id, date, product_id) in touched.into_tuples() {
            if let Err(e) = self
                .stats
                .recompute_sales(&farm_id, date, &product_id)
                .await
            {
                warn!(farm_id = %farm_id, error = %e, "post-drain sales recompute failed");
            }
        }

        info!(
            success = report.success,
            conflicts = report.conflicts,
            failed = report.failed,
            "drain complete"
        );
        Ok(report)
    }

    async fn apply_item(&self, item: &QueueItem) -> ItemOutcome {
        let Some(id) = item.payload.get("id").and_then(Value::as_str) else {
            return ItemOutcome::Conflict("payload missing row id".to_string());
        };
        let table = table_for(item.op);

        match item.op {
            QueueOp::UpdateStat | QueueOp::UpdateInvoice => {
                // Conflict detection: if the server row changed after this
                // offline edit was made, the edit is stale.
                match api::fetch_updated_at(self.store.as_ref(), table, id).await {
                    Ok(Some(remote)) if remote > item.queued_at => {
                        return ItemOutcome::Conflict(format!(
                            "server updated {table}/{id} at {remote}, after the offline edit"
                        ));
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        return ItemOutcome::Conflict(format!(
                            "{table}/{id} no longer exists on the server"
                        ));
                    }
                    Err(e) => return ItemOutcome::Failed(e.to_string()),
                }

                let patch = item.payload.get("patch").cloned().unwrap_or(Value::Null);
                match self.store.update(table, id, &patch).await {
                    Ok(()) => ItemOutcome::Applied,
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                }
            }
            QueueOp::DeleteStat | QueueOp::DeleteInvoice => {
                match self.store.delete(table, id).await {
                    Ok(()) => ItemOutcome::Applied,
                    Err(e) => ItemOutcome::Failed(e.to_string()),
                }
            }
            QueueOp::CreateStat | QueueOp::CreateInvoice => {
                // Creates are handled by the batch phase.
                ItemOutcome::Failed("create routed to sequential phase".to_string())
            }
        }
    }

    fn record_item_failure(&self, item: &QueueItem, message: &str) -> Result<(), String> {
        self.queue.record_retry_failure(item.id, message)?;
        // Log once when the item hits the ceiling and gets parked.
        if item.retry_count + 1 >= MAX_SYNC_RETRIES {
            self.queue.record_failure(
                item.op.item_type(),
                &format!("retry limit reached: {message}"),
            )?;
        }
        Ok(())
    }
}

fn table_for(op: QueueOp) -> &'static str {
    if op.is_invoice() {
        TABLE_INVOICES
    } else {
        TABLE_STATISTICS
    }
}

/// Deduplicated `(farm, date, product)` tuples touched by a drain.
struct TupleSet {
    seen: HashSet<(String, NaiveDate, String)>,
}

impl TupleSet {
    fn new() -> Self {
        Self {
            seen: HashSet::new(),
        }
    }

    fn add(&mut self, value: &Value) {
        let farm_id = value.get("farm_id").and_then(Value::as_str);
        let product_id = value.get("product_id").and_then(Value::as_str);
        let date = value
            .get("date")
            .and_then(Value::as_str)
            .and_then(|d| d.parse::<NaiveDate>().ok());
        if let (Some(farm_id), Some(date), Some(product_id)) = (farm_id, date, product_id) {
            self.seen
                .insert((farm_id.to_string(), date, product_id.to_string()));
        }
    }

    fn into_tuples(self) -> Vec<(String, NaiveDate, String)> {
        self.seen.into_iter().collect()
    }
}

// ---------------------------------------------------------------------------
// Background loop
// ---------------------------------------------------------------------------

/// Spawn the periodic connectivity probe + drain loop. Emits a network
/// status event every cycle and drains whenever the queue is non-empty and
/// the store is reachable, which covers both the startup trigger and the
/// offline-to-online transition.
pub fn start_sync_loop(engine: Arc<SyncEngine>, interval_secs: u64) -> JoinHandle<()> {
    engine.running.store(true, Ordering::SeqCst);

    tokio::spawn(async move {
        info!("Sync loop started (interval: {interval_secs}s)");
        let mut previous_online: Option<bool> = None;

        loop {
            if !engine.running.load(Ordering::SeqCst) {
                info!("Sync loop stopped");
                break;
            }

            tokio::time::sleep(Duration::from_secs(interval_secs)).await;

            if !engine.running.load(Ordering::SeqCst) {
                break;
            }

            let online = check_network_status(engine.store.as_ref()).await;
            engine.connectivity.set_online(online);
            engine.notifier.emit(AppEvent::NetworkStatus { online });

            if !online {
                if previous_online != Some(false) {
                    info!("Network offline; deferring sync and keeping queue pending");
                }
                previous_online = Some(false);
                continue;
            }

            if previous_online == Some(false) {
                info!("Network restored; resuming queued sync");
            }
            previous_online = Some(true);

            let pending = engine.queue.len().unwrap_or(0);
            if pending > 0 {
                if let Err(e) = engine.process_queue(false).await {
                    warn!("scheduled drain failed: {e}");
                }
            }
        }
    })
}

/// Ask a running loop to stop after its current cycle.
pub fn stop_sync_loop(engine: &SyncEngine) {
    engine.running.store(false, Ordering::SeqCst);
}
