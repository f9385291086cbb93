//! Daily statistics service.
//!
//! Owns the statistics collection: upsert-by-tuple creation, edit-window
//! enforced updates and deletes, the sales aggregator, and the offline-queue
//! fallback at the write boundary. After every successful remote write the
//! full collection is refetched so the cache is the single source of truth.

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::api::{Filter, RemoteStore};
use crate::errors::{AppError, StoreError};
use crate::events::{AppEvent, Notifier};
use crate::inventory::{self, InventoryInput};
use crate::models::{self, DailyStatistic, FarmType, Role, TABLE_INVOICES, TABLE_STATISTICS};
use crate::policy::{self, WarnedSet};
use crate::queue::{OfflineQueue, QueueOp};
use crate::sync::Connectivity;

/// Outcome of a write-boundary call: applied remotely, or parked in the
/// offline queue for the sync engine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteResult {
    Applied(String),
    Queued,
}

/// User-entered values for one `(farm, date, product)` tuple. For STANDARD
/// farms `production` is raw output; for MISCELLANEOUS farms it is the
/// declared end-of-day on-hand stock.
#[derive(Debug, Clone)]
pub struct StatisticInput {
    pub farm_id: String,
    pub date: NaiveDate,
    pub product_id: String,
    pub previous_balance: i64,
    pub previous_balance_kg: f64,
    pub production: i64,
    pub production_kg: f64,
    pub created_by: Option<String>,
}

/// Editable fields for an existing statistic. Sales columns are owned by the
/// aggregator and cannot be patched directly.
#[derive(Debug, Clone)]
pub struct StatisticUpdate {
    pub previous_balance: i64,
    pub previous_balance_kg: f64,
    pub production: i64,
    pub production_kg: f64,
}

pub struct StatisticsStore {
    store: Arc<dyn RemoteStore>,
    queue: OfflineQueue,
    notifier: Notifier,
    connectivity: Arc<Connectivity>,
    cache: Mutex<Vec<DailyStatistic>>,
    warned: WarnedSet,
}

impl StatisticsStore {
    pub fn new(
        store: Arc<dyn RemoteStore>,
        queue: OfflineQueue,
        notifier: Notifier,
        connectivity: Arc<Connectivity>,
    ) -> Self {
        Self {
            store,
            queue,
            notifier,
            connectivity,
            cache: Mutex::new(Vec::new()),
            warned: WarnedSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn list(&self) -> Vec<DailyStatistic> {
        match self.cache.lock() {
            Ok(cache) => cache.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<DailyStatistic> {
        self.list().into_iter().find(|s| s.id == id)
    }

    pub fn find_by_tuple(
        &self,
        farm_id: &str,
        date: NaiveDate,
        product_id: &str,
    ) -> Option<DailyStatistic> {
        self.list()
            .into_iter()
            .find(|s| s.farm_id == farm_id && s.date == date && s.product_id == product_id)
    }

    /// Replace the cache with the full remote collection.
    pub async fn refetch(&self) -> Result<(), AppError> {
        let rows = self
            .store
            .select(TABLE_STATISTICS, &Filter::new())
            .await?;
        let parsed: Vec<DailyStatistic> = models::parse_rows(rows);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = parsed;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record a day's statistics, upserting on the `(farm, date, product)`
    /// tuple. Sanity bounds are enforced before any write is attempted.
    pub async fn record(
        &self,
        farm_type: FarmType,
        input: StatisticInput,
    ) -> Result<WriteResult, AppError> {
        inventory::check_count("previous balance", input.previous_balance)?;
        inventory::check_weight("previous balance weight", input.previous_balance_kg)?;
        inventory::check_count("production", input.production)?;
        inventory::check_weight("production weight", input.production_kg)?;

        if !self.connectivity.is_online() {
            return self.queue_create(farm_type, &input);
        }

        let (sales, sales_kg) = match self
            .invoiced_sales(&input.farm_id, input.date, &input.product_id)
            .await
        {
            Ok(sums) => sums,
            Err(e) if e.is_network() => return self.queue_create(farm_type, &input),
            Err(e) => return Err(e.into()),
        };

        let line = inventory::derive(
            farm_type,
            InventoryInput {
                previous_balance: input.previous_balance,
                previous_balance_kg: input.previous_balance_kg,
                production: input.production,
                production_kg: input.production_kg,
                sales,
                sales_kg,
            },
        );

        // Logical uniqueness: a second create for the same tuple becomes an
        // update of the existing row.
        if let Some(existing) = self.find_by_tuple(&input.farm_id, input.date, &input.product_id)
        {
            let patch = derived_patch(&line);
            match self.store.update(TABLE_STATISTICS, &existing.id, &patch).await {
                Ok(()) => {
                    self.refetch().await?;
                    return Ok(WriteResult::Applied(existing.id));
                }
                Err(e) if e.is_network() => {
                    return self.queue_update(&existing.id, patch);
                }
                Err(e) => return Err(e.into()),
            }
        }

        let id = Uuid::new_v4().to_string();
        let row = statistic_row(&id, &input, &line);
        match self
            .store
            .insert(TABLE_STATISTICS, std::slice::from_ref(&row))
            .await
        {
            Ok(()) => {
                info!(farm_id = %input.farm_id, date = %input.date, "statistics recorded");
                self.refetch().await?;
                Ok(WriteResult::Applied(id))
            }
            Err(e) if e.is_network() => {
                self.enqueue(QueueOp::CreateStat, row)?;
                Ok(WriteResult::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Update balance/production fields; sales are preserved and current
    /// inventory re-derived. Non-admin callers are bound by the edit window.
    pub async fn update(
        &self,
        role: Role,
        farm_type: FarmType,
        id: &str,
        update: StatisticUpdate,
    ) -> Result<WriteResult, AppError> {
        inventory::check_count("previous balance", update.previous_balance)?;
        inventory::check_weight("previous balance weight", update.previous_balance_kg)?;
        inventory::check_count("production", update.production)?;
        inventory::check_weight("production weight", update.production_kg)?;

        let existing = self
            .find(id)
            .ok_or_else(|| AppError::NotFound(format!("statistic {id}")))?;
        if !policy::is_editable(role, existing.created_at, Utc::now()) {
            return Err(AppError::EditLocked);
        }

        let line = inventory::derive(
            farm_type,
            InventoryInput {
                previous_balance: update.previous_balance,
                previous_balance_kg: update.previous_balance_kg,
                production: update.production,
                production_kg: update.production_kg,
                sales: existing.sales,
                sales_kg: existing.sales_kg,
            },
        );
        let patch = derived_patch(&line);

        if !self.connectivity.is_online() {
            return self.queue_update(id, patch);
        }
        match self.store.update(TABLE_STATISTICS, id, &patch).await {
            Ok(()) => {
                self.refetch().await?;
                Ok(WriteResult::Applied(id.to_string()))
            }
            Err(e) if e.is_network() => self.queue_update(id, patch),
            Err(e) => Err(e.into()),
        }
    }

    /// Delete a statistic row. Same edit-window rules as update.
    pub async fn delete(&self, role: Role, id: &str) -> Result<WriteResult, AppError> {
        let existing = self
            .find(id)
            .ok_or_else(|| AppError::NotFound(format!("statistic {id}")))?;
        if !policy::is_editable(role, existing.created_at, Utc::now()) {
            return Err(AppError::EditLocked);
        }

        let payload = serde_json::json!({ "id": id });
        if !self.connectivity.is_online() {
            self.enqueue(QueueOp::DeleteStat, payload)?;
            return Ok(WriteResult::Queued);
        }
        match self.store.delete(TABLE_STATISTICS, id).await {
            Ok(()) => {
                self.refetch().await?;
                Ok(WriteResult::Applied(id.to_string()))
            }
            Err(e) if e.is_network() => {
                self.enqueue(QueueOp::DeleteStat, payload)?;
                Ok(WriteResult::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Sales aggregator
    // -----------------------------------------------------------------------

    /// Recompute the sales columns of the statistic for one tuple from its
    /// invoices, and re-derive current inventory from the stored previous
    /// balance and production. No-op when no statistic row exists yet.
    pub async fn recompute_sales(
        &self,
        farm_id: &str,
        date: NaiveDate,
        product_id: &str,
    ) -> Result<(), AppError> {
        let (sales, sales_kg) = self.invoiced_sales(farm_id, date, product_id).await?;

        let filter = Filter::new()
            .eq("farm_id", farm_id)
            .eq("date", date)
            .eq("product_id", product_id);
        let rows = self.store.select(TABLE_STATISTICS, &filter).await?;
        let stats: Vec<DailyStatistic> = models::parse_rows(rows);
        let Some(stat) = stats.into_iter().next() else {
            return Ok(());
        };

        let patch = serde_json::json!({
            "sales": sales,
            "sales_kg": sales_kg,
            "current_inventory":
                inventory::recompute_current(stat.previous_balance, stat.production, sales),
            "current_inventory_kg": inventory::recompute_current_kg(
                stat.previous_balance_kg,
                stat.production_kg,
                sales_kg,
            ),
        });
        self.store.update(TABLE_STATISTICS, &stat.id, &patch).await?;
        self.refetch().await?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Administration & warnings
    // -----------------------------------------------------------------------

    /// Null `created_by` on every row owned by a deleted user. Statistics
    /// outlive their authors.
    pub async fn detach_user(&self, user_id: &str) -> Result<usize, AppError> {
        let rows = self
            .store
            .select(TABLE_STATISTICS, &Filter::new().eq("created_by", user_id))
            .await?;
        let patch = serde_json::json!({ "created_by": Value::Null });
        let mut detached = 0;
        for row in &rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                self.store.update(TABLE_STATISTICS, id, &patch).await?;
                detached += 1;
            }
        }
        if detached > 0 {
            self.refetch().await?;
        }
        Ok(detached)
    }

    /// Emit a one-shot edit-window warning for each of the caller's records
    /// whose lock is under an hour away. Called on the shell's render tick.
    pub fn check_expiration_warnings(&self, role: Role, user_id: &str) {
        let now = Utc::now();
        let records = self.list();
        let due = policy::due_warnings(
            records
                .iter()
                .map(|s| (s.id.as_str(), s.created_at, s.created_by.as_deref())),
            role,
            user_id,
            &self.warned,
            now,
        );
        for record_id in due {
            self.notifier.emit(AppEvent::EditWindowWarning {
                record_id,
                item_type: "statistic".to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn invoiced_sales(
        &self,
        farm_id: &str,
        date: NaiveDate,
        product_id: &str,
    ) -> Result<(i64, f64), StoreError> {
        let filter = Filter::new()
            .eq("farm_id", farm_id)
            .eq("date", date)
            .eq("product_id", product_id);
        let rows = self.store.select(TABLE_INVOICES, &filter).await?;
        let mut cartons = 0i64;
        let mut weight = 0f64;
        for row in &rows {
            cartons += row.get("total_cartons").and_then(Value::as_i64).unwrap_or(0);
            weight += row.get("total_weight").and_then(Value::as_f64).unwrap_or(0.0);
        }
        Ok((cartons, weight))
    }

    fn queue_create(
        &self,
        farm_type: FarmType,
        input: &StatisticInput,
    ) -> Result<WriteResult, AppError> {
        // Offline: invoiced sales are unknowable, so the declared values are
        // queued as-is; the post-drain aggregator pass settles the sales
        // columns once the invoices themselves have synced.
        let line = inventory::derive(
            farm_type,
            InventoryInput {
                previous_balance: input.previous_balance,
                previous_balance_kg: input.previous_balance_kg,
                production: input.production,
                production_kg: input.production_kg,
                sales: 0,
                sales_kg: 0.0,
            },
        );
        let id = Uuid::new_v4().to_string();
        let row = statistic_row(&id, input, &line);
        self.enqueue(QueueOp::CreateStat, row)?;
        Ok(WriteResult::Queued)
    }

    fn queue_update(&self, id: &str, patch: Value) -> Result<WriteResult, AppError> {
        let payload = serde_json::json!({ "id": id, "patch": patch });
        self.enqueue(QueueOp::UpdateStat, payload)?;
        Ok(WriteResult::Queued)
    }

    fn enqueue(&self, op: QueueOp, payload: Value) -> Result<(), AppError> {
        self.queue
            .enqueue(op, &payload)
            .map_err(AppError::Local)?;
        self.notifier.emit(AppEvent::SavedOffline {
            item_type: op.item_type().to_string(),
        });
        Ok(())
    }
}

fn statistic_row(
    id: &str,
    input: &StatisticInput,
    line: &inventory::DerivedLine,
) -> Value {
    serde_json::json!({
        "id": id,
        "farm_id": input.farm_id,
        "date": input.date,
        "product_id": input.product_id,
        "previous_balance": line.previous_balance,
        "previous_balance_kg": line.previous_balance_kg,
        "production": line.production,
        "production_kg": line.production_kg,
        "sales": line.sales,
        "sales_kg": line.sales_kg,
        "current_inventory": line.current_inventory,
        "current_inventory_kg": line.current_inventory_kg,
        "created_at": Utc::now().to_rfc3339(),
        "created_by": input.created_by,
    })
}

fn derived_patch(line: &inventory::DerivedLine) -> Value {
    serde_json::json!({
        "previous_balance": line.previous_balance,
        "previous_balance_kg": line.previous_balance_kg,
        "production": line.production,
        "production_kg": line.production_kg,
        "sales": line.sales,
        "sales_kg": line.sales_kg,
        "current_inventory": line.current_inventory,
        "current_inventory_kg": line.current_inventory_kg,
    })
}
