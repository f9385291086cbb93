//! Sales invoice service.
//!
//! Invoices are the sales/loading documents behind the statistics' sales
//! columns. Every applied create, update, or delete pushes the touched
//! `(farm, date, product)` tuple back through the sales aggregator so the
//! derived inventory stays consistent.

use chrono::{NaiveDate, Utc};
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

use crate::api::{Filter, RemoteStore};
use crate::errors::AppError;
use crate::events::{AppEvent, Notifier};
use crate::inventory;
use crate::models::{self, Invoice, Role, TABLE_INVOICES};
use crate::policy::{self, WarnedSet};
use crate::queue::{OfflineQueue, QueueOp};
use crate::stats::{StatisticsStore, WriteResult};
use crate::sync::Connectivity;

/// Optional/newer columns stripped by the reduced-payload retry when the
/// remote schema rejects a full row.
const OPTIONAL_COLUMNS: &[&str] = &[
    "driver_name",
    "driver_phone",
    "plate_number",
    "description",
    "is_yesterday",
];

/// User-entered invoice fields.
#[derive(Debug, Clone)]
pub struct InvoiceInput {
    pub farm_id: String,
    pub date: NaiveDate,
    pub invoice_number: String,
    pub total_cartons: i64,
    pub total_weight: f64,
    pub product_id: Option<String>,
    pub driver_name: Option<String>,
    pub driver_phone: Option<String>,
    pub plate_number: Option<String>,
    pub description: Option<String>,
    pub is_yesterday: bool,
    pub created_by: Option<String>,
}

pub struct InvoiceStore {
    store: Arc<dyn RemoteStore>,
    queue: OfflineQueue,
    notifier: Notifier,
    connectivity: Arc<Connectivity>,
    stats: Arc<StatisticsStore>,
    cache: Mutex<Vec<Invoice>>,
    warned: WarnedSet,
}

impl InvoiceStore {
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
            cache: Mutex::new(Vec::new()),
            warned: WarnedSet::new(),
        }
    }

    // -----------------------------------------------------------------------
    // Reads
    // -----------------------------------------------------------------------

    pub fn list(&self) -> Vec<Invoice> {
        match self.cache.lock() {
            Ok(cache) => cache.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<Invoice> {
        self.list().into_iter().find(|i| i.id == id)
    }

    pub async fn refetch(&self) -> Result<(), AppError> {
        let rows = self.store.select(TABLE_INVOICES, &Filter::new()).await?;
        let parsed: Vec<Invoice> = models::parse_rows(rows);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = parsed;
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Writes
    // -----------------------------------------------------------------------

    /// Record a new invoice and recompute the statistics it touches.
    pub async fn record(&self, input: InvoiceInput) -> Result<WriteResult, AppError> {
        validate(&input)?;

        let id = Uuid::new_v4().to_string();
        let row = invoice_row(&id, &input);

        if !self.connectivity.is_online() {
            self.enqueue(QueueOp::CreateInvoice, row)?;
            return Ok(WriteResult::Queued);
        }

        // Duplicate invoice numbers surface immediately; they are never
        // queued for later retry.
        if self.number_taken(&input.invoice_number, None).await? {
            return Err(AppError::DuplicateInvoice(input.invoice_number));
        }

        match self.insert_with_schema_fallback(&row).await {
            Ok(()) => {
                info!(invoice_number = %input.invoice_number, "invoice recorded");
                self.refetch().await?;
                self.recompute_tuple(&row).await?;
                Ok(WriteResult::Applied(id))
            }
            Err(e) if e.is_network() => {
                self.enqueue(QueueOp::CreateInvoice, row)?;
                Ok(WriteResult::Queued)
            }
            Err(e) if e.is_duplicate() => {
                Err(AppError::DuplicateInvoice(input.invoice_number))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Rewrite an invoice. Recomputes both the old and the new tuple when
    /// the invoice moved between farms, dates, or products.
    pub async fn update(
        &self,
        role: Role,
        id: &str,
        input: InvoiceInput,
    ) -> Result<WriteResult, AppError> {
        validate(&input)?;

        let existing = self
            .find(id)
            .ok_or_else(|| AppError::NotFound(format!("invoice {id}")))?;
        if !policy::is_editable(role, existing.created_at, Utc::now()) {
            return Err(AppError::EditLocked);
        }

        let patch = invoice_patch(&input);
        let prior = tuple_value(
            &existing.farm_id,
            existing.date,
            existing.product_id.as_deref(),
        );

        if !self.connectivity.is_online() {
            return self.queue_update(id, patch, prior);
        }

        if self.number_taken(&input.invoice_number, Some(id)).await? {
            return Err(AppError::DuplicateInvoice(input.invoice_number));
        }

        match self.store.update(TABLE_INVOICES, id, &patch).await {
            Ok(()) => {
                self.refetch().await?;
                self.recompute_tuple(&prior).await?;
                self.recompute_tuple(&patch).await?;
                Ok(WriteResult::Applied(id.to_string()))
            }
            Err(e) if e.is_network() => self.queue_update(id, patch, prior),
            Err(e) if e.is_duplicate() => {
                Err(AppError::DuplicateInvoice(input.invoice_number))
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Delete an invoice and roll its sales out of the statistics.
    pub async fn delete(&self, role: Role, id: &str) -> Result<WriteResult, AppError> {
        let existing = self
            .find(id)
            .ok_or_else(|| AppError::NotFound(format!("invoice {id}")))?;
        if !policy::is_editable(role, existing.created_at, Utc::now()) {
            return Err(AppError::EditLocked);
        }

        let tuple = tuple_value(
            &existing.farm_id,
            existing.date,
            existing.product_id.as_deref(),
        );
        let mut payload = tuple.clone();
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("id".to_string(), Value::String(id.to_string()));
        }

        if !self.connectivity.is_online() {
            self.enqueue(QueueOp::DeleteInvoice, payload)?;
            return Ok(WriteResult::Queued);
        }
        match self.store.delete(TABLE_INVOICES, id).await {
            Ok(()) => {
                self.refetch().await?;
                self.recompute_tuple(&tuple).await?;
                Ok(WriteResult::Applied(id.to_string()))
            }
            Err(e) if e.is_network() => {
                self.enqueue(QueueOp::DeleteInvoice, payload)?;
                Ok(WriteResult::Queued)
            }
            Err(e) => Err(e.into()),
        }
    }

    // -----------------------------------------------------------------------
    // Administration & warnings
    // -----------------------------------------------------------------------

    /// Null `created_by` on a deleted user's invoices.
    pub async fn detach_user(&self, user_id: &str) -> Result<usize, AppError> {
        let rows = self
            .store
            .select(TABLE_INVOICES, &Filter::new().eq("created_by", user_id))
            .await?;
        let patch = serde_json::json!({ "created_by": Value::Null });
        let mut detached = 0;
        for row in &rows {
            if let Some(id) = row.get("id").and_then(Value::as_str) {
                self.store.update(TABLE_INVOICES, id, &patch).await?;
                detached += 1;
            }
        }
        if detached > 0 {
            self.refetch().await?;
        }
        Ok(detached)
    }

    /// One-shot edit-window warnings for the caller's invoices.
    pub fn check_expiration_warnings(&self, role: Role, user_id: &str) {
        let now = Utc::now();
        let records = self.list();
        let due = policy::due_warnings(
            records
                .iter()
                .map(|i| (i.id.as_str(), i.created_at, i.created_by.as_deref())),
            role,
            user_id,
            &self.warned,
            now,
        );
        for record_id in due {
            self.notifier.emit(AppEvent::EditWindowWarning {
                record_id,
                item_type: "invoice".to_string(),
            });
        }
    }

    // -----------------------------------------------------------------------
    // Internals
    // -----------------------------------------------------------------------

    async fn number_taken(
        &self,
        invoice_number: &str,
        excluding_id: Option<&str>,
    ) -> Result<bool, AppError> {
        let rows = self
            .store
            .select(
                TABLE_INVOICES,
                &Filter::new().eq("invoice_number", invoice_number),
            )
            .await?;
        Ok(rows
            .iter()
            .any(|row| row.get("id").and_then(Value::as_str) != excluding_id))
    }

    /// Insert the row; on a schema mismatch strip optional/newer columns and
    /// resubmit once before giving up.
    async fn insert_with_schema_fallback(
        &self,
        row: &Value,
    ) -> Result<(), crate::errors::StoreError> {
        match self
            .store
            .insert(TABLE_INVOICES, std::slice::from_ref(row))
            .await
        {
            Ok(()) => Ok(()),
            Err(e) if e.is_schema() => {
                warn!(error = %e, "schema mismatch; retrying with reduced payload");
                let mut reduced = row.clone();
                if let Some(obj) = reduced.as_object_mut() {
                    for column in OPTIONAL_COLUMNS {
                        obj.remove(*column);
                    }
                }
                self.store
                    .insert(TABLE_INVOICES, std::slice::from_ref(&reduced))
                    .await
                    .map_err(|_| e)
            }
            Err(e) => Err(e),
        }
    }

    /// Recompute the statistic behind a row/tuple value; skipped when the
    /// invoice carries no product.
    async fn recompute_tuple(&self, row: &Value) -> Result<(), AppError> {
        let Some(farm_id) = row.get("farm_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(product_id) = row.get("product_id").and_then(Value::as_str) else {
            return Ok(());
        };
        let Some(date) = row
            .get("date")
            .and_then(Value::as_str)
            .and_then(|d| d.parse::<NaiveDate>().ok())
        else {
            return Ok(());
        };
        self.stats.recompute_sales(farm_id, date, product_id).await
    }

    fn queue_update(
        &self,
        id: &str,
        patch: Value,
        prior: Value,
    ) -> Result<WriteResult, AppError> {
        let payload = serde_json::json!({ "id": id, "patch": patch, "prior": prior });
        self.enqueue(QueueOp::UpdateInvoice, payload)?;
        Ok(WriteResult::Queued)
    }

    fn enqueue(&self, op: QueueOp, payload: Value) -> Result<(), AppError> {
        self.queue.enqueue(op, &payload).map_err(AppError::Local)?;
        self.notifier.emit(AppEvent::SavedOffline {
            item_type: op.item_type().to_string(),
        });
        Ok(())
    }
}

fn validate(input: &InvoiceInput) -> Result<(), AppError> {
    if input.invoice_number.trim().is_empty() {
        return Err(AppError::Validation("invoice number is required".into()));
    }
    if input.total_cartons < 1 {
        return Err(AppError::Validation(
            "total cartons must be at least 1".into(),
        ));
    }
    if input.total_weight <= 0.0 {
        return Err(AppError::Validation(
            "total weight must be greater than zero".into(),
        ));
    }
    inventory::check_count("total cartons", input.total_cartons)?;
    inventory::check_weight("total weight", input.total_weight)?;
    Ok(())
}

fn invoice_row(id: &str, input: &InvoiceInput) -> Value {
    serde_json::json!({
        "id": id,
        "farm_id": input.farm_id,
        "date": input.date,
        "invoice_number": input.invoice_number.trim(),
        "total_cartons": input.total_cartons,
        "total_weight": input.total_weight,
        "product_id": input.product_id,
        "driver_name": input.driver_name,
        "driver_phone": input.driver_phone,
        "plate_number": input.plate_number,
        "description": input.description,
        "is_yesterday": input.is_yesterday,
        "created_at": Utc::now().to_rfc3339(),
        "created_by": input.created_by,
    })
}

fn invoice_patch(input: &InvoiceInput) -> Value {
    serde_json::json!({
        "farm_id": input.farm_id,
        "date": input.date,
        "invoice_number": input.invoice_number.trim(),
        "total_cartons": input.total_cartons,
        "total_weight": input.total_weight,
        "product_id": input.product_id,
        "driver_name": input.driver_name,
        "driver_phone": input.driver_phone,
        "plate_number": input.plate_number,
        "description": input.description,
        "is_yesterday": input.is_yesterday,
    })
}

fn tuple_value(farm_id: &str, date: NaiveDate, product_id: Option<&str>) -> Value {
    serde_json::json!({
        "farm_id": farm_id,
        "date": date,
        "product_id": product_id,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemoryStore;
    use crate::db;
    use crate::errors::StoreError;
    use crate::models::{FarmType, TABLE_STATISTICS};
    use crate::stats::StatisticInput;

    struct Fixture {
        store: Arc<MemoryStore>,
        stats: Arc<StatisticsStore>,
        invoices: InvoiceStore,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let db = Arc::new(db::test_db());
        let queue = OfflineQueue::new(db);
        let notifier = Notifier::new();
        let connectivity = Arc::new(Connectivity::new());
        let stats = Arc::new(StatisticsStore::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            connectivity.clone(),
        ));
        let invoices = InvoiceStore::new(
            store.clone(),
            queue,
            notifier,
            connectivity,
            stats.clone(),
        );
        Fixture {
            store,
            stats,
            invoices,
        }
    }

    fn day() -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, 14).expect("valid date")
    }

    fn input(number: &str, cartons: i64) -> InvoiceInput {
        InvoiceInput {
            farm_id: "farm-1".into(),
            date: day(),
            invoice_number: number.into(),
            total_cartons: cartons,
            total_weight: cartons as f64 / 2.0,
            product_id: Some("prod-table-eggs".into()),
            driver_name: Some("Imran".into()),
            driver_phone: None,
            plate_number: Some("KHI-4821".into()),
            description: None,
            is_yesterday: false,
            created_by: Some("user-7".into()),
        }
    }

    async fn seed_statistic(fx: &Fixture) {
        fx.stats
            .record(
                FarmType::Standard,
                StatisticInput {
                    farm_id: "farm-1".into(),
                    date: day(),
                    product_id: "prod-table-eggs".into(),
                    previous_balance: 5,
                    previous_balance_kg: 2.5,
                    production: 20,
                    production_kg: 10.0,
                    created_by: Some("user-7".into()),
                },
            )
            .await
            .expect("seed statistic");
    }

    #[tokio::test]
    async fn test_record_invoice_recomputes_statistic() {
        let fx = fixture();
        seed_statistic(&fx).await;

        fx.invoices.record(input("INV-100", 10)).await.unwrap();

        let stat = &fx.stats.list()[0];
        assert_eq!(stat.sales, 10);
        assert_eq!(stat.current_inventory, 15);
        assert_eq!(fx.invoices.list().len(), 1);
    }

    #[tokio::test]
    async fn test_delete_invoice_rolls_sales_back() {
        let fx = fixture();
        seed_statistic(&fx).await;
        fx.invoices.record(input("INV-100", 10)).await.unwrap();
        let id = fx.invoices.list()[0].id.clone();

        fx.invoices.delete(Role::Registrar, &id).await.unwrap();

        let stat = &fx.stats.list()[0];
        assert_eq!(stat.sales, 0);
        assert_eq!(stat.current_inventory, 25);
    }

    #[tokio::test]
    async fn test_update_moving_tuple_recomputes_both_statistics() {
        let fx = fixture();
        seed_statistic(&fx).await;
        // Second statistic on another date.
        fx.stats
            .record(
                FarmType::Standard,
                StatisticInput {
                    farm_id: "farm-1".into(),
                    date: NaiveDate::from_ymd_opt(2026, 3, 15).unwrap(),
                    product_id: "prod-table-eggs".into(),
                    previous_balance: 25,
                    previous_balance_kg: 12.5,
                    production: 18,
                    production_kg: 9.0,
                    created_by: None,
                },
            )
            .await
            .unwrap();

        fx.invoices.record(input("INV-100", 10)).await.unwrap();
        let id = fx.invoices.list()[0].id.clone();

        let mut moved = input("INV-100", 10);
        moved.date = NaiveDate::from_ymd_opt(2026, 3, 15).unwrap();
        fx.invoices.update(Role::Registrar, &id, moved).await.unwrap();

        let stats = fx.stats.list();
        let day1 = stats.iter().find(|s| s.date == day()).unwrap();
        let day2 = stats
            .iter()
            .find(|s| s.date.to_string() == "2026-03-15")
            .unwrap();
        assert_eq!(day1.sales, 0);
        assert_eq!(day1.current_inventory, 25);
        assert_eq!(day2.sales, 10);
        assert_eq!(day2.current_inventory, 33);
    }

    #[tokio::test]
    async fn test_duplicate_invoice_number_is_not_queued() {
        let fx = fixture();
        fx.invoices.record(input("INV-100", 10)).await.unwrap();

        let err = fx
            .invoices
            .record(input("INV-100", 4))
            .await
            .expect_err("duplicate");
        assert!(matches!(err, AppError::DuplicateInvoice(n) if n == "INV-100"));
        assert_eq!(fx.invoices.queue.len().unwrap(), 0);
        assert_eq!(fx.store.rows(TABLE_INVOICES).len(), 1);
    }

    #[tokio::test]
    async fn test_validation_rejects_bad_totals() {
        let fx = fixture();
        assert!(matches!(
            fx.invoices.record(input("INV-1", 0)).await,
            Err(AppError::Validation(_))
        ));

        let mut no_weight = input("INV-2", 5);
        no_weight.total_weight = 0.0;
        assert!(matches!(
            fx.invoices.record(no_weight).await,
            Err(AppError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn test_offline_record_is_queued() {
        let fx = fixture();
        fx.invoices.connectivity.set_online(false);

        let result = fx.invoices.record(input("INV-100", 10)).await.unwrap();
        assert_eq!(result, WriteResult::Queued);
        assert!(fx.store.rows(TABLE_INVOICES).is_empty());
        assert_eq!(fx.invoices.queue.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_schema_mismatch_retries_with_reduced_payload() {
        let fx = fixture();
        fx.store.fail_next_insert_with(StoreError::Schema(
            "Could not find the 'is_yesterday' column of 'invoices'".into(),
        ));

        let result = fx.invoices.record(input("INV-100", 10)).await.unwrap();
        assert!(matches!(result, WriteResult::Applied(_)));

        let rows = fx.store.rows(TABLE_INVOICES);
        assert_eq!(rows.len(), 1);
        assert!(rows[0].get("driver_name").is_none());
        assert!(rows[0].get("is_yesterday").is_none());
        assert_eq!(
            rows[0].get("invoice_number").and_then(Value::as_str),
            Some("INV-100")
        );
    }

    #[tokio::test]
    async fn test_edit_window_enforced_for_non_admin() {
        let fx = fixture();
        let created = (Utc::now() - chrono::Duration::minutes(5 * 60 + 1)).to_rfc3339();
        fx.store.seed(
            TABLE_INVOICES,
            vec![serde_json::json!({
                "id": "inv-old",
                "farm_id": "farm-1",
                "date": "2026-03-14",
                "invoice_number": "INV-9",
                "total_cartons": 3,
                "total_weight": 1.5,
                "is_yesterday": false,
                "created_at": created,
                "updated_at": created,
                "created_by": "user-7",
            })],
        );
        fx.invoices.refetch().await.unwrap();

        let err = fx
            .invoices
            .delete(Role::Sales, "inv-old")
            .await
            .expect_err("locked");
        assert!(matches!(err, AppError::EditLocked));

        fx.invoices
            .delete(Role::Admin, "inv-old")
            .await
            .expect("admin delete");
        assert!(fx.store.rows(TABLE_INVOICES).is_empty());
    }
}
