//! EggDesk - offline-first farm production and sales dashboard core.
//!
//! This crate is the headless backend an embedding shell drives: typed
//! models for farms, products, daily statistics, and sales invoices; a
//! client for the hosted table store; a SQLite-persisted offline write
//! queue; and a sync engine that drains the queue with last-write-wins
//! conflict handling. The shell subscribes to [`events::AppEvent`] for
//! toasts and status indicators.

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::warn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub mod alerts;
pub mod api;
pub mod db;
pub mod errors;
pub mod events;
pub mod farms;
pub mod inventory;
pub mod invoices;
pub mod models;
pub mod policy;
pub mod queue;
pub mod stats;
pub mod storage;
pub mod sync;

pub use errors::{AppError, StartupError, StoreError};
pub use events::{AppEvent, Notifier};
pub use models::{DailyStatistic, Farm, FarmType, Invoice, Product, Role};
pub use stats::WriteResult;
pub use sync::{SyncReport, SyncStatus};

use alerts::AlertService;
use api::{HttpStore, RemoteStore};
use db::DbState;
use farms::{FarmStore, ProductStore};
use invoices::InvoiceStore;
use queue::OfflineQueue;
use stats::StatisticsStore;
use sync::{Connectivity, SyncEngine};

/// Default interval between sync-loop cycles.
pub const DEFAULT_SYNC_INTERVAL_SECS: u64 = 30;

/// Initialise tracing once: human-readable console output plus a JSON daily
/// log file. Returns the appender guard; dropping it flushes the file.
pub fn init_logging(
    log_dir: &Path,
) -> Result<tracing_appender::non_blocking::WorkerGuard, StartupError> {
    let file_appender = tracing_appender::rolling::daily(log_dir, "eggdesk.log");
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer())
        .with(fmt::layer().json().with_writer(non_blocking))
        .try_init()
        .map_err(|e| StartupError::Logging(e.to_string()))?;

    Ok(guard)
}

/// The assembled application: explicit service objects constructed once and
/// passed by reference, no ambient globals.
pub struct App {
    pub db: Arc<DbState>,
    pub store: Arc<dyn RemoteStore>,
    pub notifier: Notifier,
    pub connectivity: Arc<Connectivity>,
    pub queue: OfflineQueue,
    pub farms: Arc<FarmStore>,
    pub products: Arc<ProductStore>,
    pub statistics: Arc<StatisticsStore>,
    pub invoices: Arc<InvoiceStore>,
    pub sync: Arc<SyncEngine>,
    pub alerts: Arc<AlertService>,
}

impl std::fmt::Debug for App {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("App").finish_non_exhaustive()
    }
}

impl App {
    /// Fail-fast bootstrap: missing connection secrets halt initialization
    /// entirely rather than starting a degraded app.
    pub async fn bootstrap(data_dir: &Path) -> Result<App, StartupError> {
        let connection = storage::load_connection()?;
        let db = Arc::new(db::init(data_dir).map_err(StartupError::Database)?);
        let store: Arc<dyn RemoteStore> = Arc::new(HttpStore::new(&connection));
        Ok(Self::assemble(db, store).await)
    }

    /// Wire the service graph over an arbitrary store implementation.
    pub async fn assemble(db: Arc<DbState>, store: Arc<dyn RemoteStore>) -> App {
        let notifier = Notifier::new();
        let connectivity = Arc::new(Connectivity::new());
        let queue = OfflineQueue::new(db.clone());

        let statistics = Arc::new(StatisticsStore::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            connectivity.clone(),
        ));
        let invoices = Arc::new(InvoiceStore::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            connectivity.clone(),
            statistics.clone(),
        ));
        let farms = Arc::new(FarmStore::new(store.clone()));
        let products = Arc::new(ProductStore::new(store.clone()));
        let sync = Arc::new(SyncEngine::new(
            store.clone(),
            queue.clone(),
            notifier.clone(),
            connectivity.clone(),
            statistics.clone(),
        ));
        let alerts = Arc::new(AlertService::new(store.clone(), notifier.clone()));

        // Default products back the MISCELLANEOUS farm flow; seed them, but
        // never block startup on an unreachable store.
        if let Err(e) = products.seed_defaults().await {
            warn!(error = %e, "default product seeding deferred");
        }

        let app = App {
            db,
            store,
            notifier,
            connectivity,
            queue,
            farms,
            products,
            statistics,
            invoices,
            sync,
            alerts,
        };

        // Warm the caches so upsert checks and edit-window lookups see the
        // remote state. An offline start leaves them empty until the first
        // successful refetch.
        if let Err(e) = app.refetch_all().await {
            warn!(error = %e, "startup refetch deferred");
        }

        app
    }

    /// Start the background connectivity probe + drain loop.
    pub fn start_sync(&self, interval_secs: u64) -> JoinHandle<()> {
        sync::start_sync_loop(self.sync.clone(), interval_secs)
    }

    pub fn stop_sync(&self) {
        sync::stop_sync_loop(&self.sync);
    }

    /// Refresh every cached collection from the store.
    pub async fn refetch_all(&self) -> Result<(), AppError> {
        self.farms.refetch().await?;
        self.products.refetch().await?;
        self.statistics.refetch().await?;
        self.invoices.refetch().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemoryStore;
    use crate::models::TABLE_PRODUCTS;
    use chrono::NaiveDate;
    use serial_test::serial;

    #[tokio::test]
    async fn test_assemble_seeds_default_products() {
        let store = Arc::new(MemoryStore::new());
        let app = App::assemble(Arc::new(db::test_db()), store.clone()).await;

        assert_eq!(store.rows(TABLE_PRODUCTS).len(), 2);
        assert_eq!(app.products.list().len(), 2);
    }

    #[tokio::test]
    async fn test_offline_record_then_drain_round_trip() {
        let store = Arc::new(MemoryStore::new());
        let app = App::assemble(Arc::new(db::test_db()), store.clone()).await;

        // Go offline, record a day's statistics.
        app.connectivity.set_online(false);
        let result = app
            .statistics
            .record(
                FarmType::Standard,
                stats::StatisticInput {
                    farm_id: "farm-1".into(),
                    date: NaiveDate::from_ymd_opt(2026, 3, 14).unwrap(),
                    product_id: models::DEFAULT_PRODUCT_EGGS_ID.into(),
                    previous_balance: 5,
                    previous_balance_kg: 2.5,
                    production: 20,
                    production_kg: 10.0,
                    created_by: Some("user-7".into()),
                },
            )
            .await
            .unwrap();
        assert_eq!(result, WriteResult::Queued);

        // Back online: the drain applies the queued create.
        app.connectivity.set_online(true);
        let report = app.sync.process_queue(false).await.unwrap();
        assert_eq!(report.success, 1);
        assert_eq!(store.rows(models::TABLE_STATISTICS).len(), 1);
        assert!(app.queue.is_empty().unwrap());
    }

    #[tokio::test]
    #[serial]
    async fn test_bootstrap_fails_fast_without_secrets() {
        std::env::remove_var(storage::ENV_STORE_URL);
        std::env::remove_var(storage::ENV_STORE_ANON_KEY);
        let dir = std::env::temp_dir().join(format!("eggdesk-boot-{}", uuid::Uuid::new_v4()));

        // Keyring may be empty or unavailable in the test environment; either
        // way bootstrap must refuse to start without both secrets.
        if !storage::is_configured() {
            let err = App::bootstrap(&dir).await.expect_err("fail fast");
            assert!(matches!(err, StartupError::MissingSecret(_)));
        }
        let _ = std::fs::remove_dir_all(&dir);
    }
}
