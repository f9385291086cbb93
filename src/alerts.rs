//! Cross-role alert broadcast.
//!
//! Thin wrapper over the store's pub/sub channel, used to push "missing
//! statistics" alerts between roles: a sales user flags a farm/date with no
//! recorded statistics, registration staff see the alert on their dashboard.

use chrono::NaiveDate;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::api::{self, RemoteStore, Subscription};
use crate::errors::AppError;
use crate::events::{AppEvent, Notifier};

pub const ALERT_CHANNEL: &str = "alerts";
pub const EVENT_MISSING_STATISTICS: &str = "missing_statistics";

pub struct AlertService {
    store: Arc<dyn RemoteStore>,
    notifier: Notifier,
}

impl AlertService {
    pub fn new(store: Arc<dyn RemoteStore>, notifier: Notifier) -> Self {
        Self { store, notifier }
    }

    /// Flag a farm/date with no recorded statistics for the other roles.
    pub async fn publish_missing_statistics(
        &self,
        farm_id: &str,
        date: NaiveDate,
        note: Option<&str>,
    ) -> Result<(), AppError> {
        let payload = serde_json::json!({
            "farm_id": farm_id,
            "date": date,
            "note": note,
        });
        self.store
            .broadcast(ALERT_CHANNEL, EVENT_MISSING_STATISTICS, &payload)
            .await?;
        info!(farm_id, date = %date, "missing-statistics alert published");
        Ok(())
    }

    /// Watch for alerts from other clients and re-emit them on the local
    /// event channel. Dropping the returned handle unsubscribes.
    pub fn watch(&self, poll_interval: Duration) -> Subscription {
        let notifier = self.notifier.clone();
        api::on_broadcast(
            self.store.clone(),
            ALERT_CHANNEL,
            EVENT_MISSING_STATISTICS,
            poll_interval,
            move |payload| {
                let farm_id = payload
                    .get("farm_id")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let date = payload
                    .get("date")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let note = payload
                    .get("note")
                    .and_then(Value::as_str)
                    .map(|s| s.to_string());
                notifier.emit(AppEvent::MissingStatistics {
                    farm_id,
                    date,
                    note,
                });
            },
        )
    }
}
