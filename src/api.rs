//! Hosted table-store client.
//!
//! The hosted backend is a generic table-oriented service (row CRUD with
//! filters, head-only counts, server-maintained `updated_at`, and a pub/sub
//! broadcast channel). The core consumes it through the [`RemoteStore`]
//! trait so every service can be exercised against an in-memory double;
//! [`HttpStore`] is the production adapter speaking the PostgREST dialect.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, Method, StatusCode};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::errors::StoreError;
use crate::storage;

/// Default timeout for store requests (30 seconds).
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Timeout used specifically for the lightweight connectivity probe.
pub const CONNECTIVITY_TIMEOUT: Duration = Duration::from_secs(10);

/// Table backing the broadcast channel at REST level.
pub const TABLE_BROADCAST: &str = "broadcast_events";

// ---------------------------------------------------------------------------
// Filters
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOp {
    Eq,
    Gt,
}

/// Column filter for `select`/`count`, rendered as `col=eq.val` query pairs
/// on the wire.
#[derive(Debug, Clone, Default)]
pub struct Filter {
    clauses: Vec<(String, FilterOp, String)>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn eq(mut self, column: &str, value: impl ToString) -> Self {
        self.clauses
            .push((column.to_string(), FilterOp::Eq, value.to_string()));
        self
    }

    pub fn gt(mut self, column: &str, value: impl ToString) -> Self {
        self.clauses
            .push((column.to_string(), FilterOp::Gt, value.to_string()));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    fn query_string(&self) -> String {
        self.clauses
            .iter()
            .map(|(col, op, val)| {
                let op = match op {
                    FilterOp::Eq => "eq",
                    FilterOp::Gt => "gt",
                };
                format!("{col}={op}.{}", percent_encode(val))
            })
            .collect::<Vec<_>>()
            .join("&")
    }

    /// Row-side evaluation, used by the in-memory double.
    #[cfg(test)]
    fn matches(&self, row: &Value) -> bool {
        self.clauses.iter().all(|(col, op, val)| {
            let field = row.get(col).map(value_as_filter_string);
            match (field, op) {
                (Some(f), FilterOp::Eq) => &f == val,
                (Some(f), FilterOp::Gt) => f.as_str() > val.as_str(),
                (None, _) => false,
            }
        })
    }
}

fn percent_encode(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    for byte in input.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            _ => out.push_str(&format!("%{byte:02X}")),
        }
    }
    out
}

#[cfg(test)]
fn value_as_filter_string(v: &Value) -> String {
    match v {
        Value::String(s) => s.clone(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Store trait
// ---------------------------------------------------------------------------

/// Row-level interface to the hosted table store.
#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError>;

    /// Multi-row insert in a single call; the batch either fully applies or
    /// fully fails on the server side.
    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError>;

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<(), StoreError>;

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError>;

    /// Head-only row count, cheap enough for connectivity probes.
    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError>;

    /// Publish a pub/sub event, rendered at REST level as an insert into the
    /// broadcast table.
    async fn broadcast(
        &self,
        channel: &str,
        event: &str,
        payload: &Value,
    ) -> Result<(), StoreError> {
        let row = serde_json::json!({
            "id": Uuid::new_v4().to_string(),
            "channel": channel,
            "event": event,
            "payload": payload,
            "created_at": Utc::now().to_rfc3339(),
        });
        self.insert(TABLE_BROADCAST, std::slice::from_ref(&row))
            .await
    }
}

/// Parse a server timestamp, accepting RFC 3339 or a bare naive form.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}

/// Fetch the server-maintained `updated_at` for one row; `None` when the row
/// no longer exists remotely.
pub async fn fetch_updated_at(
    store: &dyn RemoteStore,
    table: &str,
    id: &str,
) -> Result<Option<DateTime<Utc>>, StoreError> {
    let rows = store.select(table, &Filter::new().eq("id", id)).await?;
    Ok(rows
        .first()
        .and_then(|row| row.get("updated_at"))
        .and_then(Value::as_str)
        .and_then(parse_timestamp))
}

// ---------------------------------------------------------------------------
// Change subscriptions (cursor polling)
// ---------------------------------------------------------------------------

/// Handle for an active subscription; dropping it unsubscribes.
pub struct Subscription {
    handle: JoinHandle<()>,
}

impl Subscription {
    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Watch a table for row changes. Polls with an `updated_at` cursor and
/// invokes `handler` once per changed row.
pub fn subscribe(
    store: Arc<dyn RemoteStore>,
    table: &str,
    poll_interval: Duration,
    handler: impl Fn(Value) + Send + Sync + 'static,
) -> Subscription {
    let table = table.to_string();
    let handle = tokio::spawn(async move {
        let mut cursor = Utc::now().to_rfc3339();
        loop {
            tokio::time::sleep(poll_interval).await;
            let filter = Filter::new().gt("updated_at", &cursor);
            match store.select(&table, &filter).await {
                Ok(rows) => {
                    for row in rows {
                        if let Some(ts) = row.get("updated_at").and_then(Value::as_str) {
                            if ts > cursor.as_str() {
                                cursor = ts.to_string();
                            }
                        }
                        handler(row);
                    }
                }
                Err(e) => debug!(table = %table, error = %e, "change poll failed"),
            }
        }
    });
    Subscription { handle }
}

/// Watch the broadcast channel for a specific event.
pub fn on_broadcast(
    store: Arc<dyn RemoteStore>,
    channel: &str,
    event: &str,
    poll_interval: Duration,
    handler: impl Fn(Value) + Send + Sync + 'static,
) -> Subscription {
    let channel = channel.to_string();
    let event = event.to_string();
    let handle = tokio::spawn(async move {
        let mut cursor = Utc::now().to_rfc3339();
        loop {
            tokio::time::sleep(poll_interval).await;
            let filter = Filter::new()
                .eq("channel", &channel)
                .eq("event", &event)
                .gt("created_at", &cursor);
            match store.select(TABLE_BROADCAST, &filter).await {
                Ok(rows) => {
                    for row in rows {
                        if let Some(ts) = row.get("created_at").and_then(Value::as_str) {
                            if ts > cursor.as_str() {
                                cursor = ts.to_string();
                            }
                        }
                        let payload = row.get("payload").cloned().unwrap_or(Value::Null);
                        handler(payload);
                    }
                }
                Err(e) => debug!(channel = %channel, error = %e, "broadcast poll failed"),
            }
        }
    });
    Subscription { handle }
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a classified store error.
fn friendly_error(url: &str, err: &reqwest::Error) -> StoreError {
    if err.is_connect() {
        return StoreError::Network(format!("Cannot reach store at {url}"));
    }
    if err.is_timeout() {
        return StoreError::Network(format!("Connection to {url} timed out"));
    }
    if err.is_builder() {
        return StoreError::Other(format!("Invalid store URL: {url}"));
    }
    StoreError::Network(format!("Network error communicating with {url}: {err}"))
}

/// Classify a non-success HTTP response.
fn status_error(status: StatusCode, body: &str) -> StoreError {
    let message = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());
    match status.as_u16() {
        401 | 403 => StoreError::Unauthorized,
        404 => StoreError::NotFound(message),
        409 => StoreError::Duplicate(message),
        400 => {
            let lower = message.to_lowercase();
            if lower.contains("duplicate") || lower.contains("unique constraint") {
                StoreError::Duplicate(message)
            } else if lower.contains("column") || lower.contains("schema") {
                StoreError::Schema(message)
            } else {
                StoreError::Other(message)
            }
        }
        code if code >= 500 => StoreError::Server {
            code,
            message: if message.is_empty() {
                "store server error".to_string()
            } else {
                message
            },
        },
        code => StoreError::Other(format!("Unexpected response from store (HTTP {code}): {message}")),
    }
}

fn extract_error_message(body: &str) -> Option<String> {
    let json = serde_json::from_str::<Value>(body).ok()?;
    let message = json
        .get("message")
        .or_else(|| json.get("error"))
        .and_then(Value::as_str)
        .map(|s| s.to_string())?;
    match json.get("details").or_else(|| json.get("hint")) {
        Some(Value::String(details)) if !details.is_empty() => {
            Some(format!("{message}: {details}"))
        }
        _ => Some(message),
    }
}

// ---------------------------------------------------------------------------
// HTTP adapter
// ---------------------------------------------------------------------------

/// Production adapter for the hosted store's REST surface.
pub struct HttpStore {
    base_url: String,
    anon_key: String,
}

impl HttpStore {
    pub fn new(connection: &storage::Connection) -> Self {
        Self {
            base_url: storage::normalize_store_url(&connection.store_url),
            anon_key: connection.anon_key.clone(),
        }
    }

    fn table_url(&self, table: &str, filter: &Filter) -> String {
        let base = format!("{}/rest/v1/{table}", self.base_url);
        if filter.is_empty() {
            base
        } else {
            format!("{base}?{}", filter.query_string())
        }
    }

    fn client(&self, timeout: Duration) -> Result<Client, StoreError> {
        Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StoreError::Other(format!("Failed to create HTTP client: {e}")))
    }

    async fn request(
        &self,
        method: Method,
        url: &str,
        body: Option<&Value>,
        prefer: Option<&str>,
        timeout: Duration,
    ) -> Result<reqwest::Response, StoreError> {
        let client = self.client(timeout)?;
        let mut req = client
            .request(method, url)
            .header("apikey", &self.anon_key)
            .header("Authorization", format!("Bearer {}", self.anon_key))
            .header("Content-Type", "application/json");
        if let Some(prefer) = prefer {
            req = req.header("Prefer", prefer);
        }
        if let Some(body) = body {
            req = req.json(body);
        }

        let resp = req
            .send()
            .await
            .map_err(|e| friendly_error(&self.base_url, &e))?;
        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            return Err(status_error(status, &body_text));
        }
        Ok(resp)
    }
}

#[async_trait]
impl RemoteStore for HttpStore {
    async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
        let url = self.table_url(table, filter);
        let resp = self
            .request(Method::GET, &url, None, None, DEFAULT_TIMEOUT)
            .await?;
        let body = resp.text().await.unwrap_or_default();
        if body.is_empty() {
            return Ok(Vec::new());
        }
        match serde_json::from_str::<Value>(&body) {
            Ok(Value::Array(rows)) => Ok(rows),
            Ok(other) => Ok(vec![other]),
            Err(e) => Err(StoreError::Other(format!("Invalid JSON from store: {e}"))),
        }
    }

    async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
        let url = self.table_url(table, &Filter::new());
        let body = Value::Array(rows.to_vec());
        self.request(
            Method::POST,
            &url,
            Some(&body),
            Some("return=minimal"),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<(), StoreError> {
        let url = self.table_url(table, &Filter::new().eq("id", id));
        self.request(
            Method::PATCH,
            &url,
            Some(patch),
            Some("return=minimal"),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
        let url = self.table_url(table, &Filter::new().eq("id", id));
        self.request(
            Method::DELETE,
            &url,
            None,
            Some("return=minimal"),
            DEFAULT_TIMEOUT,
        )
        .await?;
        Ok(())
    }

    async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
        // Head-only count doubles as the connectivity probe, so it runs on
        // the short timeout.
        let url = self.table_url(table, filter);
        let resp = self
            .request(
                Method::HEAD,
                &url,
                None,
                Some("count=exact"),
                CONNECTIVITY_TIMEOUT,
            )
            .await?;
        // content-range is "0-24/25"; the total follows the slash.
        let total = resp
            .headers()
            .get("content-range")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit('/').next())
            .and_then(|v| v.trim().parse::<u64>().ok());
        match total {
            Some(n) => Ok(n),
            None => {
                warn!(table, "store count response missing content-range total");
                Ok(0)
            }
        }
    }
}

// ---------------------------------------------------------------------------
// In-memory double for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// In-memory `RemoteStore` with failure injection. Stamps
    /// `created_at`/`updated_at` server-side like the hosted backend, and
    /// records insert batch sizes so tests can assert batching behavior.
    #[derive(Default)]
    pub struct MemoryStore {
        tables: Mutex<HashMap<String, Vec<Value>>>,
        offline: AtomicBool,
        next_insert_error: Mutex<Option<StoreError>>,
        pub insert_batches: Mutex<Vec<(String, usize)>>,
    }

    impl MemoryStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Simulate a transport outage for every subsequent call.
        pub fn set_offline(&self, offline: bool) {
            self.offline.store(offline, Ordering::SeqCst);
        }

        /// Fail exactly the next insert call with a network error.
        pub fn fail_next_insert(&self) {
            self.fail_next_insert_with(StoreError::Network("simulated insert failure".into()));
        }

        /// Fail exactly the next insert call with the given error.
        pub fn fail_next_insert_with(&self, error: StoreError) {
            *self.next_insert_error.lock().unwrap() = Some(error);
        }

        pub fn rows(&self, table: &str) -> Vec<Value> {
            self.tables
                .lock()
                .unwrap()
                .get(table)
                .cloned()
                .unwrap_or_default()
        }

        pub fn seed(&self, table: &str, rows: Vec<Value>) {
            self.tables
                .lock()
                .unwrap()
                .entry(table.to_string())
                .or_default()
                .extend(rows);
        }

        fn check_online(&self) -> Result<(), StoreError> {
            if self.offline.load(Ordering::SeqCst) {
                Err(StoreError::Network("simulated offline".into()))
            } else {
                Ok(())
            }
        }
    }

    #[async_trait]
    impl RemoteStore for MemoryStore {
        async fn select(&self, table: &str, filter: &Filter) -> Result<Vec<Value>, StoreError> {
            self.check_online()?;
            Ok(self
                .rows(table)
                .into_iter()
                .filter(|row| filter.matches(row))
                .collect())
        }

        async fn insert(&self, table: &str, rows: &[Value]) -> Result<(), StoreError> {
            self.check_online()?;
            if let Some(err) = self.next_insert_error.lock().unwrap().take() {
                return Err(err);
            }
            self.insert_batches
                .lock()
                .unwrap()
                .push((table.to_string(), rows.len()));

            let now = Utc::now().to_rfc3339();
            let mut tables = self.tables.lock().unwrap();
            let dest = tables.entry(table.to_string()).or_default();
            for row in rows {
                let mut row = row.clone();
                if let Some(obj) = row.as_object_mut() {
                    obj.entry("id")
                        .or_insert_with(|| Value::String(Uuid::new_v4().to_string()));
                    obj.entry("created_at")
                        .or_insert_with(|| Value::String(now.clone()));
                    obj.entry("updated_at")
                        .or_insert_with(|| Value::String(now.clone()));
                }
                dest.push(row);
            }
            Ok(())
        }

        async fn update(&self, table: &str, id: &str, patch: &Value) -> Result<(), StoreError> {
            self.check_online()?;
            let now = Utc::now().to_rfc3339();
            let mut tables = self.tables.lock().unwrap();
            let rows = tables.entry(table.to_string()).or_default();
            for row in rows.iter_mut() {
                let matches = row.get("id").and_then(Value::as_str) == Some(id);
                if !matches {
                    continue;
                }
                if let (Some(obj), Some(patch_obj)) = (row.as_object_mut(), patch.as_object()) {
                    for (k, v) in patch_obj {
                        obj.insert(k.clone(), v.clone());
                    }
                    obj.insert("updated_at".to_string(), Value::String(now.clone()));
                }
            }
            Ok(())
        }

        async fn delete(&self, table: &str, id: &str) -> Result<(), StoreError> {
            self.check_online()?;
            let mut tables = self.tables.lock().unwrap();
            if let Some(rows) = tables.get_mut(table) {
                rows.retain(|row| row.get("id").and_then(Value::as_str) != Some(id));
            }
            Ok(())
        }

        async fn count(&self, table: &str, filter: &Filter) -> Result<u64, StoreError> {
            self.check_online()?;
            Ok(self
                .rows(table)
                .iter()
                .filter(|row| filter.matches(row))
                .count() as u64)
        }
    }
}
