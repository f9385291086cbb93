//! Data model for farms, products, daily statistics, and invoices.
//!
//! Field names match the hosted store's snake_case columns so rows can be
//! moved through `serde_json::Value` without renaming.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

// Remote table names
pub const TABLE_FARMS: &str = "farms";
pub const TABLE_PRODUCTS: &str = "products";
pub const TABLE_STATISTICS: &str = "daily_statistics";
pub const TABLE_INVOICES: &str = "invoices";

/// Farm category. Determines the inventory roll-forward policy: STANDARD
/// farms carry yesterday's balance forward, MISCELLANEOUS farms report
/// declared on-hand stock instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FarmType {
    Standard,
    Miscellaneous,
}

/// Caller role. Administrators bypass the edit-window lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Role {
    Admin,
    Registrar,
    Sales,
}

impl Role {
    pub fn is_admin(self) -> bool {
        matches!(self, Role::Admin)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProductUnit {
    Count,
    Weight,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Farm {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub farm_type: FarmType,
    pub is_active: bool,
    #[serde(default)]
    pub product_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub unit: ProductUnit,
    pub has_weight_unit: bool,
    pub is_default: bool,
    pub is_custom: bool,
}

/// One row per `(farm_id, date, product_id)` tuple. Logical uniqueness is
/// enforced by upsert semantics at the service layer, not a DB constraint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyStatistic {
    pub id: String,
    pub farm_id: String,
    pub date: NaiveDate,
    pub product_id: String,
    pub previous_balance: i64,
    pub previous_balance_kg: f64,
    pub production: i64,
    pub production_kg: f64,
    pub sales: i64,
    pub sales_kg: f64,
    pub current_inventory: i64,
    pub current_inventory_kg: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

/// One sales/loading document. `is_yesterday` flags invoices entered today
/// for product loaded the previous day (reporting only).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub farm_id: String,
    pub date: NaiveDate,
    pub invoice_number: String,
    pub total_cartons: i64,
    pub total_weight: f64,
    #[serde(default)]
    pub product_id: Option<String>,
    #[serde(default)]
    pub driver_name: Option<String>,
    #[serde(default)]
    pub driver_phone: Option<String>,
    #[serde(default)]
    pub plate_number: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub is_yesterday: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub created_by: Option<String>,
}

// ---------------------------------------------------------------------------
// Default products
// ---------------------------------------------------------------------------

/// Well-known product ids seeded idempotently at bootstrap. MISCELLANEOUS
/// farms record against these when no custom product applies.
pub const DEFAULT_PRODUCT_EGGS_ID: &str = "prod-table-eggs";
pub const DEFAULT_PRODUCT_MIXED_ID: &str = "prod-mixed-produce";

pub fn default_products() -> Vec<Product> {
    vec![
        Product {
            id: DEFAULT_PRODUCT_EGGS_ID.to_string(),
            name: "Table Eggs".to_string(),
            unit: ProductUnit::Count,
            has_weight_unit: true,
            is_default: true,
            is_custom: false,
        },
        Product {
            id: DEFAULT_PRODUCT_MIXED_ID.to_string(),
            name: "Mixed Produce".to_string(),
            unit: ProductUnit::Weight,
            has_weight_unit: true,
            is_default: true,
            is_custom: false,
        },
    ]
}

/// Deserialize store rows into typed models, skipping rows that fail to
/// parse. Remote rows can drift ahead of the client's model; a bad row must
/// not take the whole collection down.
pub fn parse_rows<T: serde::de::DeserializeOwned>(rows: Vec<serde_json::Value>) -> Vec<T> {
    rows.into_iter()
        .filter_map(|row| match serde_json::from_value::<T>(row) {
            Ok(parsed) => Some(parsed),
            Err(e) => {
                tracing::warn!(error = %e, "skipping unparseable store row");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statistic_round_trips_snake_case_rows() {
        let row = serde_json::json!({
            "id": "stat-1",
            "farm_id": "farm-1",
            "date": "2026-03-14",
            "product_id": DEFAULT_PRODUCT_EGGS_ID,
            "previous_balance": 5,
            "previous_balance_kg": 2.5,
            "production": 20,
            "production_kg": 10.0,
            "sales": 0,
            "sales_kg": 0.0,
            "current_inventory": 25,
            "current_inventory_kg": 12.5,
            "created_at": "2026-03-14T06:00:00+00:00",
            "updated_at": "2026-03-14T06:00:00+00:00",
            "created_by": "user-7"
        });
        let stat: DailyStatistic = serde_json::from_value(row).expect("deserialize row");
        assert_eq!(stat.current_inventory, 25);
        assert_eq!(stat.date.to_string(), "2026-03-14");

        let back = serde_json::to_value(&stat).expect("serialize row");
        assert_eq!(back.get("farm_id").unwrap(), "farm-1");
        assert_eq!(back.get("date").unwrap(), "2026-03-14");
    }

    #[test]
    fn test_farm_type_wire_format() {
        let farm = Farm {
            id: "farm-1".into(),
            name: "North Shed".into(),
            farm_type: FarmType::Miscellaneous,
            is_active: true,
            product_ids: vec![DEFAULT_PRODUCT_MIXED_ID.into()],
        };
        let v = serde_json::to_value(&farm).unwrap();
        assert_eq!(v.get("type").and_then(|t| t.as_str()), Some("MISCELLANEOUS"));
    }
}
