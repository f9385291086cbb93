//! Derived inventory arithmetic.
//!
//! Pure functions shared by the statistics service and the sales aggregator.
//! The invariant maintained everywhere:
//!
//! `current_inventory == previous_balance + production - sales`
//!
//! with a parallel kg-based line obeying the same equation.

use crate::errors::AppError;
use crate::models::FarmType;

/// Count values above this are treated as probable data-entry mistakes.
pub const MAX_COUNT_PER_DAY: i64 = 10_000;
/// Weight values above this are treated as probable data-entry mistakes.
pub const MAX_WEIGHT_PER_DAY: f64 = 150_000.0;

/// The fully derived statistic line (count and kg variants).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedLine {
    pub previous_balance: i64,
    pub previous_balance_kg: f64,
    pub production: i64,
    pub production_kg: f64,
    pub sales: i64,
    pub sales_kg: f64,
    pub current_inventory: i64,
    pub current_inventory_kg: f64,
}

/// Inputs as the user entered them. For STANDARD farms `production` is raw
/// output; for MISCELLANEOUS farms it is the declared end-of-day on-hand
/// stock.
#[derive(Debug, Clone, Copy)]
pub struct InventoryInput {
    pub previous_balance: i64,
    pub previous_balance_kg: f64,
    pub production: i64,
    pub production_kg: f64,
    pub sales: i64,
    pub sales_kg: f64,
}

/// Compute the derived line for a farm type.
///
/// MISCELLANEOUS farms force the previous balance to zero and back-compute
/// production as `declared + sales` so the standard equation still nets out
/// to exactly the declared value as current inventory.
pub fn derive(farm_type: FarmType, input: InventoryInput) -> DerivedLine {
    match farm_type {
        FarmType::Standard => DerivedLine {
            previous_balance: input.previous_balance,
            previous_balance_kg: input.previous_balance_kg,
            production: input.production,
            production_kg: input.production_kg,
            sales: input.sales,
            sales_kg: input.sales_kg,
            current_inventory: input.previous_balance + input.production - input.sales,
            current_inventory_kg: input.previous_balance_kg + input.production_kg
                - input.sales_kg,
        },
        FarmType::Miscellaneous => {
            let declared = input.production;
            let declared_kg = input.production_kg;
            DerivedLine {
                previous_balance: 0,
                previous_balance_kg: 0.0,
                production: declared + input.sales,
                production_kg: declared_kg + input.sales_kg,
                sales: input.sales,
                sales_kg: input.sales_kg,
                current_inventory: declared,
                current_inventory_kg: declared_kg,
            }
        }
    }
}

/// Recompute current inventory after the sales aggregator rewrites the sales
/// columns, keeping the stored previous balance and production.
pub fn recompute_current(
    previous_balance: i64,
    production: i64,
    sales: i64,
) -> i64 {
    previous_balance + production - sales
}

pub fn recompute_current_kg(
    previous_balance_kg: f64,
    production_kg: f64,
    sales_kg: f64,
) -> f64 {
    previous_balance_kg + production_kg - sales_kg
}

// ---------------------------------------------------------------------------
// Sanity bounds
// ---------------------------------------------------------------------------

/// Reject a per-product/day count outside sane bounds before any write is
/// attempted.
pub fn check_count(label: &str, value: i64) -> Result<(), AppError> {
    if value < 0 {
        return Err(AppError::Validation(format!("{label} cannot be negative")));
    }
    if value > MAX_COUNT_PER_DAY {
        return Err(AppError::Validation(format!(
            "{label} of {value} exceeds the daily limit of {MAX_COUNT_PER_DAY}; \
             please double-check the entry"
        )));
    }
    Ok(())
}

/// Reject a per-product/day weight outside sane bounds.
pub fn check_weight(label: &str, value: f64) -> Result<(), AppError> {
    if value < 0.0 {
        return Err(AppError::Validation(format!("{label} cannot be negative")));
    }
    if value > MAX_WEIGHT_PER_DAY {
        return Err(AppError::Validation(format!(
            "{label} of {value} exceeds the daily limit of {MAX_WEIGHT_PER_DAY}; \
             please double-check the entry"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(previous: i64, production: i64, sales: i64) -> InventoryInput {
        InventoryInput {
            previous_balance: previous,
            previous_balance_kg: previous as f64 / 2.0,
            production,
            production_kg: production as f64 / 2.0,
            sales,
            sales_kg: sales as f64 / 2.0,
        }
    }

    fn assert_invariant(line: &DerivedLine) {
        assert_eq!(
            line.current_inventory,
            line.previous_balance + line.production - line.sales
        );
        assert!(
            (line.current_inventory_kg
                - (line.previous_balance_kg + line.production_kg - line.sales_kg))
                .abs()
                < 1e-9
        );
    }

    #[test]
    fn test_standard_roll_forward() {
        let line = derive(FarmType::Standard, input(5, 20, 10));
        assert_eq!(line.previous_balance, 5);
        assert_eq!(line.production, 20);
        assert_eq!(line.sales, 10);
        assert_eq!(line.current_inventory, 15);
        assert_invariant(&line);
    }

    #[test]
    fn test_miscellaneous_netting() {
        // Declared on-hand 50, 12 already invoiced today: production is
        // back-computed so the equation still holds and current == declared.
        let line = derive(FarmType::Miscellaneous, input(999, 50, 12));
        assert_eq!(line.previous_balance, 0);
        assert_eq!(line.previous_balance_kg, 0.0);
        assert_eq!(line.production, 62);
        assert_eq!(line.current_inventory, 50);
        assert_invariant(&line);
    }

    #[test]
    fn test_recompute_after_sales_change() {
        assert_eq!(recompute_current(5, 20, 10), 15);
        assert_eq!(recompute_current(5, 20, 0), 25);
        assert!((recompute_current_kg(2.5, 10.0, 5.0) - 7.5).abs() < 1e-9);
    }

    #[test]
    fn test_sanity_bounds() {
        assert!(check_count("production", 10_000).is_ok());
        assert!(check_count("production", 10_001).is_err());
        assert!(check_count("production", -1).is_err());
        assert!(check_weight("production weight", 150_000.0).is_ok());
        assert!(check_weight("production weight", 150_000.1).is_err());
    }
}
