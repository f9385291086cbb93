//! Farm and product catalog administration.
//!
//! Farms and products are admin-managed reference data: low-churn, always
//! edited online, cached in memory with a full refetch after every write.
//! Deleting a farm never cascades into historical statistics or invoices;
//! those rows keep a dangling farm reference.

use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

use crate::api::{Filter, RemoteStore};
use crate::errors::AppError;
use crate::models::{
    self, default_products, Farm, FarmType, Product, ProductUnit, TABLE_FARMS, TABLE_PRODUCTS,
};

/// Admin-entered farm fields.
#[derive(Debug, Clone)]
pub struct FarmInput {
    pub name: String,
    pub farm_type: FarmType,
    pub product_ids: Vec<String>,
}

pub struct FarmStore {
    store: Arc<dyn RemoteStore>,
    cache: Mutex<Vec<Farm>>,
}

impl FarmStore {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Vec::new()),
        }
    }

    pub fn list(&self) -> Vec<Farm> {
        match self.cache.lock() {
            Ok(cache) => cache.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<Farm> {
        self.list().into_iter().find(|f| f.id == id)
    }

    pub async fn refetch(&self) -> Result<(), AppError> {
        let rows = self.store.select(TABLE_FARMS, &Filter::new()).await?;
        let parsed: Vec<Farm> = models::parse_rows(rows);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = parsed;
        }
        Ok(())
    }

    pub async fn create(&self, input: FarmInput) -> Result<Farm, AppError> {
        let name = input.name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("farm name is required".into()));
        }
        let farm = Farm {
            id: Uuid::new_v4().to_string(),
            name,
            farm_type: input.farm_type,
            is_active: true,
            product_ids: input.product_ids,
        };
        let row = serde_json::to_value(&farm)
            .map_err(|e| AppError::Validation(format!("unserializable farm: {e}")))?;
        self.store
            .insert(TABLE_FARMS, std::slice::from_ref(&row))
            .await?;
        info!(farm_id = %farm.id, "farm created");
        self.refetch().await?;
        Ok(farm)
    }

    pub async fn update(&self, id: &str, input: FarmInput) -> Result<(), AppError> {
        let patch = serde_json::json!({
            "name": input.name.trim(),
            "type": input.farm_type,
            "product_ids": input.product_ids,
        });
        self.store.update(TABLE_FARMS, id, &patch).await?;
        self.refetch().await?;
        Ok(())
    }

    pub async fn set_active(&self, id: &str, is_active: bool) -> Result<(), AppError> {
        let patch = serde_json::json!({ "is_active": is_active });
        self.store.update(TABLE_FARMS, id, &patch).await?;
        self.refetch().await?;
        Ok(())
    }

    /// Delete the farm row only; history stays behind.
    pub async fn delete(&self, id: &str) -> Result<(), AppError> {
        self.store.delete(TABLE_FARMS, id).await?;
        info!(farm_id = %id, "farm deleted");
        self.refetch().await?;
        Ok(())
    }
}

pub struct ProductStore {
    store: Arc<dyn RemoteStore>,
    cache: Mutex<Vec<Product>>,
}

impl ProductStore {
    pub fn new(store: Arc<dyn RemoteStore>) -> Self {
        Self {
            store,
            cache: Mutex::new(Vec::new()),
        }
    }

    pub fn list(&self) -> Vec<Product> {
        match self.cache.lock() {
            Ok(cache) => cache.clone(),
            Err(_) => Vec::new(),
        }
    }

    pub fn find(&self, id: &str) -> Option<Product> {
        self.list().into_iter().find(|p| p.id == id)
    }

    pub async fn refetch(&self) -> Result<(), AppError> {
        let rows = self.store.select(TABLE_PRODUCTS, &Filter::new()).await?;
        let parsed: Vec<Product> = models::parse_rows(rows);
        if let Ok(mut cache) = self.cache.lock() {
            *cache = parsed;
        }
        Ok(())
    }

    /// Seed the two well-known default products, inserting only the ones
    /// that are missing. Safe to run on every startup.
    pub async fn seed_defaults(&self) -> Result<usize, AppError> {
        let mut seeded = 0;
        for product in default_products() {
            let existing = self
                .store
                .select(TABLE_PRODUCTS, &Filter::new().eq("id", &product.id))
                .await?;
            if !existing.is_empty() {
                continue;
            }
            let row = serde_json::to_value(&product)
                .map_err(|e| AppError::Validation(format!("unserializable product: {e}")))?;
            self.store
                .insert(TABLE_PRODUCTS, std::slice::from_ref(&row))
                .await?;
            info!(product_id = %product.id, "default product seeded");
            seeded += 1;
        }
        if seeded > 0 {
            self.refetch().await?;
        }
        Ok(seeded)
    }

    /// Add a custom product to the catalog. Products are never physically
    /// deleted; stale ones are simply left out of farm assignments.
    pub async fn create_custom(
        &self,
        name: &str,
        unit: ProductUnit,
        has_weight_unit: bool,
    ) -> Result<Product, AppError> {
        let name = name.trim().to_string();
        if name.is_empty() {
            return Err(AppError::Validation("product name is required".into()));
        }
        let product = Product {
            id: Uuid::new_v4().to_string(),
            name,
            unit,
            has_weight_unit,
            is_default: false,
            is_custom: true,
        };
        let row = serde_json::to_value(&product)
            .map_err(|e| AppError::Validation(format!("unserializable product: {e}")))?;
        self.store
            .insert(TABLE_PRODUCTS, std::slice::from_ref(&row))
            .await?;
        self.refetch().await?;
        Ok(product)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::testing::MemoryStore;
    use crate::models::TABLE_STATISTICS;

    fn input(name: &str, farm_type: FarmType) -> FarmInput {
        FarmInput {
            name: name.into(),
            farm_type,
            product_ids: vec![models::DEFAULT_PRODUCT_EGGS_ID.into()],
        }
    }

    #[tokio::test]
    async fn test_farm_crud_and_cache_refetch() {
        let store = Arc::new(MemoryStore::new());
        let farms = FarmStore::new(store.clone());

        let farm = farms
            .create(input("North Shed", FarmType::Standard))
            .await
            .unwrap();
        assert_eq!(farms.list().len(), 1);

        farms
            .update(&farm.id, input("North Shed A", FarmType::Standard))
            .await
            .unwrap();
        assert_eq!(farms.find(&farm.id).unwrap().name, "North Shed A");

        farms.set_active(&farm.id, false).await.unwrap();
        assert!(!farms.find(&farm.id).unwrap().is_active);
    }

    #[tokio::test]
    async fn test_farm_delete_leaves_history_dangling() {
        let store = Arc::new(MemoryStore::new());
        let farms = FarmStore::new(store.clone());
        let farm = farms
            .create(input("North Shed", FarmType::Standard))
            .await
            .unwrap();

        store.seed(
            TABLE_STATISTICS,
            vec![serde_json::json!({ "id": "stat-1", "farm_id": farm.id })],
        );

        farms.delete(&farm.id).await.unwrap();
        assert!(farms.list().is_empty());
        // Historical statistics keep their farm reference.
        assert_eq!(store.rows(TABLE_STATISTICS).len(), 1);
    }

    #[tokio::test]
    async fn test_seed_defaults_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        let products = ProductStore::new(store.clone());

        assert_eq!(products.seed_defaults().await.unwrap(), 2);
        assert_eq!(products.seed_defaults().await.unwrap(), 0);
        assert_eq!(store.rows(TABLE_PRODUCTS).len(), 2);
        assert!(products.find(models::DEFAULT_PRODUCT_EGGS_ID).is_some());
        assert!(products.find(models::DEFAULT_PRODUCT_MIXED_ID).is_some());
    }

    #[tokio::test]
    async fn test_create_custom_product() {
        let store = Arc::new(MemoryStore::new());
        let products = ProductStore::new(store);

        let product = products
            .create_custom("Culled Hens", ProductUnit::Count, false)
            .await
            .unwrap();
        assert!(product.is_custom);
        assert!(!product.is_default);
        assert!(products.find(&product.id).is_some());

        assert!(matches!(
            products.create_custom("  ", ProductUnit::Count, false).await,
            Err(AppError::Validation(_))
        ));
    }
}
