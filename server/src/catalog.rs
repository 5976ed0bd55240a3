//! Catalog service boundary.
//!
//! The gateway never touches storage directly; it calls a [`Catalog`] and
//! broadcasts whatever snapshot comes back. Postgres lives in `db.rs`;
//! [`MemoryCatalog`] backs `CATALOG_BACKEND=memory` and the tests.

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;
use uuid::Uuid;

use crate::types::{Flower, FlowerDraft, FlowerPatch, Shop};

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum CatalogError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("catalog unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for CatalogError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::RowNotFound => CatalogError::NotFound("row".into()),
            other => CatalogError::Unavailable(other.to_string()),
        }
    }
}

/// Owner of flower persistence.
#[async_trait]
pub trait Catalog: Send + Sync {
    /// All flowers, newest first.
    async fn find_all(&self) -> Result<Vec<Flower>, CatalogError>;

    async fn find_one(&self, id: &str) -> Result<Flower, CatalogError>;

    /// Flowers sold by one shop, newest first.
    async fn find_by_shop(&self, shop_id: &str) -> Result<Vec<Flower>, CatalogError>;

    async fn create(&self, draft: FlowerDraft) -> Result<Flower, CatalogError>;

    async fn update(&self, id: &str, patch: FlowerPatch) -> Result<Flower, CatalogError>;

    /// Returns the removed flower.
    async fn delete(&self, id: &str) -> Result<Flower, CatalogError>;

    /// All shops, newest first.
    async fn find_shops(&self) -> Result<Vec<Shop>, CatalogError>;

    async fn find_shop(&self, id: &str) -> Result<Shop, CatalogError>;
}

// ═══════════════════════════════════════════════════════════════
// In-memory catalog
// ═══════════════════════════════════════════════════════════════

#[derive(Debug, Default)]
struct MemoryInner {
    /// Insertion order.
    shops: Vec<Shop>,
    flowers: Vec<Flower>,
    /// Set by tests to simulate a downstream outage.
    unavailable: Option<String>,
}

impl MemoryInner {
    fn shop(&self, id: &str) -> Option<&Shop> {
        self.shops.iter().find(|s| s.id == id)
    }
}

/// Process-local catalog with the same semantics as the Postgres one.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    inner: RwLock<MemoryInner>,
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog pre-filled with the starter shops and bouquets.
    pub fn seeded() -> Self {
        let catalog = Self::new();
        for (shop, flowers) in crate::db::starter_catalog() {
            let shop_id = shop.id.clone();
            catalog.add_shop(shop);
            for draft in flowers {
                catalog.insert(FlowerDraft {
                    shop_id: shop_id.clone(),
                    ..draft
                });
            }
        }
        catalog
    }

    /// Insert or replace a shop.
    pub fn add_shop(&self, shop: Shop) {
        let mut inner = self.inner.write();
        inner.shops.retain(|s| s.id != shop.id);
        inner.shops.push(shop);
    }

    /// Make every call fail with `Unavailable(reason)`, or clear with `None`.
    #[cfg(test)]
    pub fn set_unavailable(&self, reason: Option<&str>) {
        self.inner.write().unavailable = reason.map(str::to_owned);
    }

    fn check(&self) -> Result<(), CatalogError> {
        match &self.inner.read().unavailable {
            Some(reason) => Err(CatalogError::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn insert(&self, draft: FlowerDraft) -> Flower {
        let mut inner = self.inner.write();
        let shop_name = inner.shop(&draft.shop_id).map(|s| s.name.clone());
        let flower = Flower {
            id: Uuid::new_v4().to_string(),
            name: draft.name,
            price: draft.price,
            image: draft.image,
            description: draft.description,
            shop_id: draft.shop_id,
            shop_name,
            date_added: Utc::now(),
        };
        inner.flowers.push(flower.clone());
        flower
    }

    fn newest_first(mut flowers: Vec<Flower>) -> Vec<Flower> {
        // Stable sort keeps insertion order for equal timestamps; reverse
        // that too so the last inserted comes first.
        flowers.reverse();
        flowers.sort_by(|a, b| b.date_added.cmp(&a.date_added));
        flowers
    }
}

#[async_trait]
impl Catalog for MemoryCatalog {
    async fn find_all(&self) -> Result<Vec<Flower>, CatalogError> {
        self.check()?;
        Ok(Self::newest_first(self.inner.read().flowers.clone()))
    }

    async fn find_one(&self, id: &str) -> Result<Flower, CatalogError> {
        self.check()?;
        self.inner
            .read()
            .flowers
            .iter()
            .find(|f| f.id == id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(id.to_owned()))
    }

    async fn find_by_shop(&self, shop_id: &str) -> Result<Vec<Flower>, CatalogError> {
        self.check()?;
        let flowers = self
            .inner
            .read()
            .flowers
            .iter()
            .filter(|f| f.shop_id == shop_id)
            .cloned()
            .collect();
        Ok(Self::newest_first(flowers))
    }

    async fn create(&self, draft: FlowerDraft) -> Result<Flower, CatalogError> {
        self.check()?;
        if self.inner.read().shop(&draft.shop_id).is_none() {
            return Err(CatalogError::NotFound(format!("shop {}", draft.shop_id)));
        }
        Ok(self.insert(draft))
    }

    async fn update(&self, id: &str, patch: FlowerPatch) -> Result<Flower, CatalogError> {
        self.check()?;
        let mut inner = self.inner.write();
        if let Some(shop_id) = &patch.shop_id {
            if inner.shop(shop_id).is_none() {
                return Err(CatalogError::NotFound(format!("shop {shop_id}")));
            }
        }
        let shop_name = patch
            .shop_id
            .as_ref()
            .and_then(|s| inner.shop(s))
            .map(|s| s.name.clone());
        let flower = inner
            .flowers
            .iter_mut()
            .find(|f| f.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_owned()))?;
        patch.apply(flower);
        if shop_name.is_some() {
            flower.shop_name = shop_name;
        }
        Ok(flower.clone())
    }

    async fn delete(&self, id: &str) -> Result<Flower, CatalogError> {
        self.check()?;
        let mut inner = self.inner.write();
        let pos = inner
            .flowers
            .iter()
            .position(|f| f.id == id)
            .ok_or_else(|| CatalogError::NotFound(id.to_owned()))?;
        Ok(inner.flowers.remove(pos))
    }

    async fn find_shops(&self) -> Result<Vec<Shop>, CatalogError> {
        self.check()?;
        Ok(self.inner.read().shops.iter().rev().cloned().collect())
    }

    async fn find_shop(&self, id: &str) -> Result<Shop, CatalogError> {
        self.check()?;
        self.inner
            .read()
            .shop(id)
            .cloned()
            .ok_or_else(|| CatalogError::NotFound(format!("shop {id}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shop(id: &str) -> Shop {
        Shop {
            id: id.into(),
            name: format!("Shop {id}"),
            address: "1 Garden Street".into(),
            phone: "+1 555 0100".into(),
            hours: "9-5".into(),
            latitude: 30.5,
            longitude: 50.4,
        }
    }

    fn draft(name: &str, shop_id: &str) -> FlowerDraft {
        FlowerDraft {
            name: name.into(),
            price: 19.99,
            image: "/images/daisy.jpg".into(),
            description: "fresh".into(),
            shop_id: shop_id.into(),
        }
    }

    #[tokio::test]
    async fn test_create_and_find() {
        let catalog = MemoryCatalog::new();
        catalog.add_shop(shop("s1"));

        let created = catalog.create(draft("Daisy", "s1")).await.unwrap();
        assert_eq!(created.shop_name.as_deref(), Some("Shop s1"));
        assert_eq!(catalog.find_one(&created.id).await.unwrap(), created);
        assert_eq!(catalog.find_all().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_create_unknown_shop_is_not_found() {
        let catalog = MemoryCatalog::new();
        let err = catalog.create(draft("Daisy", "nope")).await.unwrap_err();
        assert_eq!(err, CatalogError::NotFound("shop nope".into()));
        assert!(catalog.find_all().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_find_all_newest_first() {
        let catalog = MemoryCatalog::new();
        catalog.add_shop(shop("s1"));
        catalog.create(draft("First", "s1")).await.unwrap();
        catalog.create(draft("Second", "s1")).await.unwrap();

        let names: Vec<_> = catalog
            .find_all()
            .await
            .unwrap()
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec!["Second", "First"]);
    }

    #[tokio::test]
    async fn test_find_by_shop() {
        let catalog = MemoryCatalog::new();
        catalog.add_shop(shop("s1"));
        catalog.add_shop(shop("s2"));
        catalog.create(draft("Rose", "s1")).await.unwrap();
        catalog.create(draft("Lily", "s2")).await.unwrap();

        let s2 = catalog.find_by_shop("s2").await.unwrap();
        assert_eq!(s2.len(), 1);
        assert_eq!(s2[0].name, "Lily");
        assert!(catalog.find_by_shop("s3").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_and_delete_missing() {
        let catalog = MemoryCatalog::new();
        assert_eq!(
            catalog.update("x", FlowerPatch::default()).await.unwrap_err(),
            CatalogError::NotFound("x".into())
        );
        assert_eq!(
            catalog.delete("x").await.unwrap_err(),
            CatalogError::NotFound("x".into())
        );
    }

    #[tokio::test]
    async fn test_update_moves_shop() {
        let catalog = MemoryCatalog::new();
        catalog.add_shop(shop("s1"));
        catalog.add_shop(shop("s2"));
        let created = catalog.create(draft("Rose", "s1")).await.unwrap();

        let updated = catalog
            .update(
                &created.id,
                FlowerPatch {
                    shop_id: Some("s2".into()),
                    price: Some(5.0),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(updated.shop_id, "s2");
        assert_eq!(updated.shop_name.as_deref(), Some("Shop s2"));
        assert_eq!(updated.price, 5.0);
    }

    #[tokio::test]
    async fn test_find_shops_newest_first() {
        let catalog = MemoryCatalog::new();
        catalog.add_shop(shop("s1"));
        catalog.add_shop(shop("s2"));

        let ids: Vec<_> = catalog
            .find_shops()
            .await
            .unwrap()
            .into_iter()
            .map(|s| s.id)
            .collect();
        assert_eq!(ids, vec!["s2", "s1"]);

        assert_eq!(catalog.find_shop("s1").await.unwrap().name, "Shop s1");
        assert_eq!(
            catalog.find_shop("s9").await.unwrap_err(),
            CatalogError::NotFound("shop s9".into())
        );
    }

    #[tokio::test]
    async fn test_unavailable() {
        let catalog = MemoryCatalog::new();
        catalog.set_unavailable(Some("db down"));
        assert_eq!(
            catalog.find_all().await.unwrap_err(),
            CatalogError::Unavailable("db down".into())
        );
        catalog.set_unavailable(None);
        assert!(catalog.find_all().await.is_ok());
    }

    #[tokio::test]
    async fn test_seeded_has_starter_flowers() {
        let catalog = MemoryCatalog::seeded();
        let all = catalog.find_all().await.unwrap();
        assert!(!all.is_empty());
        assert!(all.iter().all(|f| f.shop_name.is_some()));
    }
}
