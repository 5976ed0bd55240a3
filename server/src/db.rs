//! Postgres catalog for bloomd.
//!
//! Uses sqlx with runtime-checked queries to avoid needing a live DB at
//! compile time. Flowers are always read joined with their shop's name.

use async_trait::async_trait;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use crate::catalog::{Catalog, CatalogError};
use crate::types::{Flower, FlowerDraft, FlowerPatch, Shop};

/// Postgres error code for a foreign key violation.
const FOREIGN_KEY_VIOLATION: &str = "23503";

const FLOWER_COLUMNS: &str = r#"
    f.id, f.name, f.price, f.image, f.description,
    f.shop_id, s.name AS shop_name, f.date_added
"#;

const SHOP_COLUMNS: &str = "id, name, address, phone, hours, latitude, longitude";

pub struct PgCatalog {
    pool: PgPool,
}

impl PgCatalog {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the schema. Re-running against an existing schema is harmless.
    pub async fn migrate(&self) {
        info!("running migrations");
        if let Err(e) = sqlx::raw_sql(include_str!("../migrations/001_init.sql"))
            .execute(&self.pool)
            .await
        {
            info!("migration note (may already exist): {e}");
        }
    }

    /// Insert the starter catalog when there are no shops yet.
    pub async fn seed_if_empty(&self) -> Result<(), CatalogError> {
        let (shops,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM shops")
            .fetch_one(&self.pool)
            .await?;
        if shops > 0 {
            info!(shops, "catalog already has data, skipping seed");
            return Ok(());
        }

        let mut tx = self.pool.begin().await?;
        let mut flowers = 0usize;
        for (shop, drafts) in starter_catalog() {
            sqlx::query(
                r#"
                INSERT INTO shops (id, name, address, phone, hours, latitude, longitude)
                VALUES ($1, $2, $3, $4, $5, $6, $7)
                "#,
            )
            .bind(&shop.id)
            .bind(&shop.name)
            .bind(&shop.address)
            .bind(&shop.phone)
            .bind(&shop.hours)
            .bind(shop.latitude)
            .bind(shop.longitude)
            .execute(&mut *tx)
            .await?;

            for draft in drafts {
                sqlx::query(
                    r#"
                    INSERT INTO flowers (id, name, price, image, description, shop_id)
                    VALUES ($1, $2, $3, $4, $5, $6)
                    "#,
                )
                .bind(Uuid::new_v4().to_string())
                .bind(&draft.name)
                .bind(draft.price)
                .bind(&draft.image)
                .bind(&draft.description)
                .bind(&shop.id)
                .execute(&mut *tx)
                .await?;
                flowers += 1;
            }
        }
        tx.commit().await?;

        info!(flowers, "seeded starter catalog");
        Ok(())
    }
}

/// Map a write error, turning a dangling `shop_id` into `NotFound`.
fn write_error(e: sqlx::Error, shop_id: Option<&str>) -> CatalogError {
    if let sqlx::Error::Database(db) = &e {
        if db.code().as_deref() == Some(FOREIGN_KEY_VIOLATION) {
            return CatalogError::NotFound(format!("shop {}", shop_id.unwrap_or("?")));
        }
    }
    e.into()
}

#[async_trait]
impl Catalog for PgCatalog {
    async fn find_all(&self) -> Result<Vec<Flower>, CatalogError> {
        let rows: Vec<Flower> = sqlx::query_as(&format!(
            r#"
            SELECT {FLOWER_COLUMNS}
            FROM flowers f JOIN shops s ON s.id = f.shop_id
            ORDER BY f.date_added DESC
            "#
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_one(&self, id: &str) -> Result<Flower, CatalogError> {
        let row: Option<Flower> = sqlx::query_as(&format!(
            r#"
            SELECT {FLOWER_COLUMNS}
            FROM flowers f JOIN shops s ON s.id = f.shop_id
            WHERE f.id = $1
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CatalogError::NotFound(id.to_owned()))
    }

    async fn find_by_shop(&self, shop_id: &str) -> Result<Vec<Flower>, CatalogError> {
        let rows: Vec<Flower> = sqlx::query_as(&format!(
            r#"
            SELECT {FLOWER_COLUMNS}
            FROM flowers f JOIN shops s ON s.id = f.shop_id
            WHERE f.shop_id = $1
            ORDER BY f.date_added DESC
            "#
        ))
        .bind(shop_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn create(&self, draft: FlowerDraft) -> Result<Flower, CatalogError> {
        let row: Flower = sqlx::query_as(&format!(
            r#"
            WITH f AS (
                INSERT INTO flowers (id, name, price, image, description, shop_id)
                VALUES ($1, $2, $3, $4, $5, $6)
                RETURNING *
            )
            SELECT {FLOWER_COLUMNS}
            FROM f JOIN shops s ON s.id = f.shop_id
            "#
        ))
        .bind(Uuid::new_v4().to_string())
        .bind(&draft.name)
        .bind(draft.price)
        .bind(&draft.image)
        .bind(&draft.description)
        .bind(&draft.shop_id)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| write_error(e, Some(&draft.shop_id)))?;
        Ok(row)
    }

    async fn update(&self, id: &str, patch: FlowerPatch) -> Result<Flower, CatalogError> {
        let row: Option<Flower> = sqlx::query_as(&format!(
            r#"
            WITH f AS (
                UPDATE flowers SET
                    name = COALESCE($2, name),
                    price = COALESCE($3, price),
                    image = COALESCE($4, image),
                    description = COALESCE($5, description),
                    shop_id = COALESCE($6, shop_id),
                    updated_at = NOW()
                WHERE id = $1
                RETURNING *
            )
            SELECT {FLOWER_COLUMNS}
            FROM f JOIN shops s ON s.id = f.shop_id
            "#
        ))
        .bind(id)
        .bind(patch.name.as_deref())
        .bind(patch.price)
        .bind(patch.image.as_deref())
        .bind(patch.description.as_deref())
        .bind(patch.shop_id.as_deref())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| write_error(e, patch.shop_id.as_deref()))?;
        row.ok_or_else(|| CatalogError::NotFound(id.to_owned()))
    }

    async fn delete(&self, id: &str) -> Result<Flower, CatalogError> {
        let row: Option<Flower> = sqlx::query_as(&format!(
            r#"
            WITH f AS (
                DELETE FROM flowers WHERE id = $1
                RETURNING *
            )
            SELECT {FLOWER_COLUMNS}
            FROM f JOIN shops s ON s.id = f.shop_id
            "#
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.ok_or_else(|| CatalogError::NotFound(id.to_owned()))
    }

    async fn find_shops(&self) -> Result<Vec<Shop>, CatalogError> {
        let rows: Vec<Shop> = sqlx::query_as(&format!(
            "SELECT {SHOP_COLUMNS} FROM shops ORDER BY created_at DESC, name"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn find_shop(&self, id: &str) -> Result<Shop, CatalogError> {
        let row: Option<Shop> =
            sqlx::query_as(&format!("SELECT {SHOP_COLUMNS} FROM shops WHERE id = $1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.ok_or_else(|| CatalogError::NotFound(format!("shop {id}")))
    }
}

// ═══════════════════════════════════════════════════════════════
// Starter data
// ═══════════════════════════════════════════════════════════════

fn bouquet(name: &str, price: f64, image: &str, description: &str) -> FlowerDraft {
    FlowerDraft {
        name: name.into(),
        price,
        image: image.into(),
        description: description.into(),
        shop_id: String::new(),
    }
}

/// Shops and their bouquets loaded into an empty catalog.
/// The drafts' `shop_id` is filled in by the caller.
pub fn starter_catalog() -> Vec<(Shop, Vec<FlowerDraft>)> {
    vec![
        (
            Shop {
                id: "flowery-fragrant".into(),
                name: "Flowery Fragrant".into(),
                address: "123 Garden Street, Bloomville".into(),
                phone: "+1 (555) 123-4567".into(),
                hours: "9:00 AM - 8:00 PM".into(),
                latitude: 30.5234,
                longitude: 50.4501,
            },
            vec![
                bouquet(
                    "Red Rose Bouquet",
                    25.99,
                    "/images/rose-bouquet.jpg",
                    "Beautiful red roses perfect for any romantic occasion",
                ),
                bouquet(
                    "White Lily Elegance",
                    32.99,
                    "/images/lily-bouquet.jpg",
                    "Elegant white lilies symbolizing purity and rebirth",
                ),
                bouquet(
                    "Wild Daisy Bunch",
                    19.99,
                    "/images/daisy-bouquet.jpg",
                    "Wild daisies perfect for casual occasions",
                ),
            ],
        ),
        (
            Shop {
                id: "bloomwell".into(),
                name: "Bloomwell".into(),
                address: "456 Rose Avenue, Petalton".into(),
                phone: "+1 (555) 234-5678".into(),
                hours: "8:00 AM - 9:00 PM".into(),
                latitude: 30.5434,
                longitude: 50.4601,
            },
            vec![
                bouquet(
                    "Sunflower Sunshine",
                    22.99,
                    "/images/sunflower-bouquet.jpg",
                    "Bright sunflowers to light up any room",
                ),
                bouquet(
                    "Tulip Rainbow",
                    28.99,
                    "/images/tulip-bouquet.jpg",
                    "Colorful tulips in a cheerful mix",
                ),
            ],
        ),
        (
            Shop {
                id: "petals-paradise".into(),
                name: "Petals Paradise".into(),
                address: "789 Flower Road, Gardenville".into(),
                phone: "+1 (555) 345-6789".into(),
                hours: "10:00 AM - 7:00 PM".into(),
                latitude: 30.5034,
                longitude: 50.4401,
            },
            vec![bouquet(
                "Orchid Delight",
                39.99,
                "/images/orchid-bouquet.jpg",
                "Exotic orchids for a touch of luxury",
            )],
        ),
    ]
}
