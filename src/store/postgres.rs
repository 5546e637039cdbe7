//! Postgres-backed category store.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use sqlx::postgres::{PgConnectOptions, PgPool, PgPoolOptions};
use sqlx::Connection;
use tracing::{error, info};

use crate::category::Category;
use crate::config::StoreConfig;
use crate::error::{Error, Result};

use super::{depth_sorted, CategoryStore, PersistOutcome, RetailerInfo};

/// Pooled connection to the external `categories`/`retailers` schema.
pub struct PgCategoryStore {
    pool: PgPool,
}

impl PgCategoryStore {
    /// Open the pool (min 2, max 10, acquire timeout 60s). Connection
    /// failure is fatal for the run.
    pub async fn connect(config: &StoreConfig) -> Result<Self> {
        let options = PgConnectOptions::new()
            .host(&config.host)
            .port(config.port)
            .database(&config.database)
            .username(&config.user)
            .password(&config.password);

        let pool = PgPoolOptions::new()
            .min_connections(2)
            .max_connections(10)
            .acquire_timeout(Duration::from_secs(60))
            .connect_with(options)
            .await
            .map_err(|e| Error::StoreConnect(e.to_string()))?;

        Ok(Self { pool })
    }
}

#[async_trait]
impl CategoryStore for PgCategoryStore {
    async fn persist(&self, categories: &[Category], retailer_id: i32) -> Result<PersistOutcome> {
        let mut outcome = PersistOutcome::default();
        let mut db_ids: HashMap<u32, i32> = HashMap::new();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;

        for category in depth_sorted(categories) {
            let parent_db_id = category
                .parent_local_id
                .and_then(|local| db_ids.get(&local))
                .copied();

            // Savepoint per record so one bad row cannot poison the
            // surrounding transaction.
            let mut savepoint = match tx.begin().await {
                Ok(sp) => sp,
                Err(e) => {
                    error!(error = %e, "failed to open savepoint");
                    outcome.errors += 1;
                    continue;
                }
            };

            let existing: std::result::Result<Option<i32>, sqlx::Error> = sqlx::query_scalar(
                "SELECT id FROM categories WHERE retailer_id = $1 AND url = $2",
            )
            .bind(retailer_id)
            .bind(&category.url)
            .fetch_optional(&mut *savepoint)
            .await;

            let written: std::result::Result<i32, sqlx::Error> = match existing {
                Ok(Some(id)) => sqlx::query(
                    "UPDATE categories SET name = $1, depth = $2, parent_id = $3 WHERE id = $4",
                )
                .bind(&category.name)
                .bind(category.depth as i32)
                .bind(parent_db_id)
                .bind(id)
                .execute(&mut *savepoint)
                .await
                .map(|_| {
                    outcome.updated += 1;
                    id
                }),
                Ok(None) => sqlx::query_scalar(
                    "INSERT INTO categories (name, url, parent_id, retailer_id, depth, enabled, created_at) \
                     VALUES ($1, $2, $3, $4, $5, false, now()) RETURNING id",
                )
                .bind(&category.name)
                .bind(&category.url)
                .bind(parent_db_id)
                .bind(retailer_id)
                .bind(category.depth as i32)
                .fetch_one(&mut *savepoint)
                .await
                .inspect(|_| outcome.saved += 1),
                Err(e) => Err(e),
            };

            match written {
                Ok(db_id) => {
                    if let Err(e) = savepoint.commit().await {
                        error!(url = %category.url, error = %e, "savepoint commit failed");
                        outcome.errors += 1;
                        continue;
                    }
                    db_ids.insert(category.local_id, db_id);
                }
                Err(e) => {
                    error!(
                        url = %category.url,
                        name = %category.name,
                        error = %e,
                        "category write failed"
                    );
                    outcome.errors += 1;
                    let _ = savepoint.rollback().await;
                }
            }
        }

        tx.commit()
            .await
            .map_err(|e| Error::StoreWrite(e.to_string()))?;

        info!(
            saved = outcome.saved,
            updated = outcome.updated,
            errors = outcome.errors,
            "persisted category tree"
        );
        Ok(outcome)
    }

    async fn get_retailer(&self, retailer_id: i32) -> Result<Option<RetailerInfo>> {
        let row: Option<(i32, String)> =
            sqlx::query_as("SELECT id, name FROM retailers WHERE id = $1")
                .bind(retailer_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(|e| Error::StoreWrite(e.to_string()))?;
        Ok(row.map(|(id, name)| RetailerInfo { id, name }))
    }

    async fn disconnect(&self) -> Result<()> {
        self.pool.close().await;
        Ok(())
    }
}
