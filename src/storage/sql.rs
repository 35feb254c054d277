//! SQL durable tier (SQLite or MySQL through the sqlx `Any` driver).
//!
//! ```sql
//! CREATE TABLE product_stats (
//!   product_id VARCHAR(255) PRIMARY KEY,
//!   total_views BIGINT, clicks BIGINT, organic_clicks BIGINT,
//!   total_carts BIGINT, total_orders BIGINT, total_boost_score DOUBLE,
//!   created_at BIGINT, updated_at BIGINT          -- epoch ms
//! );
//! CREATE TABLE product_boosts (id, product_id, boost_score, status, start_date, end_date);
//! CREATE TABLE products (product_id, created_at, discount_percentage, discount_start, discount_end);
//! ```
//!
//! `product_stats` is written only by the flush path (plus row creation and
//! soft clears). A flush batch larger than one chunk is still one
//! transaction: either every row lands or none does. The other two tables belong to the catalog and boost
//! collaborators; [`SqlStatsStore::upsert_product`] and
//! [`SqlStatsStore::insert_boost`] exist for them and for tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::any::{AnyPoolOptions, AnyRow};
use sqlx::{Any, AnyPool, Row, Transaction};
use std::sync::Once;
use std::time::Duration;

use super::traits::{BatchWriteResult, DurableStore, StorageError};
use crate::catalog::{datetime_from_millis, Boost, BoostStatus, DiscountWindow, DurableStatRecord, ProductRankingInfo};
use crate::counters::Metric;
use crate::resilience::retry::{retry, RetryConfig};

// SQLx `Any` driver requires runtime installation
static INSTALL_DRIVERS: Once = Once::new();

fn install_drivers() {
    INSTALL_DRIVERS.call_once(|| {
        sqlx::any::install_default_drivers();
    });
}

/// MySQL max_allowed_packet is typically 16MB; 500 rows stays well inside it
const CHUNK_SIZE: usize = 500;

const STATS_COLUMNS: &str =
    "product_id, total_views, clicks, organic_clicks, total_carts, total_orders, total_boost_score, created_at, updated_at";

fn sql_err(e: sqlx::Error) -> StorageError {
    StorageError::Backend(e.to_string())
}

/// Read a text column, tolerating drivers that hand TEXT back as bytes.
fn get_text(row: &AnyRow, column: &str) -> Result<String, StorageError> {
    row.try_get::<String, _>(column)
        .or_else(|_| {
            row.try_get::<Vec<u8>, _>(column)
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
        })
        .map_err(sql_err)
}

fn get_count(row: &AnyRow, column: &str) -> Result<u64, StorageError> {
    let value: i64 = row.try_get(column).map_err(sql_err)?;
    Ok(value.max(0) as u64)
}

fn row_to_record(row: &AnyRow) -> Result<DurableStatRecord, StorageError> {
    Ok(DurableStatRecord {
        product_id: get_text(row, "product_id")?,
        total_views: get_count(row, "total_views")?,
        clicks: get_count(row, "clicks")?,
        organic_clicks: get_count(row, "organic_clicks")?,
        total_carts: get_count(row, "total_carts")?,
        total_orders: get_count(row, "total_orders")?,
        total_boost_score: row.try_get("total_boost_score").map_err(sql_err)?,
        created_at: datetime_from_millis(row.try_get("created_at").map_err(sql_err)?),
        updated_at: datetime_from_millis(row.try_get("updated_at").map_err(sql_err)?),
    })
}

pub struct SqlStatsStore {
    pool: AnyPool,
    is_sqlite: bool,
}

impl SqlStatsStore {
    /// Connect with startup-mode retry and create the schema.
    pub async fn new(connection_string: &str) -> Result<Self, StorageError> {
        install_drivers();

        let is_sqlite = connection_string.starts_with("sqlite:");

        let pool = retry("sql_connect", &RetryConfig::startup(), || async {
            AnyPoolOptions::new()
                .max_connections(if is_sqlite { 1 } else { 20 })
                .acquire_timeout(Duration::from_secs(10))
                .idle_timeout(Duration::from_secs(300))
                .connect(connection_string)
                .await
                .map_err(sql_err)
        })
        .await?;

        let store = Self { pool, is_sqlite };

        if is_sqlite {
            store.enable_wal_mode().await?;
        }

        store.init_schema().await?;
        Ok(store)
    }

    pub fn pool(&self) -> AnyPool {
        self.pool.clone()
    }

    async fn enable_wal_mode(&self) -> Result<(), StorageError> {
        sqlx::query("PRAGMA journal_mode = WAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to enable WAL mode: {}", e)))?;

        sqlx::query("PRAGMA synchronous = NORMAL")
            .execute(&self.pool)
            .await
            .map_err(|e| StorageError::Backend(format!("Failed to set synchronous mode: {}", e)))?;

        Ok(())
    }

    async fn init_schema(&self) -> Result<(), StorageError> {
        let statements: [&str; 3] = if self.is_sqlite {
            [
                r#"
                CREATE TABLE IF NOT EXISTS product_stats (
                    product_id TEXT PRIMARY KEY,
                    total_views INTEGER NOT NULL DEFAULT 0,
                    clicks INTEGER NOT NULL DEFAULT 0,
                    organic_clicks INTEGER NOT NULL DEFAULT 0,
                    total_carts INTEGER NOT NULL DEFAULT 0,
                    total_orders INTEGER NOT NULL DEFAULT 0,
                    total_boost_score REAL NOT NULL DEFAULT 0,
                    created_at INTEGER NOT NULL,
                    updated_at INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS product_boosts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    product_id TEXT NOT NULL,
                    boost_score REAL NOT NULL DEFAULT 0,
                    status TEXT NOT NULL,
                    start_date INTEGER NOT NULL,
                    end_date INTEGER NOT NULL
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS products (
                    product_id TEXT PRIMARY KEY,
                    created_at INTEGER NOT NULL,
                    discount_percentage REAL,
                    discount_start INTEGER,
                    discount_end INTEGER
                )
                "#,
            ]
        } else {
            [
                r#"
                CREATE TABLE IF NOT EXISTS product_stats (
                    product_id VARCHAR(255) PRIMARY KEY,
                    total_views BIGINT NOT NULL DEFAULT 0,
                    clicks BIGINT NOT NULL DEFAULT 0,
                    organic_clicks BIGINT NOT NULL DEFAULT 0,
                    total_carts BIGINT NOT NULL DEFAULT 0,
                    total_orders BIGINT NOT NULL DEFAULT 0,
                    total_boost_score DOUBLE NOT NULL DEFAULT 0,
                    created_at BIGINT NOT NULL,
                    updated_at BIGINT NOT NULL,
                    INDEX idx_views (total_views),
                    INDEX idx_orders (total_orders)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS product_boosts (
                    id BIGINT AUTO_INCREMENT PRIMARY KEY,
                    product_id VARCHAR(255) NOT NULL,
                    boost_score DOUBLE NOT NULL DEFAULT 0,
                    status VARCHAR(16) NOT NULL,
                    start_date BIGINT NOT NULL,
                    end_date BIGINT NOT NULL,
                    INDEX idx_boost_product (product_id, status)
                )
                "#,
                r#"
                CREATE TABLE IF NOT EXISTS products (
                    product_id VARCHAR(255) PRIMARY KEY,
                    created_at BIGINT NOT NULL,
                    discount_percentage DOUBLE NULL,
                    discount_start BIGINT NULL,
                    discount_end BIGINT NULL
                )
                "#,
            ]
        };

        for sql in statements {
            retry("sql_init_schema", &RetryConfig::startup(), || async {
                sqlx::query(sql).execute(&self.pool).await.map_err(sql_err)
            })
            .await?;
        }

        Ok(())
    }

    async fn upsert_chunk(
        &self,
        tx: &mut Transaction<'_, Any>,
        chunk: &[DurableStatRecord],
    ) -> Result<usize, StorageError> {
        let placeholders = vec!["(?, ?, ?, ?, ?, ?, ?, ?, ?)"; chunk.len()].join(", ");

        let sql = if self.is_sqlite {
            format!(
                "INSERT INTO product_stats ({}) VALUES {} \
                 ON CONFLICT(product_id) DO UPDATE SET \
                    total_views = excluded.total_views, \
                    clicks = excluded.clicks, \
                    organic_clicks = excluded.organic_clicks, \
                    total_carts = excluded.total_carts, \
                    total_orders = excluded.total_orders, \
                    total_boost_score = excluded.total_boost_score, \
                    updated_at = excluded.updated_at",
                STATS_COLUMNS, placeholders
            )
        } else {
            format!(
                "INSERT INTO product_stats ({}) VALUES {} \
                 ON DUPLICATE KEY UPDATE \
                    total_views = VALUES(total_views), \
                    clicks = VALUES(clicks), \
                    organic_clicks = VALUES(organic_clicks), \
                    total_carts = VALUES(total_carts), \
                    total_orders = VALUES(total_orders), \
                    total_boost_score = VALUES(total_boost_score), \
                    updated_at = VALUES(updated_at)",
                STATS_COLUMNS, placeholders
            )
        };

        let mut query = sqlx::query(&sql);
        for row in chunk {
            query = query
                .bind(row.product_id.clone())
                .bind(row.total_views as i64)
                .bind(row.clicks as i64)
                .bind(row.organic_clicks as i64)
                .bind(row.total_carts as i64)
                .bind(row.total_orders as i64)
                .bind(row.total_boost_score)
                .bind(row.created_at.timestamp_millis())
                .bind(row.updated_at.timestamp_millis());
        }
        query.execute(&mut **tx).await.map_err(sql_err)?;

        Ok(chunk.len())
    }

    /// Every chunk in one transaction. Dropping `tx` on an error rolls back
    /// the chunks already sent.
    async fn upsert_all(&self, rows: &[DurableStatRecord]) -> Result<usize, StorageError> {
        let mut tx = self.pool.begin().await.map_err(sql_err)?;
        let mut written = 0usize;
        for chunk in rows.chunks(CHUNK_SIZE) {
            written += self.upsert_chunk(&mut tx, chunk).await?;
        }
        tx.commit().await.map_err(sql_err)?;
        Ok(written)
    }

    /// Count how many of `ids` have a stats row.
    async fn verify_ids(&self, ids: &[&str]) -> Result<usize, StorageError> {
        let mut found = 0usize;
        for chunk in ids.chunks(CHUNK_SIZE) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!("SELECT COUNT(*) as cnt FROM product_stats WHERE product_id IN ({})", placeholders);
            let mut query = sqlx::query(&sql);
            for id in chunk {
                query = query.bind(id.to_string());
            }
            let row = query.fetch_one(&self.pool).await.map_err(sql_err)?;
            let count: i64 = row.try_get("cnt").map_err(sql_err)?;
            found += count as usize;
        }
        Ok(found)
    }

    /// Insert or replace a product's ranking attributes.
    pub async fn upsert_product(&self, info: &ProductRankingInfo) -> Result<(), StorageError> {
        let sql = if self.is_sqlite {
            "INSERT INTO products (product_id, created_at, discount_percentage, discount_start, discount_end) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(product_id) DO UPDATE SET \
                created_at = excluded.created_at, \
                discount_percentage = excluded.discount_percentage, \
                discount_start = excluded.discount_start, \
                discount_end = excluded.discount_end"
        } else {
            "INSERT INTO products (product_id, created_at, discount_percentage, discount_start, discount_end) \
             VALUES (?, ?, ?, ?, ?) \
             ON DUPLICATE KEY UPDATE \
                created_at = VALUES(created_at), \
                discount_percentage = VALUES(discount_percentage), \
                discount_start = VALUES(discount_start), \
                discount_end = VALUES(discount_end)"
        };

        sqlx::query(sql)
            .bind(info.product_id.clone())
            .bind(info.created_at.timestamp_millis())
            .bind(info.discount.map(|d| d.percentage))
            .bind(info.discount.map(|d| d.start.timestamp_millis()))
            .bind(info.discount.map(|d| d.end.timestamp_millis()))
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(())
    }

    pub async fn insert_boost(&self, boost: &Boost) -> Result<(), StorageError> {
        sqlx::query(
            "INSERT INTO product_boosts (product_id, boost_score, status, start_date, end_date) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(boost.product_id.clone())
        .bind(boost.boost_score)
        .bind(boost.status.as_str().to_string())
        .bind(boost.start_date.timestamp_millis())
        .bind(boost.end_date.timestamp_millis())
        .execute(&self.pool)
        .await
        .map_err(sql_err)?;
        Ok(())
    }

    /// Set the status of every boost for a product (boost lifecycle hook).
    pub async fn set_boost_status(&self, product_id: &str, status: BoostStatus) -> Result<u64, StorageError> {
        let result = sqlx::query("UPDATE product_boosts SET status = ? WHERE product_id = ?")
            .bind(status.as_str().to_string())
            .bind(product_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_err)?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl DurableStore for SqlStatsStore {
    async fn upsert_stats_batch(&self, rows: &[DurableStatRecord]) -> Result<BatchWriteResult, StorageError> {
        if rows.is_empty() {
            return Ok(BatchWriteResult::empty());
        }

        let batch_id = uuid::Uuid::new_v4().to_string();
        let written = retry("sql_upsert_stats", &RetryConfig::batch_write(), || self.upsert_all(rows)).await?;

        let ids: Vec<&str> = rows.iter().map(|r| r.product_id.as_str()).collect();
        let verified_count = self.verify_ids(&ids).await?;
        let verified = verified_count == rows.len();

        if !verified {
            tracing::warn!(
                batch_id = %batch_id,
                expected = rows.len(),
                actual = verified_count,
                "Stats batch verification mismatch"
            );
        }

        Ok(BatchWriteResult {
            batch_id,
            written,
            verified,
        })
    }

    async fn find_stats_by_product_id(&self, product_id: &str) -> Result<Option<DurableStatRecord>, StorageError> {
        let sql = format!("SELECT {} FROM product_stats WHERE product_id = ?", STATS_COLUMNS);
        let row = retry("sql_find_stats", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(product_id.to_string())
                .fetch_optional(&self.pool)
                .await
                .map_err(sql_err)
        })
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn find_top_by_metric(&self, metric: Metric, limit: usize) -> Result<Vec<DurableStatRecord>, StorageError> {
        let sql = format!(
            "SELECT {} FROM product_stats ORDER BY {} DESC, product_id ASC LIMIT ?",
            STATS_COLUMNS,
            metric.column()
        );
        let rows = retry("sql_top_by_metric", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await
                .map_err(sql_err)
        })
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn create_zeroed_stats_row(&self, product_id: &str) -> Result<bool, StorageError> {
        let sql = if self.is_sqlite {
            format!("INSERT OR IGNORE INTO product_stats ({}) VALUES (?, 0, 0, 0, 0, 0, 0, ?, ?)", STATS_COLUMNS)
        } else {
            format!("INSERT IGNORE INTO product_stats ({}) VALUES (?, 0, 0, 0, 0, 0, 0, ?, ?)", STATS_COLUMNS)
        };
        let now = Utc::now().timestamp_millis();

        let result = retry("sql_create_zeroed", &RetryConfig::query(), || async {
            sqlx::query(&sql)
                .bind(product_id.to_string())
                .bind(now)
                .bind(now)
                .execute(&self.pool)
                .await
                .map_err(sql_err)
        })
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn clear_stats_row(&self, product_id: &str) -> Result<(), StorageError> {
        let now = Utc::now().timestamp_millis();
        retry("sql_clear_stats", &RetryConfig::query(), || async {
            sqlx::query(
                "UPDATE product_stats SET total_views = 0, clicks = 0, organic_clicks = 0, total_carts = 0, \
                 total_orders = 0, total_boost_score = 0, updated_at = ? WHERE product_id = ?",
            )
            .bind(now)
            .bind(product_id.to_string())
            .execute(&self.pool)
            .await
            .map_err(sql_err)
        })
        .await?;
        Ok(())
    }

    async fn find_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<Option<Boost>, StorageError> {
        let now_ms = now.timestamp_millis();
        let row = retry("sql_find_active_boost", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT product_id, boost_score, status, start_date, end_date FROM product_boosts \
                 WHERE product_id = ? AND status = 'active' AND start_date <= ? AND end_date >= ? \
                 ORDER BY boost_score DESC LIMIT 1",
            )
            .bind(product_id.to_string())
            .bind(now_ms)
            .bind(now_ms)
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let status = get_text(&row, "status")?;
        Ok(Some(Boost {
            product_id: get_text(&row, "product_id")?,
            boost_score: row.try_get("boost_score").map_err(sql_err)?,
            status: BoostStatus::parse(&status)
                .ok_or_else(|| StorageError::Serialization(format!("unknown boost status '{}'", status)))?,
            start_date: datetime_from_millis(row.try_get("start_date").map_err(sql_err)?),
            end_date: datetime_from_millis(row.try_get("end_date").map_err(sql_err)?),
        }))
    }

    async fn count_active_boost(&self, product_id: &str, now: DateTime<Utc>) -> Result<u64, StorageError> {
        let now_ms = now.timestamp_millis();
        let row = retry("sql_count_active_boost", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT COUNT(*) as cnt FROM product_boosts \
                 WHERE product_id = ? AND status = 'active' AND start_date <= ? AND end_date >= ?",
            )
            .bind(product_id.to_string())
            .bind(now_ms)
            .bind(now_ms)
            .fetch_one(&self.pool)
            .await
            .map_err(sql_err)
        })
        .await?;

        get_count(&row, "cnt")
    }

    async fn find_ranking_info(&self, product_id: &str) -> Result<Option<ProductRankingInfo>, StorageError> {
        let row = retry("sql_find_ranking_info", &RetryConfig::query(), || async {
            sqlx::query(
                "SELECT product_id, created_at, discount_percentage, discount_start, discount_end \
                 FROM products WHERE product_id = ?",
            )
            .bind(product_id.to_string())
            .fetch_optional(&self.pool)
            .await
            .map_err(sql_err)
        })
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let percentage: Option<f64> = row.try_get("discount_percentage").map_err(sql_err)?;
        let start: Option<i64> = row.try_get("discount_start").map_err(sql_err)?;
        let end: Option<i64> = row.try_get("discount_end").map_err(sql_err)?;
        let discount = match (percentage, start, end) {
            (Some(percentage), Some(start), Some(end)) => Some(DiscountWindow {
                percentage,
                start: datetime_from_millis(start),
                end: datetime_from_millis(end),
            }),
            _ => None,
        };

        Ok(Some(ProductRankingInfo {
            product_id: get_text(&row, "product_id")?,
            created_at: datetime_from_millis(row.try_get("created_at").map_err(sql_err)?),
            discount,
        }))
    }

    async fn list_product_ids(&self, offset: u64, limit: usize) -> Result<Vec<String>, StorageError> {
        let rows = sqlx::query("SELECT product_id FROM product_stats ORDER BY product_id LIMIT ? OFFSET ?")
            .bind(limit as i64)
            .bind(offset as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(sql_err)?;

        rows.iter().map(|row| get_text(row, "product_id")).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::counters::ProductCounterSet;
    use chrono::Duration as ChronoDuration;
    use std::path::PathBuf;

    fn temp_db_path(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("stats_sql_test_{}_{}.db", name, uuid::Uuid::new_v4()))
    }

    /// Clean up SQLite database and its WAL files
    fn cleanup_db(path: &PathBuf) {
        let _ = std::fs::remove_file(path);
        let _ = std::fs::remove_file(format!("{}-wal", path.display()));
        let _ = std::fs::remove_file(format!("{}-shm", path.display()));
    }

    async fn open(path: &PathBuf) -> SqlStatsStore {
        let url = format!("sqlite://{}?mode=rwc", path.display());
        SqlStatsStore::new(&url).await.unwrap()
    }

    fn record(id: &str, views: u64, orders: u64) -> DurableStatRecord {
        let counters = ProductCounterSet { views, orders, ..Default::default() };
        DurableStatRecord::from_counters(id, &counters, Utc::now())
    }

    #[tokio::test]
    async fn test_zeroed_row_then_upsert_overwrites() {
        let db_path = temp_db_path("upsert");
        let store = open(&db_path).await;

        assert!(store.create_zeroed_stats_row("p1").await.unwrap());
        assert!(!store.create_zeroed_stats_row("p1").await.unwrap());
        let created_at = store.find_stats_by_product_id("p1").await.unwrap().unwrap().created_at;

        let result = store.upsert_stats_batch(&[record("p1", 100, 3)]).await.unwrap();
        assert_eq!(result.written, 1);
        assert!(result.verified);

        // Same totals again: overwrite, not accumulate
        store.upsert_stats_batch(&[record("p1", 100, 3)]).await.unwrap();

        let row = store.find_stats_by_product_id("p1").await.unwrap().unwrap();
        assert_eq!(row.total_views, 100);
        assert_eq!(row.total_orders, 3);
        assert_eq!(row.created_at.timestamp_millis(), created_at.timestamp_millis());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_upsert_large_batch_is_chunked() {
        let db_path = temp_db_path("chunked");
        let store = open(&db_path).await;

        let rows: Vec<DurableStatRecord> = (0..1_200).map(|i| record(&format!("p{:05}", i), i, 0)).collect();
        let result = store.upsert_stats_batch(&rows).await.unwrap();
        assert_eq!(result.written, 1_200);
        assert!(result.verified);

        let page = store.list_product_ids(1_000, 500).await.unwrap();
        assert_eq!(page.len(), 200);
        assert_eq!(page[0], "p01000");

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_failing_chunk_rolls_back_whole_batch() {
        let db_path = temp_db_path("rollback");
        let store = open(&db_path).await;
        sqlx::query(
            "CREATE TRIGGER reject_poison BEFORE INSERT ON product_stats \
             WHEN NEW.product_id = 'p00600' BEGIN SELECT RAISE(ABORT, 'rejected row'); END",
        )
        .execute(&store.pool())
        .await
        .unwrap();

        // Rows 0..500 form the first chunk, the rejected row is in the second
        let rows: Vec<DurableStatRecord> = (0..1_000).map(|i| record(&format!("p{:05}", i), i + 1, 0)).collect();
        assert!(store.upsert_stats_batch(&rows).await.is_err());

        assert!(store.list_product_ids(0, 10).await.unwrap().is_empty());
        assert!(store.find_stats_by_product_id("p00001").await.unwrap().is_none());

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_top_by_metric_and_clear() {
        let db_path = temp_db_path("top");
        let store = open(&db_path).await;

        store
            .upsert_stats_batch(&[record("a", 10, 1), record("b", 50, 0), record("c", 30, 9)])
            .await
            .unwrap();

        let top_views: Vec<String> = store
            .find_top_by_metric(Metric::Views, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.product_id)
            .collect();
        assert_eq!(top_views, vec!["b", "c"]);

        store.clear_stats_row("b").await.unwrap();
        let cleared = store.find_stats_by_product_id("b").await.unwrap().unwrap();
        assert_eq!(cleared.total_views, 0);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_active_boost_window() {
        let db_path = temp_db_path("boost");
        let store = open(&db_path).await;
        let now = Utc::now();

        store
            .insert_boost(&Boost {
                product_id: "p1".into(),
                boost_score: 4.0,
                status: BoostStatus::Active,
                start_date: now - ChronoDuration::hours(1),
                end_date: now + ChronoDuration::hours(1),
            })
            .await
            .unwrap();

        assert_eq!(store.count_active_boost("p1", now).await.unwrap(), 1);
        let boost = store.find_active_boost("p1", now).await.unwrap().unwrap();
        assert_eq!(boost.status, BoostStatus::Active);
        assert!(store.find_active_boost("p1", now + ChronoDuration::hours(3)).await.unwrap().is_none());

        store.set_boost_status("p1", BoostStatus::Canceled).await.unwrap();
        assert_eq!(store.count_active_boost("p1", now).await.unwrap(), 0);

        cleanup_db(&db_path);
    }

    #[tokio::test]
    async fn test_ranking_info_with_and_without_discount() {
        let db_path = temp_db_path("products");
        let store = open(&db_path).await;
        let now = Utc::now();

        store.upsert_product(&ProductRankingInfo::new("plain", now)).await.unwrap();
        store
            .upsert_product(
                &ProductRankingInfo::new("sale", now)
                    .with_discount(20.0, now - ChronoDuration::hours(1), now + ChronoDuration::hours(1)),
            )
            .await
            .unwrap();

        let plain = store.find_ranking_info("plain").await.unwrap().unwrap();
        assert!(plain.discount.is_none());

        let sale = store.find_ranking_info("sale").await.unwrap().unwrap();
        assert_eq!(sale.active_discount(now), Some(20.0));

        assert!(store.find_ranking_info("missing").await.unwrap().is_none());

        cleanup_db(&db_path);
    }
}
