//! Local SQLite result store

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, info};

use super::ResultSink;
use crate::core::NormalizedResult;
use crate::error::{ErrorExt, Result};

const CREATE_RAW_TRANSMISSIONS: &str = r#"
    CREATE TABLE IF NOT EXISTS raw_transmissions (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        machine_id TEXT NOT NULL,
        raw_text TEXT NOT NULL,
        received_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
    )
"#;

const CREATE_LAB_RESULTS: &str = r#"
    CREATE TABLE IF NOT EXISTS lab_results (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        order_id TEXT NOT NULL,
        test_id TEXT NOT NULL,
        test_type TEXT NOT NULL,
        results TEXT NOT NULL,
        test_unit TEXT NOT NULL,
        tester_name TEXT NOT NULL,
        analysed_at TEXT NOT NULL,
        authorised_at TEXT NOT NULL,
        accepted_at TEXT NOT NULL,
        raw_text TEXT NOT NULL,
        result_status INTEGER NOT NULL,
        machine_id TEXT NOT NULL,
        lab_location TEXT NOT NULL,
        created_at TEXT NOT NULL DEFAULT (datetime('now', 'localtime'))
    )
"#;

const CREATE_RESULTS_ORDER_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_lab_results_order ON lab_results(order_id)";

/// Result store backed by a local SQLite file
#[derive(Debug, Clone)]
pub struct SqliteResultStore {
    pool: SqlitePool,
    db_path: String,
}

impl SqliteResultStore {
    /// Open (creating if missing) the database and its tables
    pub async fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db_path_str = db_path.as_ref().to_string_lossy().to_string();

        if let Some(parent) = db_path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).storage_error("Create database directory")?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&db_path_str)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(5))
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;

        let store = Self::from_pool(pool, db_path_str).await?;
        info!("Result store opened: {}", store.db_path);
        Ok(store)
    }

    /// Use an existing pool, creating the tables if needed
    pub async fn from_pool(pool: SqlitePool, db_path: impl Into<String>) -> Result<Self> {
        for statement in [CREATE_RAW_TRANSMISSIONS, CREATE_LAB_RESULTS, CREATE_RESULTS_ORDER_INDEX] {
            sqlx::query(statement).execute(&pool).await?;
        }
        Ok(Self {
            pool,
            db_path: db_path.into(),
        })
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> &str {
        &self.db_path
    }

    /// Results stored for one order, oldest first
    pub async fn results_for_order(&self, order_id: &str) -> Result<Vec<NormalizedResult>> {
        let rows = sqlx::query(
            r#"
            SELECT order_id, test_id, test_type, results, test_unit, tester_name,
                   analysed_at, authorised_at, accepted_at, raw_text, result_status,
                   machine_id, lab_location
            FROM lab_results
            WHERE order_id = ?
            ORDER BY id ASC
            "#,
        )
        .bind(order_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|row| -> Result<NormalizedResult> {
                Ok(NormalizedResult {
                    order_id: row.try_get("order_id")?,
                    test_id: row.try_get("test_id")?,
                    test_type: row.try_get("test_type")?,
                    results: row.try_get("results")?,
                    test_unit: row.try_get("test_unit")?,
                    tester_name: row.try_get("tester_name")?,
                    analysed_at: row.try_get("analysed_at")?,
                    authorised_at: row.try_get("authorised_at")?,
                    accepted_at: row.try_get("accepted_at")?,
                    raw_text: row.try_get("raw_text")?,
                    result_status: row.try_get("result_status")?,
                    machine_id: row.try_get("machine_id")?,
                    lab_location: row.try_get("lab_location")?,
                })
            })
            .collect()
    }

    /// Number of raw captures stored for a machine
    pub async fn raw_count(&self, machine_id: &str) -> Result<i64> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM raw_transmissions WHERE machine_id = ?")
            .bind(machine_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get("n")?)
    }
}

#[async_trait]
impl ResultSink for SqliteResultStore {
    async fn record_raw_transmission(&self, machine_id: &str, raw_text: &str) -> Result<()> {
        sqlx::query("INSERT INTO raw_transmissions (machine_id, raw_text) VALUES (?, ?)")
            .bind(machine_id)
            .bind(raw_text)
            .execute(&self.pool)
            .await?;
        debug!("Raw capture stored for {} ({} bytes)", machine_id, raw_text.len());
        Ok(())
    }

    async fn record_result(&self, result: &NormalizedResult) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO lab_results (
                order_id, test_id, test_type, results, test_unit, tester_name,
                analysed_at, authorised_at, accepted_at, raw_text, result_status,
                machine_id, lab_location
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(&result.order_id)
        .bind(&result.test_id)
        .bind(&result.test_type)
        .bind(&result.results)
        .bind(&result.test_unit)
        .bind(&result.tester_name)
        .bind(&result.analysed_at)
        .bind(&result.authorised_at)
        .bind(&result.accepted_at)
        .bind(&result.raw_text)
        .bind(result.result_status)
        .bind(&result.machine_id)
        .bind(&result.lab_location)
        .execute(&self.pool)
        .await?;
        debug!("Result stored for order {}", result.order_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_result(order_id: &str) -> NormalizedResult {
        NormalizedResult {
            order_id: order_id.to_string(),
            test_id: "T1".to_string(),
            test_type: "HIV-VL".to_string(),
            results: "12345".to_string(),
            test_unit: "U/mL".to_string(),
            tester_name: String::new(),
            analysed_at: "2024-01-05 10:15:00".to_string(),
            authorised_at: "2024-01-05 10:15:00".to_string(),
            accepted_at: "2024-01-05 10:16:00".to_string(),
            raw_text: "R|1|^^^HIV-VL|12345^U/mL||||F".to_string(),
            result_status: 1,
            machine_id: "VL-01".to_string(),
            lab_location: "Central Lab".to_string(),
        }
    }

    #[tokio::test]
    async fn test_store_and_read_back() {
        let dir = TempDir::new().unwrap();
        let store = SqliteResultStore::open(dir.path().join("data/results.db"))
            .await
            .unwrap();

        store.record_raw_transmission("VL-01", "\x02raw\x03").await.unwrap();
        store.record_result(&sample_result("ORD123")).await.unwrap();
        store.record_result(&sample_result("ORD999")).await.unwrap();

        assert_eq!(store.raw_count("VL-01").await.unwrap(), 1);
        assert_eq!(store.raw_count("other").await.unwrap(), 0);
        let rows = store.results_for_order("ORD123").await.unwrap();
        assert_eq!(rows, vec![sample_result("ORD123")]);
    }

    #[tokio::test]
    async fn test_reopen_keeps_rows() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("results.db");
        {
            let store = SqliteResultStore::open(&path).await.unwrap();
            store.record_result(&sample_result("ORD1")).await.unwrap();
            store.pool().close().await;
        }
        let store = SqliteResultStore::open(&path).await.unwrap();
        assert_eq!(store.results_for_order("ORD1").await.unwrap().len(), 1);
    }
}
