//! SQLite statistics store

use crate::sink::{StatsRecord, StatsSink};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use mailjudge_common::types::ActionStats;
use mailjudge_common::{Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use tracing::{debug, info};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS judgements (
    id      INTEGER PRIMARY KEY,
    run_at  DATETIME NOT NULL,
    account TEXT NOT NULL,
    action  TEXT NOT NULL,
    count   INTEGER NOT NULL
)
"#;

/// Append-only statistics table in a local SQLite database
#[derive(Clone)]
pub struct SqliteStatsStore {
    pool: SqlitePool,
}

impl SqliteStatsStore {
    /// Open (creating if needed) the database file at `path`
    pub async fn open(path: &Path) -> Result<Self> {
        info!(path = %path.display(), "Opening statistics database");

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true);
        Self::connect(options).await
    }

    /// Private in-memory database, lost when the store is dropped
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")
            .map_err(|e| Error::Storage(format!("Invalid database URL: {}", e)))?;
        Self::connect(options).await
    }

    async fn connect(options: SqliteConnectOptions) -> Result<Self> {
        // Writers are serialized through a single connection.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await
            .map_err(|e| Error::Storage(format!("Failed to connect: {}", e)))?;

        sqlx::query(SCHEMA)
            .execute(&pool)
            .await
            .map_err(|e| Error::Storage(format!("Failed to create schema: {}", e)))?;

        Ok(Self { pool })
    }

    /// Get the underlying pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// All records in insertion order
    pub async fn records(&self) -> Result<Vec<StatsRecord>> {
        let rows: Vec<(NaiveDateTime, String, String, i64)> = sqlx::query_as(
            "SELECT run_at, account, action, count FROM judgements ORDER BY id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| Error::Storage(format!("Failed to read statistics: {}", e)))?;

        Ok(rows
            .into_iter()
            .map(|(run_at, account, action, count)| StatsRecord {
                run_at,
                account,
                action,
                count: count.max(0) as u64,
            })
            .collect())
    }
}

#[async_trait]
impl StatsSink for SqliteStatsStore {
    async fn record(&self, run_at: NaiveDateTime, account: &str, stats: &ActionStats) -> Result<()> {
        let records = StatsRecord::from_stats(run_at, account, stats);
        if records.is_empty() {
            return Ok(());
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| Error::Storage(format!("Failed to begin transaction: {}", e)))?;

        for record in &records {
            sqlx::query("INSERT INTO judgements (run_at, account, action, count) VALUES (?, ?, ?, ?)")
                .bind(record.run_at)
                .bind(&record.account)
                .bind(&record.action)
                .bind(record.count as i64)
                .execute(&mut *tx)
                .await
                .map_err(|e| Error::Storage(format!("Failed to insert statistics: {}", e)))?;
        }

        tx.commit()
            .await
            .map_err(|e| Error::Storage(format!("Failed to commit statistics: {}", e)))?;

        debug!(account = %account, rows = records.len(), "Statistics saved");
        Ok(())
    }
}
