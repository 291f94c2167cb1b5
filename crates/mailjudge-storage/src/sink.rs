//! Stats sink abstraction

use crate::db::SqliteStatsStore;
use async_trait::async_trait;
use chrono::NaiveDateTime;
use mailjudge_common::config::StatsConfig;
use mailjudge_common::types::ActionStats;
use mailjudge_common::{Error, Result};
use std::sync::Arc;
use tracing::info;

/// One persisted statistics row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatsRecord {
    pub run_at: NaiveDateTime,
    pub account: String,
    pub action: String,
    pub count: u64,
}

impl StatsRecord {
    /// Flatten an account's counters into records tagged with the run time
    pub fn from_stats(run_at: NaiveDateTime, account: &str, stats: &ActionStats) -> Vec<Self> {
        stats
            .iter()
            .map(|(action, count)| Self {
                run_at,
                account: account.to_string(),
                action: action.to_string(),
                count,
            })
            .collect()
    }
}

/// Receiver of finalized per-account statistics
#[async_trait]
pub trait StatsSink: Send + Sync {
    /// Append the counters of one account for the run started at `run_at`
    async fn record(&self, run_at: NaiveDateTime, account: &str, stats: &ActionStats) -> Result<()>;
}

/// Sink that only logs the counters
#[derive(Debug, Default)]
pub struct LogStatsSink;

#[async_trait]
impl StatsSink for LogStatsSink {
    async fn record(&self, run_at: NaiveDateTime, account: &str, stats: &ActionStats) -> Result<()> {
        for record in StatsRecord::from_stats(run_at, account, stats) {
            info!(
                run_at = %record.run_at,
                account = %record.account,
                action = %record.action,
                count = record.count,
                "Judgement statistics"
            );
        }
        Ok(())
    }
}

/// Create the stats sink selected by configuration
pub async fn create_sink(config: &StatsConfig) -> Result<Arc<dyn StatsSink>> {
    match config.backend.as_str() {
        "sqlite" => Ok(Arc::new(SqliteStatsStore::open(&config.path).await?)),
        "log" => Ok(Arc::new(LogStatsSink)),
        other => Err(Error::Config(format!(
            "Unsupported stats backend: {}",
            other
        ))),
    }
}
