//! mailjudge storage - Statistics persistence
//!
//! Each run hands its per-account action counters to a [`StatsSink`].
//! Records are append-only: (run timestamp, account, action, count).

pub mod db;
pub mod sink;

pub use db::SqliteStatsStore;
pub use sink::{create_sink, LogStatsSink, StatsRecord, StatsSink};
