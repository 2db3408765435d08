pub mod cohort_repository;
pub mod cycle_repository;
pub mod monitoring_repository;
pub mod regime_repository;
pub mod signal_repository;
pub mod snapshot_repository;
pub mod trade_repository;
pub mod weights_repository;

use chrono::{DateTime, TimeZone, Utc};

/// Epoch-second column helpers shared by the sqlite repositories.
pub(crate) fn to_ts(dt: DateTime<Utc>) -> i64 {
    dt.timestamp()
}

pub(crate) fn from_ts(ts: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(ts, 0).single().unwrap_or_else(Utc::now)
}
