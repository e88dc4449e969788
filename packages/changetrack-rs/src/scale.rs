//! Scale Monitor (§4.4): a read-only observer with no leases and no writes
//! to change state. Stateless across process boundaries; the two fields
//! below are the only state it carries within one process.

use std::time::Duration;

use tracing::debug;

use crate::db::{Database, TableId};
use crate::types::{ScaleAction, ScaleHeartbeat};

/// Samples unprocessed-change count and worker throughput and emits a scale
/// recommendation. One instance per tracked user table.
pub struct ScaleMonitor {
    table: TableId,
    batch_size: i64,
    /// §4.4: whether `count_changes` counts all rows since the retained
    /// minimum (`false`, the default) or only rows with no released lease
    /// yet (`true`).
    unprocessed_only: bool,
    last_changes: Option<i64>,
    last_rows_processed: Option<i64>,
}

impl ScaleMonitor {
    pub fn new(table: TableId, batch_size: i64) -> Self {
        Self {
            table,
            batch_size,
            unprocessed_only: false,
            last_changes: None,
            last_rows_processed: None,
        }
    }

    pub fn counting_unprocessed_only(mut self, unprocessed_only: bool) -> Self {
        self.unprocessed_only = unprocessed_only;
        self
    }

    /// §4.4's per-call algorithm. `polling_interval` is used both as the
    /// "consecutive heartbeat" cadence and as the recency window for
    /// `active_worker_count` (step 8).
    pub async fn heartbeat(&mut self, db: &dyn Database, polling_interval: Duration) -> ScaleHeartbeat {
        let current_changes = match db.count_changes(&self.table, self.unprocessed_only).await {
            Ok(Some(count)) => count,
            Ok(None) => {
                return ScaleHeartbeat {
                    recommendation: ScaleAction::None,
                    reason: "change count unavailable".to_string(),
                    keep_alive: true,
                    new_changes: None,
                    new_rows_processed: None,
                };
            }
            Err(e) => {
                debug!(table = %self.table, error = %e, "scale monitor failed to read change count");
                return ScaleHeartbeat {
                    recommendation: ScaleAction::None,
                    reason: format!("change count unavailable: {e}"),
                    keep_alive: true,
                    new_changes: None,
                    new_rows_processed: None,
                };
            }
        };

        let rows_processed = match db.read_global_state(&self.table).await {
            Ok(state) => state.rows_processed,
            Err(e) => {
                debug!(table = %self.table, error = %e, "scale monitor failed to read GlobalState");
                return ScaleHeartbeat {
                    recommendation: ScaleAction::None,
                    reason: format!("rows processed unavailable: {e}"),
                    keep_alive: true,
                    new_changes: None,
                    new_rows_processed: None,
                };
            }
        };

        let (last_changes, last_rows_processed) = match (self.last_changes, self.last_rows_processed) {
            (Some(c), Some(r)) => (c, r),
            _ => {
                self.last_changes = Some(current_changes);
                self.last_rows_processed = Some(rows_processed);
                return ScaleHeartbeat {
                    recommendation: ScaleAction::None,
                    reason: "first heartbeat; establishing baseline".to_string(),
                    keep_alive: true,
                    new_changes: None,
                    new_rows_processed: None,
                };
            }
        };

        let new_changes = current_changes - last_changes;

        let raw_delta = rows_processed - last_rows_processed;
        let new_rows_processed = if last_rows_processed != 0 && raw_delta < 0 {
            // RowsProcessed wrapped past i64::MAX (P5): the true delta is
            // whatever remained to the ceiling plus however far past zero
            // the counter landed.
            (i64::MAX - last_rows_processed) + rows_processed
        } else {
            raw_delta
        };

        self.last_changes = Some(current_changes);
        self.last_rows_processed = Some(rows_processed);

        if new_changes < 0 {
            return ScaleHeartbeat {
                recommendation: ScaleAction::None,
                reason: "change table was cleaned since last heartbeat".to_string(),
                keep_alive: true,
                new_changes: Some(new_changes),
                new_rows_processed: Some(new_rows_processed),
            };
        }

        if new_rows_processed < new_changes {
            return ScaleHeartbeat {
                recommendation: ScaleAction::AddWorker,
                reason: format!(
                    "processed {new_rows_processed} rows but {new_changes} new changes arrived; falling behind"
                ),
                keep_alive: true,
                new_changes: Some(new_changes),
                new_rows_processed: Some(new_rows_processed),
            };
        }

        let active_worker_count = match db.count_active_workers(&self.table, polling_interval).await {
            Ok(count) => count,
            Err(e) => {
                debug!(table = %self.table, error = %e, "scale monitor failed to count active workers");
                return ScaleHeartbeat {
                    recommendation: ScaleAction::None,
                    reason: format!("active worker count unavailable: {e}"),
                    keep_alive: true,
                    new_changes: Some(new_changes),
                    new_rows_processed: Some(new_rows_processed),
                };
            }
        };

        let unused_capacity = active_worker_count * self.batch_size - new_rows_processed;
        if unused_capacity >= self.batch_size {
            ScaleHeartbeat {
                recommendation: ScaleAction::RemoveWorker,
                reason: format!(
                    "{active_worker_count} active workers have {unused_capacity} rows of unused capacity"
                ),
                keep_alive: false,
                new_changes: Some(new_changes),
                new_rows_processed: Some(new_rows_processed),
            }
        } else {
            ScaleHeartbeat {
                recommendation: ScaleAction::None,
                reason: "throughput matches arrival rate within capacity".to_string(),
                keep_alive: true,
                new_changes: Some(new_changes),
                new_rows_processed: Some(new_rows_processed),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryDatabase;
    use crate::types::{ChangeType, WorkerId};

    async fn seeded(batch_size: i64) -> (InMemoryDatabase, crate::db::TableId, ScaleMonitor) {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_global_state(&table, 0, 1).await.unwrap();
        let monitor = ScaleMonitor::new(table.clone(), batch_size);
        (db, table, monitor)
    }

    #[tokio::test]
    async fn first_heartbeat_establishes_baseline() {
        let (db, _table, mut monitor) = seeded(10).await;
        let hb = monitor.heartbeat(&db, Duration::from_secs(5)).await;
        assert_eq!(hb.recommendation, ScaleAction::None);
        assert!(hb.keep_alive);
        assert!(hb.new_changes.is_none());
    }

    #[tokio::test]
    async fn falling_behind_recommends_add_worker() {
        let (db, table, mut monitor) = seeded(10).await;
        monitor.heartbeat(&db, Duration::from_secs(5)).await;

        for i in 0..5 {
            db.seed_change(&table, i + 1, ChangeType::Inserted, &[("id", i)]);
        }

        let hb = monitor.heartbeat(&db, Duration::from_secs(5)).await;
        assert_eq!(hb.recommendation, ScaleAction::AddWorker);
    }

    #[tokio::test]
    async fn idle_capacity_recommends_remove_worker() {
        let (db, table, mut monitor) = seeded(10).await;
        let worker = WorkerId::new("w1");
        db.upsert_worker_batch_size(&table, &worker, 0).await.unwrap();
        monitor.heartbeat(&db, Duration::from_secs(5)).await;

        // No new changes, no rows processed: plenty of unused capacity.
        let hb = monitor.heartbeat(&db, Duration::from_secs(5)).await;
        assert_eq!(hb.recommendation, ScaleAction::RemoveWorker);
        assert!(!hb.keep_alive);
    }

    #[tokio::test]
    async fn rows_processed_wrap_yields_nonnegative_delta() {
        let (db, table, mut monitor) = seeded(10).await;
        db.set_rows_processed(&table, i64::MAX - 5);
        monitor.heartbeat(&db, Duration::from_secs(5)).await;

        // The counter wraps: 10 more rows processed lands at 5, not
        // i64::MAX + 5.
        db.set_rows_processed(&table, 5);

        let hb = monitor.heartbeat(&db, Duration::from_secs(5)).await;
        assert_eq!(hb.new_rows_processed, Some(10));
    }
}
