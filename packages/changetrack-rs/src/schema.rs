//! Schema Provisioner (§4.1).
//!
//! Ensures the coordination tables and per-user-table metadata row exist.
//! Every step below is guarded by an existence check on the [`Database`]
//! side, so calling [`SchemaProvisioner::start`] concurrently from many
//! workers against the same table is safe (§4.1: "idempotent under
//! concurrent execution").

use tracing::{debug, info};

use crate::db::Database;
use crate::error::SchemaError;
use crate::types::WorkerId;

/// Runs the one-time (but idempotent) provisioning sequence for a single
/// user table.
pub struct SchemaProvisioner<'a> {
    table: String,
    worker: &'a WorkerId,
}

impl<'a> SchemaProvisioner<'a> {
    pub fn new(table: impl Into<String>, worker: &'a WorkerId) -> Self {
        Self {
            table: table.into(),
            worker,
        }
    }

    /// §4.1: resolve the table, provision `GlobalState` / `Worker_Table_<id>`
    /// / `WorkerBatchSizes`, seed `GlobalState`, and announce this worker's
    /// liveness. Returns the resolved [`crate::db::TableId`] so callers
    /// (the Lease Manager, the Scale Monitor) don't have to re-resolve it.
    pub async fn start(&self, db: &dyn Database) -> Result<crate::db::TableId, SchemaError> {
        debug!(table = %self.table, "provisioning coordination schema");

        let table_id = db
            .resolve_table(&self.table)
            .await?
            .ok_or_else(|| SchemaError::TableNotFound {
                table: self.table.clone(),
            })?;

        let pk_columns = db.primary_key_columns(&table_id).await?;
        if pk_columns.is_empty() {
            return Err(SchemaError::NoPrimaryKey {
                table: self.table.clone(),
            });
        }

        // Read once; the column list itself isn't consumed here but forces
        // the same existence check the query builder will later rely on.
        let _columns = db.column_names(&table_id).await?;

        db.ensure_coordination_tables(&table_id, &pk_columns).await?;

        let min_valid_version = db
            .change_tracking_min_valid_version(&table_id)
            .await?
            .ok_or_else(|| SchemaError::ChangeTrackingNotEnabled {
                table: self.table.clone(),
            })?;
        let database_id = db.current_database_id().await?;

        db.seed_global_state(&table_id, min_valid_version, database_id)
            .await?;

        db.upsert_worker_batch_size(&table_id, self.worker, 0)
            .await
            .map_err(|e| SchemaError::Backend(e.into()))?;

        info!(
            table = %self.table,
            object_id = table_id.object_id,
            worker = %self.worker,
            "coordination schema ready"
        );

        Ok(table_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::InMemoryDatabase;

    #[tokio::test]
    async fn start_fails_on_missing_table() {
        let db = InMemoryDatabase::new();
        let worker = WorkerId::new("w1");
        let provisioner = SchemaProvisioner::new("dbo.Missing", &worker);

        let err = provisioner.start(&db).await.unwrap_err();
        assert!(matches!(err, SchemaError::TableNotFound { .. }));
    }

    #[tokio::test]
    async fn start_is_idempotent_under_repeated_calls() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let worker = WorkerId::new("w1");
        let provisioner = SchemaProvisioner::new("dbo.Widgets", &worker);

        let first = provisioner.start(&db).await.unwrap();
        let second = provisioner.start(&db).await.unwrap();
        assert_eq!(first, second);

        let state = db.read_global_state(&first).await.unwrap();
        assert_eq!(state.rows_processed, 0);
    }

    #[tokio::test]
    async fn start_fails_when_change_tracking_not_enabled() {
        let db = InMemoryDatabase::with_seeded_table_no_change_tracking("dbo.Widgets", &["id"]);
        let worker = WorkerId::new("w1");
        let provisioner = SchemaProvisioner::new("dbo.Widgets", &worker);

        let err = provisioner.start(&db).await.unwrap_err();
        assert!(matches!(err, SchemaError::ChangeTrackingNotEnabled { .. }));
    }
}
