//! Change Reader (§4.2).
//!
//! Owns the per-user-table SQL template (built once the primary-key schema
//! is known) and the read-then-lease cycle. [`ChangeReader::fetch_batch`] is
//! the only entry point the Lease Manager's poll task calls; everything else
//! here is either the preamble or the query-building helper the `mssql`
//! adapter parameterizes per call (§9: "Query building").

use std::time::Duration;

use tracing::{debug, warn};

use crate::db::{Database, PreambleOutcome, TableId};
use crate::error::RunnerError;
use crate::types::{ChangeRow, PrimaryKeyColumn, WorkerId};

/// Builds the parameterized `CHANGETABLE(CHANGES ...)` join template for one
/// user table, once its primary-key schema is known (§9). Kept separate from
/// the `mssql` adapter so the shape of the generated SQL is unit-testable
/// without a live server; only primary-key values and change metadata are
/// ever bound into the placeholders this produces (never free-form user
/// input).
#[derive(Debug, Clone)]
pub struct ChangeQueryBuilder {
    qualified_table: String,
    lease_table: String,
    pk_columns: Vec<PrimaryKeyColumn>,
    columns: Vec<String>,
}

impl ChangeQueryBuilder {
    pub fn new(qualified_table: impl Into<String>) -> Self {
        Self {
            qualified_table: qualified_table.into(),
            lease_table: "Worker_Table_0".to_string(),
            pk_columns: Vec::new(),
            columns: Vec::new(),
        }
    }

    /// The fully-qualified `Worker_Table_<UserTableID>` lease table this
    /// table's changes are leased against (§6). The caller (the `mssql`
    /// adapter) owns the coordination schema name, so it supplies the
    /// already-qualified, bracketed identifier rather than this builder
    /// reconstructing it from an object id.
    pub fn with_lease_table(mut self, lease_table: impl Into<String>) -> Self {
        self.lease_table = lease_table.into();
        self
    }

    pub fn with_primary_keys(mut self, pk_columns: Vec<PrimaryKeyColumn>) -> Self {
        self.pk_columns = pk_columns;
        self
    }

    pub fn with_columns(mut self, columns: Vec<String>) -> Self {
        self.columns = columns;
        self
    }

    fn join_predicate(&self) -> String {
        self.pk_columns
            .iter()
            .map(|pk| format!("ct.[{name}] = t.[{name}]", name = pk.name))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    fn lease_join_predicate(&self) -> String {
        self.pk_columns
            .iter()
            .map(|pk| format!("ct.[{name}] = lease.[{name}]", name = pk.name))
            .collect::<Vec<_>>()
            .join(" AND ")
    }

    /// The SELECT used by [`Database::fetch_and_lease_batch`], parameterized
    /// on `@p1` (batch size), `@p2` (min version), and `@p3` (max dequeue
    /// count) — the same bind-by-number convention the `mssql` adapter uses
    /// everywhere else (§4.2: at most `BatchSize` rows, ordered ascending by
    /// `SYS_CHANGE_VERSION`, predicate per §4.2's three conditions).
    pub fn select_batch_sql(&self) -> String {
        let pk_cols = self
            .pk_columns
            .iter()
            .map(|pk| format!("ct.[{}]", pk.name))
            .collect::<Vec<_>>()
            .join(", ");

        // `columns` (from `column_names`) includes the primary-key columns,
        // already projected above as `ct.[<pk>]`; re-projecting them as
        // `t.[<pk>]` would give the result set two columns with the same
        // name, making a by-name lookup ambiguous (and, for Deleted rows,
        // NULL on the `t` side since there's no join match).
        let non_pk_projected = self
            .columns
            .iter()
            .filter(|c| !self.pk_columns.iter().any(|pk| &pk.name == *c))
            .map(|c| format!("t.[{c}]"))
            .collect::<Vec<_>>()
            .join(", ");

        let select_list = if non_pk_projected.is_empty() {
            pk_cols
        } else {
            format!("{pk_cols}, {non_pk_projected}")
        };

        format!(
            "SELECT TOP (@p1) ct.SYS_CHANGE_VERSION, ct.SYS_CHANGE_OPERATION, \
             {select_list} \
             FROM CHANGETABLE(CHANGES {table}, @p2) AS ct \
             LEFT JOIN {table} AS t ON {join} \
             LEFT JOIN {lease_table} AS lease ON {lease_join} \
             WHERE (lease.LeaseExpirationTime IS NULL OR lease.LeaseExpirationTime < SYSUTCDATETIME()) \
             AND (lease.VersionNumber IS NULL OR lease.VersionNumber < ct.SYS_CHANGE_VERSION) \
             AND (lease.DequeueCount IS NULL OR lease.DequeueCount < @p3) \
             ORDER BY ct.SYS_CHANGE_VERSION ASC",
            table = self.qualified_table,
            join = self.join_predicate(),
            lease_table = self.lease_table,
            lease_join = self.lease_join_predicate(),
        )
    }
}

/// The Change Reader for one user table. Thin: it delegates the actual
/// predicate/transaction work to [`Database`], whose production
/// implementation runs [`ChangeQueryBuilder`]'s template and whose test
/// implementation enforces the same predicate directly.
pub struct ChangeReader<'a> {
    table: &'a TableId,
    worker: &'a WorkerId,
    batch_size: i64,
    lease_interval: Duration,
    max_dequeue_count: i64,
}

impl<'a> ChangeReader<'a> {
    pub fn new(
        table: &'a TableId,
        worker: &'a WorkerId,
        batch_size: i64,
        lease_interval: Duration,
        max_dequeue_count: i64,
    ) -> Self {
        Self {
            table,
            worker,
            batch_size,
            lease_interval,
            max_dequeue_count,
        }
    }

    /// §4.2: run the preamble, then fetch-and-lease a batch.
    pub async fn fetch_batch(&self, db: &dyn Database) -> Result<Vec<ChangeRow>, RunnerError> {
        match db.run_change_reader_preamble(self.table).await? {
            PreambleOutcome::Unchanged => {}
            PreambleOutcome::AdvancedToMinValid { new_version } => {
                debug!(table = %self.table, new_version, "advanced GlobalVersionNumber to retained minimum");
            }
            PreambleOutcome::DatabaseRecreated {
                new_version,
                new_database_id,
            } => {
                warn!(
                    table = %self.table,
                    new_version,
                    new_database_id,
                    "database recreation detected; lease table truncated and version reset"
                );
            }
        }

        let batch = db
            .fetch_and_lease_batch(
                self.table,
                self.worker,
                self.batch_size,
                self.lease_interval,
                self.max_dequeue_count,
            )
            .await?;

        debug!(table = %self.table, worker = %self.worker, count = batch.len(), "fetched batch");
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::PrimaryKeyColumn;

    fn pk(name: &str) -> PrimaryKeyColumn {
        PrimaryKeyColumn {
            name: name.to_string(),
            sql_type: "int".to_string(),
            length: None,
            precision_scale: None,
        }
    }

    #[test]
    fn select_batch_sql_orders_by_version_and_caps_batch_size() {
        let sql = ChangeQueryBuilder::new("dbo.Widgets")
            .with_primary_keys(vec![pk("Id")])
            .with_columns(vec!["Id".into(), "Name".into()])
            .select_batch_sql();

        assert!(sql.contains("TOP (@p1)"));
        assert!(sql.contains("ORDER BY ct.SYS_CHANGE_VERSION ASC"));
        assert!(sql.contains("ct.[Id] = t.[Id]"));
    }

    #[test]
    fn select_batch_sql_joins_the_supplied_lease_table() {
        let sql = ChangeQueryBuilder::new("dbo.Widgets")
            .with_lease_table("[sql_trigger_runtime].[Worker_Table_42]")
            .with_primary_keys(vec![pk("Id")])
            .with_columns(vec!["Id".into()])
            .select_batch_sql();

        assert!(sql.contains("LEFT JOIN [sql_trigger_runtime].[Worker_Table_42] AS lease"));
    }

    #[test]
    fn select_batch_sql_joins_on_every_primary_key_column() {
        let sql = ChangeQueryBuilder::new("dbo.Composite")
            .with_primary_keys(vec![pk("TenantId"), pk("Id")])
            .with_columns(vec!["Id".into()])
            .select_batch_sql();

        assert!(sql.contains("ct.[TenantId] = t.[TenantId] AND ct.[Id] = t.[Id]"));
    }

    #[test]
    fn select_batch_sql_does_not_project_primary_key_columns_twice() {
        let sql = ChangeQueryBuilder::new("dbo.Widgets")
            .with_primary_keys(vec![pk("Id")])
            .with_columns(vec!["Id".into(), "Name".into()])
            .select_batch_sql();

        assert!(!sql.contains("t.[Id]"), "Id must only be projected once, from ct, not duplicated from t");
        assert!(sql.contains("t.[Name]"));
    }

    #[test]
    fn select_batch_sql_handles_table_with_only_primary_key_columns() {
        let sql = ChangeQueryBuilder::new("dbo.Widgets")
            .with_primary_keys(vec![pk("Id")])
            .with_columns(vec!["Id".into()])
            .select_batch_sql();

        assert!(!sql.contains(", FROM"), "an empty non-pk projection must not leave a dangling comma");
    }

    #[tokio::test]
    async fn fetch_batch_returns_rows_sorted_by_version() {
        use crate::testing::InMemoryDatabase;

        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 12, crate::types::ChangeType::Inserted, &[("id", 1)]);
        db.seed_change(&table, 10, crate::types::ChangeType::Inserted, &[("id", 2)]);
        db.seed_change(&table, 11, crate::types::ChangeType::Inserted, &[("id", 3)]);

        let worker = WorkerId::new("w1");
        let reader = ChangeReader::new(&table, &worker, 10, Duration::from_secs(30), 5);
        let batch = reader.fetch_batch(&db).await.unwrap();

        let versions: Vec<i64> = batch.iter().map(|r| r.version).collect();
        assert_eq!(versions, vec![10, 11, 12]);
    }

    #[tokio::test]
    async fn fetch_batch_respects_batch_size_cap() {
        use crate::testing::InMemoryDatabase;

        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        for i in 0..5 {
            db.seed_change(&table, 10 + i, crate::types::ChangeType::Inserted, &[("id", i)]);
        }

        let worker = WorkerId::new("w1");
        let reader = ChangeReader::new(&table, &worker, 2, Duration::from_secs(30), 5);
        let batch = reader.fetch_batch(&db).await.unwrap();

        assert_eq!(batch.len(), 2);
    }
}
