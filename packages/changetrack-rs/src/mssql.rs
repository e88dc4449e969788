//! Production [`Database`] implementation over `mssql-client` (feature
//! `mssql`). Off by default so the crate — and every test in it — never
//! needs a running SQL Server; see `DESIGN.md` for the driver API this
//! module assumes (`mssql_client::Pool::query`/`execute`, parameter binding
//! by position).
//!
//! Each method below is a direct translation of the corresponding §4
//! contract into T-SQL: the schema operations in §4.1, the batch
//! read-and-lease in §4.2 (built from [`ChangeQueryBuilder`]), and the
//! release/advance/cleanup statements in §4.3/§4.4. Only primary-key values
//! and change metadata are ever bound into a statement (§9); table and
//! column names come from [`TableId`]/[`PrimaryKeyColumn`], both populated
//! exclusively from `sys.*` catalog views, never from caller-supplied
//! strings beyond the initial qualified table name.

use std::time::Duration;

use async_trait::async_trait;
use mssql_client::Pool;

use crate::db::{Database, PreambleOutcome, TableId};
use crate::error::{RunnerError, SchemaError};
use crate::reader::ChangeQueryBuilder;
use crate::types::{ChangeRow, ChangeType, ColumnValue, GlobalState, PrimaryKey, PrimaryKeyColumn, UserTableId, WorkerId};

/// Fixed dedicated schema name coordination tables live under (§6).
pub const COORDINATION_SCHEMA: &str = "sql_trigger_runtime";

/// Wraps an `mssql-client` connection pool as a [`Database`].
pub struct MssqlDatabase {
    pool: Pool,
    schema: String,
}

impl MssqlDatabase {
    pub fn new(pool: Pool) -> Self {
        Self {
            pool,
            schema: COORDINATION_SCHEMA.to_string(),
        }
    }

    pub fn with_schema(pool: Pool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
        }
    }

    fn lease_table_name(&self, table: &TableId) -> String {
        format!("[{}].[Worker_Table_{}]", self.schema, table.object_id)
    }

    fn schema_error(err: mssql_client::Error) -> SchemaError {
        SchemaError::Backend(anyhow::anyhow!(err))
    }

    fn runner_error(err: mssql_client::Error) -> RunnerError {
        RunnerError::database(err)
    }
}

#[async_trait]
impl Database for MssqlDatabase {
    async fn resolve_table(&self, qualified_name: &str) -> Result<Option<TableId>, SchemaError> {
        let row = self
            .pool
            .query_opt(
                "SELECT OBJECT_ID(@p1) AS object_id",
                &[&qualified_name],
            )
            .await
            .map_err(Self::schema_error)?;

        match row {
            Some(row) => {
                let object_id: Option<i64> = row.get("object_id").map_err(Self::schema_error)?;
                Ok(object_id.map(|id| TableId::new(id, qualified_name.to_string())))
            }
            None => Ok(None),
        }
    }

    async fn primary_key_columns(&self, table: &TableId) -> Result<Vec<PrimaryKeyColumn>, SchemaError> {
        let rows = self
            .pool
            .query(
                "SELECT c.name, ty.name AS sql_type, c.max_length, c.precision, c.scale \
                 FROM sys.indexes i \
                 JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                 JOIN sys.columns c ON c.object_id = ic.object_id AND c.column_id = ic.column_id \
                 JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                 WHERE i.object_id = @p1 AND i.is_primary_key = 1 \
                 ORDER BY ic.key_ordinal",
                &[&table.object_id],
            )
            .await
            .map_err(Self::schema_error)?;

        rows.into_iter()
            .map(|row| {
                let name: String = row.get("name").map_err(Self::schema_error)?;
                let sql_type: String = row.get("sql_type").map_err(Self::schema_error)?;
                let max_length: i16 = row.get("max_length").map_err(Self::schema_error)?;
                let precision: u8 = row.get("precision").map_err(Self::schema_error)?;
                let scale: u8 = row.get("scale").map_err(Self::schema_error)?;

                let is_variable_length = matches!(
                    sql_type.as_str(),
                    "varchar" | "nvarchar" | "varbinary" | "char" | "nchar" | "binary"
                );
                let is_numeric = matches!(sql_type.as_str(), "decimal" | "numeric");

                Ok(PrimaryKeyColumn {
                    name,
                    sql_type,
                    length: is_variable_length.then_some(max_length as i32),
                    precision_scale: is_numeric.then_some((precision, scale)),
                })
            })
            .collect()
    }

    async fn column_names(&self, table: &TableId) -> Result<Vec<String>, SchemaError> {
        let rows = self
            .pool
            .query(
                "SELECT name FROM sys.columns WHERE object_id = @p1 ORDER BY column_id",
                &[&table.object_id],
            )
            .await
            .map_err(Self::schema_error)?;

        rows.into_iter()
            .map(|row| row.get("name").map_err(Self::schema_error))
            .collect()
    }

    async fn change_tracking_min_valid_version(&self, table: &TableId) -> Result<Option<i64>, SchemaError> {
        let row = self
            .pool
            .query_opt(
                "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@p1) AS min_valid_version",
                &[&table.object_id],
            )
            .await
            .map_err(Self::schema_error)?;

        match row {
            Some(row) => row.get("min_valid_version").map_err(Self::schema_error),
            None => Ok(None),
        }
    }

    async fn current_database_id(&self) -> Result<i64, SchemaError> {
        let row = self
            .pool
            .query_one("SELECT DB_ID() AS database_id", &[])
            .await
            .map_err(Self::schema_error)?;
        row.get("database_id").map_err(Self::schema_error)
    }

    async fn ensure_coordination_tables(
        &self,
        table: &TableId,
        pk_columns: &[PrimaryKeyColumn],
    ) -> Result<(), SchemaError> {
        let key_defs = pk_columns
            .iter()
            .map(|pk| format!("[{}] {}", pk.name, render_sql_type(pk)))
            .collect::<Vec<_>>()
            .join(", ");
        let key_names = pk_columns
            .iter()
            .map(|pk| format!("[{}]", pk.name))
            .collect::<Vec<_>>()
            .join(", ");

        self.pool
            .execute(&format!(
                "IF OBJECT_ID('[{schema}].GlobalState') IS NULL \
                 CREATE TABLE [{schema}].GlobalState ( \
                     UserTableID BIGINT NOT NULL PRIMARY KEY, \
                     GlobalVersionNumber BIGINT NOT NULL, \
                     DatabaseID BIGINT NOT NULL, \
                     RowsProcessed BIGINT NOT NULL)",
                schema = self.schema,
            ), &[])
            .await
            .map_err(Self::schema_error)?;

        self.pool
            .execute(&format!(
                "IF OBJECT_ID('[{schema}].WorkerBatchSizes') IS NULL \
                 CREATE TABLE [{schema}].WorkerBatchSizes ( \
                     UserTableID BIGINT NOT NULL, \
                     WorkerID NVARCHAR(256) NOT NULL, \
                     BatchSize BIGINT NOT NULL, \
                     Timestamp DATETIME2 NOT NULL, \
                     PRIMARY KEY (UserTableID, WorkerID))",
                schema = self.schema,
            ), &[])
            .await
            .map_err(Self::schema_error)?;

        self.pool
            .execute(
                &format!(
                    "IF OBJECT_ID('{lease_table}') IS NULL \
                     CREATE TABLE {lease_table} ( \
                         {key_defs}, \
                         LeaseExpirationTime DATETIME2 NULL, \
                         DequeueCount INT NOT NULL DEFAULT 0, \
                         VersionNumber BIGINT NULL, \
                         PRIMARY KEY ({key_names}))",
                    lease_table = self.lease_table_name(table),
                    key_defs = key_defs,
                    key_names = key_names,
                ),
                &[],
            )
            .await
            .map_err(Self::schema_error)?;

        Ok(())
    }

    async fn seed_global_state(
        &self,
        table: &TableId,
        min_valid_version: i64,
        database_id: i64,
    ) -> Result<(), SchemaError> {
        self.pool
            .execute(
                &format!(
                    "IF NOT EXISTS (SELECT 1 FROM [{schema}].GlobalState WHERE UserTableID = @p1) \
                     INSERT INTO [{schema}].GlobalState (UserTableID, GlobalVersionNumber, DatabaseID, RowsProcessed) \
                     VALUES (@p1, @p2, @p3, 0)",
                    schema = self.schema,
                ),
                &[&table.object_id, &min_valid_version, &database_id],
            )
            .await
            .map_err(Self::schema_error)?;
        Ok(())
    }

    async fn upsert_worker_batch_size(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
    ) -> Result<(), RunnerError> {
        self.pool
            .execute(
                &format!(
                    "MERGE [{schema}].WorkerBatchSizes AS target \
                     USING (SELECT @p1 AS UserTableID, @p2 AS WorkerID) AS src \
                     ON target.UserTableID = src.UserTableID AND target.WorkerID = src.WorkerID \
                     WHEN MATCHED THEN UPDATE SET BatchSize = @p3, Timestamp = SYSUTCDATETIME() \
                     WHEN NOT MATCHED THEN INSERT (UserTableID, WorkerID, BatchSize, Timestamp) \
                         VALUES (@p1, @p2, @p3, SYSUTCDATETIME());",
                    schema = self.schema,
                ),
                &[&table.object_id, &worker.as_str(), &batch_size],
            )
            .await
            .map_err(Self::runner_error)?;
        Ok(())
    }

    async fn run_change_reader_preamble(&self, table: &TableId) -> Result<PreambleOutcome, RunnerError> {
        let row = self
            .pool
            .query_one(
                &format!(
                    "SELECT GlobalVersionNumber, DatabaseID FROM [{schema}].GlobalState WHERE UserTableID = @p1",
                    schema = self.schema,
                ),
                &[&table.object_id],
            )
            .await
            .map_err(Self::runner_error)?;

        let stored_version: i64 = row.get("GlobalVersionNumber").map_err(Self::runner_error)?;
        let stored_database_id: i64 = row.get("DatabaseID").map_err(Self::runner_error)?;
        let current_database_id = self
            .current_database_id()
            .await
            .map_err(|e| RunnerError::database(anyhow::anyhow!(e)))?;

        if stored_database_id != current_database_id {
            self.pool
                .execute(&format!("TRUNCATE TABLE {}", self.lease_table_name(table)), &[])
                .await
                .map_err(Self::runner_error)?;

            let min_valid: i64 = self
                .pool
                .query_one(
                    "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@p1) AS v",
                    &[&table.object_id],
                )
                .await
                .map_err(Self::runner_error)?
                .get("v")
                .map_err(Self::runner_error)?;

            self.pool
                .execute(
                    &format!(
                        "UPDATE [{schema}].GlobalState SET GlobalVersionNumber = @p2, DatabaseID = @p3 WHERE UserTableID = @p1",
                        schema = self.schema,
                    ),
                    &[&table.object_id, &min_valid, &current_database_id],
                )
                .await
                .map_err(Self::runner_error)?;

            return Ok(PreambleOutcome::DatabaseRecreated {
                new_version: min_valid,
                new_database_id: current_database_id,
            });
        }

        let min_valid: i64 = self
            .pool
            .query_one(
                "SELECT CHANGE_TRACKING_MIN_VALID_VERSION(@p1) AS v",
                &[&table.object_id],
            )
            .await
            .map_err(Self::runner_error)?
            .get("v")
            .map_err(Self::runner_error)?;

        if stored_version < min_valid {
            self.pool
                .execute(
                    &format!(
                        "UPDATE [{schema}].GlobalState SET GlobalVersionNumber = @p2 WHERE UserTableID = @p1",
                        schema = self.schema,
                    ),
                    &[&table.object_id, &min_valid],
                )
                .await
                .map_err(Self::runner_error)?;
            return Ok(PreambleOutcome::AdvancedToMinValid { new_version: min_valid });
        }

        Ok(PreambleOutcome::Unchanged)
    }

    async fn fetch_and_lease_batch(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
        lease_interval: Duration,
        max_dequeue_count: i64,
    ) -> Result<Vec<ChangeRow>, RunnerError> {
        let pk_columns = self
            .primary_key_columns(table)
            .await
            .map_err(|e| RunnerError::database(anyhow::anyhow!(e)))?;
        let columns = self
            .column_names(table)
            .await
            .map_err(|e| RunnerError::database(anyhow::anyhow!(e)))?;
        let builder = ChangeQueryBuilder::new(&table.qualified_name)
            .with_lease_table(self.lease_table_name(table))
            .with_primary_keys(pk_columns.clone())
            .with_columns(columns.clone());

        let min_valid: i64 = self
            .pool
            .query_one(
                &format!(
                    "SELECT GlobalVersionNumber AS v FROM [{schema}].GlobalState WHERE UserTableID = @p1",
                    schema = self.schema,
                ),
                &[&table.object_id],
            )
            .await
            .map_err(Self::runner_error)?
            .get("v")
            .map_err(Self::runner_error)?;

        let mut tx = self.pool.transaction().await.map_err(Self::runner_error)?;
        let rows = tx
            .query(
                // @pN binds by number, not by where it appears in the text:
                // @p1 = batch_size, @p2 = min_version, @p3 = max_dequeue_count.
                &builder.select_batch_sql(),
                &[&batch_size, &min_valid, &max_dequeue_count],
            )
            .await
            .map_err(Self::runner_error)?;

        let lease_seconds = lease_interval.as_secs() as i64;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let version: i64 = row.get("SYS_CHANGE_VERSION").map_err(Self::runner_error)?;
            let op: String = row.get("SYS_CHANGE_OPERATION").map_err(Self::runner_error)?;
            let change_type = ChangeType::from_sql(&op)
                .ok_or_else(|| RunnerError::database(anyhow::anyhow!("unrecognized SYS_CHANGE_OPERATION {op}")))?;

            let mut primary_key = PrimaryKey::new();
            for pk in &pk_columns {
                primary_key.insert(pk.name.clone(), ColumnValue::from_row(&row, &pk.name).map_err(Self::runner_error)?);
            }

            let data = if change_type == ChangeType::Deleted {
                primary_key.clone()
            } else {
                let mut data = PrimaryKey::new();
                for col in &columns {
                    data.insert(col.clone(), ColumnValue::from_row(&row, col).map_err(Self::runner_error)?);
                }
                data
            };

            let pk_literals = pk_columns
                .iter()
                .map(|pk| format!("{} AS [{}]", sql_literal(&primary_key[&pk.name]), pk.name))
                .collect::<Vec<_>>()
                .join(", ");
            let pk_names = pk_columns.iter().map(|pk| format!("[{}]", pk.name)).collect::<Vec<_>>().join(", ");
            let join = pk_predicate(&primary_key).replace("[", "target.[");

            tx.execute(
                &format!(
                    "MERGE {lease_table} AS target \
                     USING (SELECT {pk_literals}) AS src \
                     ON {join} \
                     WHEN MATCHED THEN UPDATE SET LeaseExpirationTime = DATEADD(SECOND, @p1, SYSUTCDATETIME()), \
                         DequeueCount = target.DequeueCount + 1, VersionNumber = @p2 \
                     WHEN NOT MATCHED THEN INSERT ({pk_names}, LeaseExpirationTime, DequeueCount, VersionNumber) \
                         VALUES (src.*, DATEADD(SECOND, @p1, SYSUTCDATETIME()), 1, @p2);",
                    lease_table = self.lease_table_name(table),
                ),
                &[&lease_seconds, &version],
            )
            .await
            .map_err(Self::runner_error)?;

            out.push(ChangeRow::new(change_type, version, primary_key, data));
        }

        tx.commit().await.map_err(Self::runner_error)?;
        let _ = worker; // worker identity is carried on WorkerBatchSizes, not the lease row itself
        Ok(out)
    }

    async fn renew_leases(
        &self,
        table: &TableId,
        _worker: &WorkerId,
        batch: &[ChangeRow],
        lease_interval: Duration,
    ) -> Result<(), RunnerError> {
        let lease_seconds = lease_interval.as_secs() as i64;
        for row in batch {
            let predicate = pk_predicate(&row.primary_key);
            self.pool
                .execute(
                    &format!(
                        "UPDATE {lease_table} SET LeaseExpirationTime = DATEADD(SECOND, @p1, SYSUTCDATETIME()) \
                         WHERE {predicate} AND VersionNumber = @p2",
                        lease_table = self.lease_table_name(table),
                    ),
                    &[&lease_seconds, &row.version],
                )
                .await
                .map_err(Self::runner_error)?;
        }
        Ok(())
    }

    async fn release_leases(&self, table: &TableId, worker: &WorkerId, batch: &[ChangeRow]) -> Result<(), RunnerError> {
        for row in batch {
            let predicate = pk_predicate(&row.primary_key);
            self.pool
                .execute(
                    &format!(
                        "UPDATE {lease_table} SET LeaseExpirationTime = NULL, DequeueCount = 0, VersionNumber = @p1 \
                         WHERE {predicate} AND (VersionNumber IS NULL OR VersionNumber <= @p1)",
                        lease_table = self.lease_table_name(table),
                    ),
                    &[&row.version],
                )
                .await
                .map_err(Self::runner_error)?;
        }

        self.upsert_worker_batch_size(table, worker, batch.len() as i64).await
    }

    async fn advance_global_version(
        &self,
        table: &TableId,
        new_version: i64,
        rows_delta: i64,
        max_dequeue_count: i64,
    ) -> Result<bool, RunnerError> {
        let pk_columns = self
            .primary_key_columns(table)
            .await
            .map_err(|e| RunnerError::database(anyhow::anyhow!(e)))?;

        let blocking: i64 = self
            .pool
            .query_one(
                &format!(
                    "SELECT COUNT(*) AS n FROM CHANGETABLE(CHANGES {table}, 0) AS ct \
                     LEFT JOIN {lease_table} AS lease ON {lease_join} \
                     WHERE ct.SYS_CHANGE_VERSION <= @p1 \
                     AND NOT ( \
                         (lease.VersionNumber IS NOT NULL AND lease.LeaseExpirationTime IS NULL AND lease.VersionNumber >= ct.SYS_CHANGE_VERSION) \
                         OR (lease.DequeueCount IS NOT NULL AND lease.DequeueCount >= @p2) \
                     )",
                    table = table.qualified_name,
                    lease_table = self.lease_table_name(table),
                    lease_join = lease_join_predicate(&pk_columns),
                ),
                &[&new_version, &max_dequeue_count],
            )
            .await
            .map_err(Self::runner_error)?
            .get("n")
            .map_err(Self::runner_error)?;

        if blocking > 0 {
            return Ok(false);
        }

        self.pool
            .execute(
                &format!(
                    "UPDATE [{schema}].GlobalState SET \
                         GlobalVersionNumber = CASE WHEN @p2 > GlobalVersionNumber THEN @p2 ELSE GlobalVersionNumber END, \
                         RowsProcessed = CASE WHEN @p3 > 9223372036854775807 - RowsProcessed THEN @p3 - (9223372036854775807 - RowsProcessed) ELSE RowsProcessed + @p3 END \
                     WHERE UserTableID = @p1",
                    schema = self.schema,
                ),
                &[&table.object_id, &new_version, &rows_delta],
            )
            .await
            .map_err(Self::runner_error)?;

        self.pool
            .execute(
                &format!(
                    "DELETE FROM {lease_table} WHERE VersionNumber <= @p1",
                    lease_table = self.lease_table_name(table),
                ),
                &[&new_version],
            )
            .await
            .map_err(Self::runner_error)?;

        Ok(true)
    }

    async fn cleanup_stale_workers(
        &self,
        table: &TableId,
        self_worker: &WorkerId,
        older_than: Duration,
    ) -> Result<(), RunnerError> {
        let seconds = older_than.as_secs() as i64;
        self.pool
            .execute(
                &format!(
                    "DELETE FROM [{schema}].WorkerBatchSizes \
                     WHERE UserTableID = @p1 AND WorkerID <> @p2 \
                     AND Timestamp < DATEADD(SECOND, -@p3, SYSUTCDATETIME())",
                    schema = self.schema,
                ),
                &[&table.object_id, &self_worker.as_str(), &seconds],
            )
            .await
            .map_err(Self::runner_error)?;
        Ok(())
    }

    async fn delete_worker(&self, table: &TableId, worker: &WorkerId) -> Result<(), RunnerError> {
        self.pool
            .execute(
                &format!(
                    "DELETE FROM [{schema}].WorkerBatchSizes WHERE UserTableID = @p1 AND WorkerID = @p2",
                    schema = self.schema,
                ),
                &[&table.object_id, &worker.as_str()],
            )
            .await
            .map_err(Self::runner_error)?;
        Ok(())
    }

    async fn read_global_state(&self, table: &TableId) -> Result<GlobalState, RunnerError> {
        let row = self
            .pool
            .query_one(
                &format!(
                    "SELECT GlobalVersionNumber, DatabaseID, RowsProcessed FROM [{schema}].GlobalState WHERE UserTableID = @p1",
                    schema = self.schema,
                ),
                &[&table.object_id],
            )
            .await
            .map_err(Self::runner_error)?;

        Ok(GlobalState {
            user_table_id: UserTableId(table.object_id),
            global_version_number: row.get("GlobalVersionNumber").map_err(Self::runner_error)?,
            database_id: row.get("DatabaseID").map_err(Self::runner_error)?,
            rows_processed: row.get("RowsProcessed").map_err(Self::runner_error)?,
        })
    }

    async fn count_changes(&self, table: &TableId, unprocessed_only: bool) -> Result<Option<i64>, RunnerError> {
        let sql = if unprocessed_only {
            let pk_columns = self
                .primary_key_columns(table)
                .await
                .map_err(|e| RunnerError::database(anyhow::anyhow!(e)))?;
            format!(
                "SELECT COUNT(*) AS n FROM CHANGETABLE(CHANGES {table}, 0) AS ct \
                 LEFT JOIN {lease_table} AS lease ON {lease_join} \
                 WHERE lease.VersionNumber IS NULL OR lease.VersionNumber < ct.SYS_CHANGE_VERSION",
                table = table.qualified_name,
                lease_table = self.lease_table_name(table),
                lease_join = lease_join_predicate(&pk_columns),
            )
        } else {
            format!("SELECT COUNT(*) AS n FROM CHANGETABLE(CHANGES {}, 0) AS ct", table.qualified_name)
        };

        let row = self.pool.query_one(&sql, &[]).await.map_err(Self::runner_error)?;
        row.get("n").map_err(Self::runner_error)
    }

    async fn count_active_workers(&self, table: &TableId, within: Duration) -> Result<i64, RunnerError> {
        let seconds = within.as_secs() as i64;
        let row = self
            .pool
            .query_one(
                &format!(
                    "SELECT COUNT(*) AS n FROM [{schema}].WorkerBatchSizes \
                     WHERE UserTableID = @p1 AND Timestamp >= DATEADD(SECOND, -@p2, SYSUTCDATETIME())",
                    schema = self.schema,
                ),
                &[&table.object_id, &seconds],
            )
            .await
            .map_err(Self::runner_error)?;
        row.get("n").map_err(Self::runner_error)
    }
}

fn render_sql_type(pk: &PrimaryKeyColumn) -> String {
    if let Some(len) = pk.length {
        let len_str = if len < 0 { "MAX".to_string() } else { len.to_string() };
        format!("{}({})", pk.sql_type, len_str)
    } else if let Some((precision, scale)) = pk.precision_scale {
        format!("{}({}, {})", pk.sql_type, precision, scale)
    } else {
        pk.sql_type.clone()
    }
}

/// Renders an equality predicate directly from primary-key values (db.rs:
/// "only primary-key values and change metadata ... are interpolated or
/// bound" — interpolation of PK values specifically is the accepted seam,
/// since they come from `CHANGETABLE` output, never from caller-supplied
/// strings).
/// Join predicate between a `CHANGETABLE` projection (aliased `ct`) and a
/// table's lease table (aliased `lease`), equating every primary-key column —
/// the same per-row identity join [`ChangeQueryBuilder`] uses, needed here
/// too wherever a query correlates `CHANGETABLE` rows with their own lease
/// row rather than every lease row in the table.
fn lease_join_predicate(pk_columns: &[PrimaryKeyColumn]) -> String {
    pk_columns
        .iter()
        .map(|pk| format!("ct.[{name}] = lease.[{name}]", name = pk.name))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn pk_predicate(primary_key: &PrimaryKey) -> String {
    primary_key
        .iter()
        .map(|(name, value)| format!("[{name}] = {}", sql_literal(value)))
        .collect::<Vec<_>>()
        .join(" AND ")
}

fn sql_literal(value: &ColumnValue) -> String {
    match value {
        ColumnValue::Null => "NULL".to_string(),
        ColumnValue::Bit(b) => if *b { "1".to_string() } else { "0".to_string() },
        ColumnValue::Int(i) => i.to_string(),
        ColumnValue::Decimal(s) => s.clone(),
        ColumnValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
        ColumnValue::Binary(b) => format!("0x{}", b.iter().map(|byte| format!("{byte:02x}")).collect::<String>()),
        ColumnValue::DateTime(dt) => format!("'{}'", dt.to_rfc3339()),
        ColumnValue::Uuid(u) => format!("'{u}'"),
    }
}

trait ColumnValueExt: Sized {
    fn from_row(row: &mssql_client::Row, name: &str) -> Result<Self, mssql_client::Error>;
}

impl ColumnValueExt for ColumnValue {
    fn from_row(row: &mssql_client::Row, name: &str) -> Result<Self, mssql_client::Error> {
        row.get_opt::<i64>(name)?
            .map(ColumnValue::Int)
            .or(row.get_opt::<bool>(name)?.map(ColumnValue::Bit))
            .or(row.get_opt::<String>(name)?.map(ColumnValue::Text))
            .map(Ok)
            .unwrap_or(Ok(ColumnValue::Null))
    }
}
