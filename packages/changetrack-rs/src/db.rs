//! The seam between coordination logic and the SQL Server driver (§9 glossary:
//! "`Database` trait").
//!
//! Every other module in this crate — [`crate::schema::SchemaProvisioner`],
//! [`crate::reader::ChangeReader`], [`crate::lease::LeaseManager`], and
//! [`crate::scale::ScaleMonitor`] — is generic over `dyn Database`. The
//! production implementation (feature `mssql`, see [`crate::mssql`]) wraps
//! the `mssql-client` crate, the only CHANGETABLE-capable driver in this
//! stack. The test implementation ([`crate::testing::InMemoryDatabase`])
//! simulates the same contract without a live server.
//!
//! Operations here are deliberately domain-level (`fetch_and_lease_batch`,
//! not `execute_raw_sql`): the predicate and the lease acquisition described
//! in §4.2 happen inside one transaction on the real driver, and the
//! in-memory fake can enforce the identical invariant in plain Rust. Pushing
//! raw SQL fragments across this boundary would make that parity impossible
//! to verify without a live database.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::{RunnerError, SchemaError};
use crate::types::{ChangeRow, GlobalState, PrimaryKeyColumn, WorkerId};

/// A user table's identity as seen by this crate: its SQL object id plus the
/// normalized, already-quoted name used to build per-table SQL (§9: "only
/// primary-key values and change metadata ... are interpolated or bound").
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableId {
    pub object_id: i64,
    pub qualified_name: String,
}

impl TableId {
    pub fn new(object_id: i64, qualified_name: impl Into<String>) -> Self {
        Self {
            object_id,
            qualified_name: qualified_name.into(),
        }
    }
}

impl std::fmt::Display for TableId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.qualified_name)
    }
}

/// Outcome of the Change Reader's preamble (§4.2: "Before the read, a
/// preamble statement refreshes `GlobalState.GlobalVersionNumber`").
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreambleOutcome {
    /// `GlobalVersionNumber` was left untouched; no recreation or cleanup
    /// was detected.
    Unchanged,
    /// The database's `CHANGE_TRACKING_MIN_VALID_VERSION` advanced past the
    /// stored `GlobalVersionNumber` (background cleanup of old changes);
    /// the stored value was advanced to match (I2).
    AdvancedToMinValid { new_version: i64 },
    /// `DatabaseID` no longer matches the stored value: the database was
    /// recreated. The lease table was truncated and the version reset to
    /// the current `CHANGE_TRACKING_MIN_VALID_VERSION` (I2, scenario 5).
    DatabaseRecreated { new_version: i64, new_database_id: i64 },
}

/// The seam every coordination module is generic over.
///
/// Implementations must uphold I1 (lease exclusivity) by performing the
/// read-predicate-then-acquire in [`fetch_and_lease_batch`] atomically —
/// within one transaction on a real database, within one critical section
/// on the in-memory fake.
#[async_trait]
pub trait Database: Send + Sync {
    /// §4.1 step 1: resolve the user table's object id, or `None` if it
    /// does not exist.
    async fn resolve_table(&self, qualified_name: &str) -> Result<Option<TableId>, SchemaError>;

    /// §4.1 step 2: the user table's primary-key columns with declared SQL
    /// types, in declaration order. Empty means "no primary key" and the
    /// caller raises [`SchemaError::NoPrimaryKey`].
    async fn primary_key_columns(&self, table: &TableId) -> Result<Vec<PrimaryKeyColumn>, SchemaError>;

    /// §4.1 step 3: every column name on the user table, used by the
    /// Change Reader's query builder to project row values for
    /// insert/update changes.
    async fn column_names(&self, table: &TableId) -> Result<Vec<String>, SchemaError>;

    /// The database's current `CHANGE_TRACKING_MIN_VALID_VERSION` for this
    /// table, or `None` if change tracking is not enabled (§4.1 step 5).
    async fn change_tracking_min_valid_version(&self, table: &TableId) -> Result<Option<i64>, SchemaError>;

    /// A stable identifier for the current physical database, used to
    /// detect database recreation (I2).
    async fn current_database_id(&self) -> Result<i64, SchemaError>;

    /// §4.1 step 4: create `GlobalState`, `Worker_Table_<id>`, and
    /// `WorkerBatchSizes` if absent, using `pk_columns`' declared types
    /// verbatim for the lease table's key columns.
    async fn ensure_coordination_tables(
        &self,
        table: &TableId,
        pk_columns: &[PrimaryKeyColumn],
    ) -> Result<(), SchemaError>;

    /// §4.1 step 5: insert the `GlobalState` row if absent.
    async fn seed_global_state(
        &self,
        table: &TableId,
        min_valid_version: i64,
        database_id: i64,
    ) -> Result<(), SchemaError>;

    /// §4.1 step 6: announce liveness with `BatchSize = 0`.
    async fn upsert_worker_batch_size(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
    ) -> Result<(), RunnerError>;

    /// §4.2 preamble: detect and repair recreation / background cleanup.
    /// Runs as its own statement(s), deliberately not wrapped in the same
    /// transaction as the batch read (§9 open question — preserved, not
    /// silently fixed).
    async fn run_change_reader_preamble(&self, table: &TableId) -> Result<PreambleOutcome, RunnerError>;

    /// §4.2: read, in one transaction, up to `batch_size` unclaimed or
    /// lease-expired, non-poisoned change rows ordered ascending by
    /// `SYS_CHANGE_VERSION`, and acquire a lease on each (I1).
    #[allow(clippy::too_many_arguments)]
    async fn fetch_and_lease_batch(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
        lease_interval: Duration,
        max_dequeue_count: i64,
    ) -> Result<Vec<ChangeRow>, RunnerError>;

    /// §4.3 renew task: re-stamp `LeaseExpirationTime = now + lease_interval`
    /// on every key in `batch`, only for rows this worker still owns.
    async fn renew_leases(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch: &[ChangeRow],
        lease_interval: Duration,
    ) -> Result<(), RunnerError>;

    /// §4.3 release-and-advance step 2: for each row in `batch` whose
    /// stored `VersionNumber` is `<= row.version`, release the lease
    /// (null `LeaseExpirationTime`, zero `DequeueCount`, write
    /// `VersionNumber`), then upsert this worker's `BatchSize`.
    async fn release_leases(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch: &[ChangeRow],
    ) -> Result<(), RunnerError>;

    /// §4.3 release-and-advance step 3: if no unprocessed change exists
    /// with `SYS_CHANGE_VERSION <= new_version`, advance
    /// `GlobalState.GlobalVersionNumber` to `new_version`, delete all
    /// `Worker_Table_<id>` rows with `VersionNumber <= new_version`, and
    /// add `rows_delta` to `RowsProcessed` (wrapping at `i64::MAX`, §9).
    /// Returns whether the advance actually happened.
    async fn advance_global_version(
        &self,
        table: &TableId,
        new_version: i64,
        rows_delta: i64,
        max_dequeue_count: i64,
    ) -> Result<bool, RunnerError>;

    /// §4.3 housekeep task: delete `WorkerBatchSizes` rows whose
    /// `Timestamp` is older than `older_than` (I5), excluding `self_worker`.
    async fn cleanup_stale_workers(
        &self,
        table: &TableId,
        self_worker: &WorkerId,
        older_than: Duration,
    ) -> Result<(), RunnerError>;

    /// Delete this worker's own `WorkerBatchSizes` row on clean shutdown.
    async fn delete_worker(&self, table: &TableId, worker: &WorkerId) -> Result<(), RunnerError>;

    /// Current `GlobalState` row for `table`.
    async fn read_global_state(&self, table: &TableId) -> Result<GlobalState, RunnerError>;

    /// §4.4 step 1: count of rows in the change table. `unprocessed_only`
    /// selects between "all changes since the retained minimum" (default)
    /// and "changes with no released lease yet".
    async fn count_changes(&self, table: &TableId, unprocessed_only: bool) -> Result<Option<i64>, RunnerError>;

    /// §4.4 step 8: count of `WorkerBatchSizes` rows whose `Timestamp` is
    /// within `within` of now.
    async fn count_active_workers(&self, table: &TableId, within: Duration) -> Result<i64, RunnerError>;
}
