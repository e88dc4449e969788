//! An in-memory [`Database`] fake, feature-gated the same way the example
//! stack gates its own in-memory fakes for downstream integration tests
//! (`testing` feature; always compiled under `#[cfg(test)]` too).
//!
//! This is not a toy: it enforces I1 (lease exclusivity), I2 (version
//! monotonicity), I3 (retirement safety), I4 (poison quarantine), and I5
//! (worker liveness) exactly as a correct SQL Server implementation would,
//! just in plain Rust data structures protected by a `std::sync::Mutex`
//! (every critical section here is synchronous, so the lock is never held
//! across an `.await`). It is the single source of truth for "does the
//! coordination logic actually behave per §3/§4", and is what `tests/`
//! exercises the six end-to-end scenarios in §8 against.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::db::{Database, PreambleOutcome, TableId};
use crate::error::{RunnerError, SchemaError};
use crate::types::{ChangeRow, ChangeType, ColumnValue, GlobalState, PrimaryKey, PrimaryKeyColumn, WorkerId};

#[derive(Debug, Clone)]
struct SeededChange {
    version: i64,
    change_type: ChangeType,
    primary_key: PrimaryKey,
    data: PrimaryKey,
}

#[derive(Debug, Clone, Default)]
struct LeaseRow {
    lease_expiration: Option<DateTime<Utc>>,
    dequeue_count: i64,
    version_number: Option<i64>,
}

struct TableState {
    object_id: i64,
    qualified_name: String,
    pk_columns: Vec<PrimaryKeyColumn>,
    columns: Vec<String>,
    change_tracking_enabled: bool,
    min_valid_version: i64,
    database_id: i64,
    changes: Vec<SeededChange>,
    leases: HashMap<PrimaryKey, LeaseRow>,
    global_state: Option<GlobalState>,
    worker_batches: HashMap<WorkerId, (i64, DateTime<Utc>)>,
}

/// An in-memory stand-in for a SQL Server backend, implementing
/// [`Database`] directly in terms of the predicates §3/§4 describe rather
/// than generated SQL.
pub struct InMemoryDatabase {
    tables: Mutex<HashMap<String, TableState>>,
    next_object_id: Mutex<i64>,
    /// Overrides `now()` for deterministic lease-expiry and liveness tests
    /// (§8 scenario 4, I5). `None` means "use the real wall clock".
    now_override: Mutex<Option<DateTime<Utc>>>,
}

impl Default for InMemoryDatabase {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryDatabase {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(HashMap::new()),
            next_object_id: Mutex::new(1),
            now_override: Mutex::new(None),
        }
    }

    /// Convenience constructor: an in-memory database with one table
    /// already present, change tracking enabled at version 0.
    pub fn with_seeded_table(qualified_name: &str, pk_columns: &[&str]) -> Self {
        let db = Self::new();
        db.seed_table(qualified_name, pk_columns, true);
        db
    }

    /// Same, but change tracking is not enabled — used to exercise
    /// [`SchemaError::ChangeTrackingNotEnabled`].
    pub fn with_seeded_table_no_change_tracking(qualified_name: &str, pk_columns: &[&str]) -> Self {
        let db = Self::new();
        db.seed_table(qualified_name, pk_columns, false);
        db
    }

    fn seed_table(&self, qualified_name: &str, pk_columns: &[&str], change_tracking_enabled: bool) {
        let mut next_id = self.next_object_id.lock().unwrap();
        let object_id = *next_id;
        *next_id += 1;

        let pk_columns: Vec<PrimaryKeyColumn> = pk_columns
            .iter()
            .map(|name| PrimaryKeyColumn {
                name: name.to_string(),
                sql_type: "int".to_string(),
                length: None,
                precision_scale: None,
            })
            .collect();
        let columns = pk_columns.iter().map(|pk| pk.name.clone()).collect();

        let state = TableState {
            object_id,
            qualified_name: qualified_name.to_string(),
            pk_columns,
            columns,
            change_tracking_enabled,
            min_valid_version: 0,
            database_id: 1,
            changes: Vec::new(),
            leases: HashMap::new(),
            global_state: None,
            worker_batches: HashMap::new(),
        };

        self.tables.lock().unwrap().insert(qualified_name.to_string(), state);
    }

    fn now(&self) -> DateTime<Utc> {
        self.now_override.lock().unwrap().unwrap_or_else(Utc::now)
    }

    /// Advance the fake clock by `delta`, for lease-expiry and liveness
    /// tests that must not rely on real sleeps.
    pub fn advance_clock(&self, delta: Duration) {
        let mut guard = self.now_override.lock().unwrap();
        let base = guard.unwrap_or_else(Utc::now);
        *guard = Some(base + chrono::Duration::from_std(delta).unwrap());
    }

    fn with_table<R>(&self, table: &TableId, f: impl FnOnce(&mut TableState) -> Result<R, RunnerError>) -> Result<R, RunnerError> {
        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .ok_or_else(|| RunnerError::database(anyhow::anyhow!("unknown table id {}", table.object_id)))?;
        f(state)
    }

    /// Seed one change-table entry for a simple integer primary key `id`,
    /// with `data` defaulting to the primary key fields (sufficient for
    /// exercising the coordination logic, which never interprets row
    /// content; see [`crate::types::ColumnValue`]).
    pub fn seed_change(&self, table: &TableId, version: i64, change_type: ChangeType, pk: &[(&str, i64)]) {
        let mut key = PrimaryKey::new();
        for (name, value) in pk {
            key.insert((*name).to_string(), ColumnValue::Int(*value));
        }
        let data = if change_type == ChangeType::Deleted {
            key.clone()
        } else {
            key.clone()
        };

        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .expect("seed_change: unknown table");
        state.changes.push(SeededChange {
            version,
            change_type,
            primary_key: key,
            data,
        });
    }

    /// Force `GlobalState.RowsProcessed` to an arbitrary value, for tests
    /// that need to exercise wrap-around (P5) without processing
    /// `i64::MAX` rows of fixture data.
    pub fn set_rows_processed(&self, table: &TableId, value: i64) {
        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .expect("set_rows_processed: unknown table");
        if let Some(g) = state.global_state.as_mut() {
            g.rows_processed = value;
        }
    }

    /// Simulate the database's own background cleanup of aged-out change
    /// history: raises `CHANGE_TRACKING_MIN_VALID_VERSION` (§8 scenario 6 /
    /// the preamble's "AdvancedToMinValid" path).
    pub fn advance_min_valid_version(&self, table: &TableId, new_min: i64) {
        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .expect("advance_min_valid_version: unknown table");
        state.min_valid_version = state.min_valid_version.max(new_min);
    }

    /// Simulate the user database being dropped and recreated (§8
    /// scenario 5): bumps `database_id` and resets `min_valid_version`.
    pub fn recreate_database(&self, table: &TableId, new_min_valid_version: i64) {
        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .expect("recreate_database: unknown table");
        state.database_id += 1;
        state.min_valid_version = new_min_valid_version;
    }

    /// The net (coalesced) change per distinct primary key since the last
    /// committed `VersionNumber`, mirroring how `CHANGETABLE(CHANGES ...)`
    /// returns one row per key representing the net effect since the
    /// caller's baseline version, not one row per intermediate version.
    fn net_changes(state: &TableState) -> Vec<(PrimaryKey, i64, ChangeType, PrimaryKey)> {
        let mut latest: HashMap<PrimaryKey, (i64, ChangeType, PrimaryKey)> = HashMap::new();
        for change in &state.changes {
            let entry = latest.entry(change.primary_key.clone());
            match entry {
                std::collections::hash_map::Entry::Vacant(v) => {
                    v.insert((change.version, change.change_type, change.data.clone()));
                }
                std::collections::hash_map::Entry::Occupied(mut o) => {
                    if change.version >= o.get().0 {
                        o.insert((change.version, change.change_type, change.data.clone()));
                    }
                }
            }
        }
        latest
            .into_iter()
            .map(|(pk, (version, change_type, data))| (pk, version, change_type, data))
            .collect()
    }
}

#[async_trait]
impl Database for InMemoryDatabase {
    async fn resolve_table(&self, qualified_name: &str) -> Result<Option<TableId>, SchemaError> {
        let tables = self.tables.lock().unwrap();
        Ok(tables
            .get(qualified_name)
            .map(|t| TableId::new(t.object_id, t.qualified_name.clone())))
    }

    async fn primary_key_columns(&self, table: &TableId) -> Result<Vec<PrimaryKeyColumn>, SchemaError> {
        let tables = self.tables.lock().unwrap();
        let state = tables
            .values()
            .find(|t| t.object_id == table.object_id)
            .ok_or_else(|| SchemaError::TableNotFound {
                table: table.qualified_name.clone(),
            })?;
        Ok(state.pk_columns.clone())
    }

    async fn column_names(&self, table: &TableId) -> Result<Vec<String>, SchemaError> {
        let tables = self.tables.lock().unwrap();
        let state = tables
            .values()
            .find(|t| t.object_id == table.object_id)
            .ok_or_else(|| SchemaError::TableNotFound {
                table: table.qualified_name.clone(),
            })?;
        Ok(state.columns.clone())
    }

    async fn change_tracking_min_valid_version(&self, table: &TableId) -> Result<Option<i64>, SchemaError> {
        let tables = self.tables.lock().unwrap();
        let state = tables
            .values()
            .find(|t| t.object_id == table.object_id)
            .ok_or_else(|| SchemaError::TableNotFound {
                table: table.qualified_name.clone(),
            })?;
        Ok(state.change_tracking_enabled.then_some(state.min_valid_version))
    }

    async fn current_database_id(&self) -> Result<i64, SchemaError> {
        Ok(1)
    }

    async fn ensure_coordination_tables(
        &self,
        _table: &TableId,
        _pk_columns: &[PrimaryKeyColumn],
    ) -> Result<(), SchemaError> {
        // The in-memory fake has no physical tables to create; its state is
        // already allocated at seed time. This is a no-op that exists so
        // the call site's ordering (§4.1) is identical to production.
        Ok(())
    }

    async fn seed_global_state(
        &self,
        table: &TableId,
        min_valid_version: i64,
        database_id: i64,
    ) -> Result<(), SchemaError> {
        let mut tables = self.tables.lock().unwrap();
        let state = tables
            .values_mut()
            .find(|t| t.object_id == table.object_id)
            .ok_or_else(|| SchemaError::TableNotFound {
                table: table.qualified_name.clone(),
            })?;
        if state.global_state.is_none() {
            state.global_state = Some(GlobalState {
                user_table_id: crate::types::UserTableId(table.object_id),
                global_version_number: min_valid_version,
                database_id,
                rows_processed: 0,
            });
        }
        Ok(())
    }

    async fn upsert_worker_batch_size(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
    ) -> Result<(), RunnerError> {
        let now = self.now();
        self.with_table(table, |state| {
            state.worker_batches.insert(worker.clone(), (batch_size, now));
            Ok(())
        })
    }

    async fn run_change_reader_preamble(&self, table: &TableId) -> Result<PreambleOutcome, RunnerError> {
        self.with_table(table, |state| {
            let stored_database_id = state.global_state.map(|g| g.database_id).unwrap_or(state.database_id);
            if stored_database_id != state.database_id {
                state.leases.clear();
                let new_version = state.min_valid_version;
                if let Some(g) = state.global_state.as_mut() {
                    g.database_id = state.database_id;
                    g.global_version_number = new_version;
                }
                return Ok(PreambleOutcome::DatabaseRecreated {
                    new_version,
                    new_database_id: state.database_id,
                });
            }

            let current = state.global_state.map(|g| g.global_version_number).unwrap_or(0);
            if current < state.min_valid_version {
                let new_version = state.min_valid_version;
                if let Some(g) = state.global_state.as_mut() {
                    g.global_version_number = new_version;
                }
                return Ok(PreambleOutcome::AdvancedToMinValid { new_version });
            }

            Ok(PreambleOutcome::Unchanged)
        })
    }

    async fn fetch_and_lease_batch(
        &self,
        table: &TableId,
        worker: &WorkerId,
        batch_size: i64,
        lease_interval: Duration,
        max_dequeue_count: i64,
    ) -> Result<Vec<ChangeRow>, RunnerError> {
        let now = self.now();
        let lease_interval = chrono::Duration::from_std(lease_interval)
            .map_err(|e| RunnerError::database(anyhow::anyhow!("{e}")))?;

        self.with_table(table, |state| {
            let mut candidates = Self::net_changes(state);
            candidates.sort_by_key(|(_, version, _, _)| *version);

            let mut batch = Vec::new();
            for (pk, version, change_type, data) in candidates {
                if batch.len() as i64 >= batch_size {
                    break;
                }

                let lease = state.leases.get(&pk);
                let has_live_lease = lease
                    .and_then(|l| l.lease_expiration)
                    .map(|exp| exp > now)
                    .unwrap_or(false);
                if has_live_lease {
                    continue;
                }
                let already_processed = lease.and_then(|l| l.version_number).map(|v| v >= version).unwrap_or(false);
                if already_processed {
                    continue;
                }
                let poisoned = lease.map(|l| l.dequeue_count >= max_dequeue_count).unwrap_or(false);
                if poisoned {
                    continue;
                }

                let entry = state.leases.entry(pk.clone()).or_default();
                entry.lease_expiration = Some(now + lease_interval);
                entry.dequeue_count += 1;
                entry.version_number = Some(version);

                batch.push(ChangeRow::new(change_type, version, pk, data));
            }

            Ok(batch)
        })
    }

    async fn renew_leases(
        &self,
        table: &TableId,
        _worker: &WorkerId,
        batch: &[ChangeRow],
        lease_interval: Duration,
    ) -> Result<(), RunnerError> {
        let now = self.now();
        let lease_interval = chrono::Duration::from_std(lease_interval)
            .map_err(|e| RunnerError::database(anyhow::anyhow!("{e}")))?;

        self.with_table(table, |state| {
            for row in batch {
                if let Some(lease) = state.leases.get_mut(&row.primary_key) {
                    // Only renew if we still own it (version_number matches
                    // what we acquired); a faster peer may have already
                    // raced past us (§4.3 failure table: "other workers may
                    // double-process").
                    if lease.version_number == Some(row.version) {
                        lease.lease_expiration = Some(now + lease_interval);
                    }
                }
            }
            Ok(())
        })
    }

    async fn release_leases(&self, table: &TableId, worker: &WorkerId, batch: &[ChangeRow]) -> Result<(), RunnerError> {
        let now = self.now();
        self.with_table(table, |state| {
            for row in batch {
                let lease = state.leases.entry(row.primary_key.clone()).or_default();
                if lease.version_number.map(|v| row.version >= v).unwrap_or(true) {
                    lease.lease_expiration = None;
                    lease.dequeue_count = 0;
                    lease.version_number = Some(row.version);
                }
            }
            state.worker_batches.insert(worker.clone(), (batch.len() as i64, now));
            Ok(())
        })
    }

    async fn advance_global_version(
        &self,
        table: &TableId,
        new_version: i64,
        rows_delta: i64,
        max_dequeue_count: i64,
    ) -> Result<bool, RunnerError> {
        self.with_table(table, |state| {
            let unprocessed_exists = Self::net_changes(state).into_iter().any(|(pk, version, _, _)| {
                if version > new_version {
                    return false;
                }
                match state.leases.get(&pk) {
                    Some(lease) => {
                        let released_at_or_past = lease.lease_expiration.is_none() && lease.version_number.map(|v| v >= version).unwrap_or(false);
                        let poisoned = lease.dequeue_count >= max_dequeue_count;
                        !(released_at_or_past || poisoned)
                    }
                    None => true,
                }
            });

            if unprocessed_exists {
                return Ok(false);
            }

            let global = state
                .global_state
                .as_mut()
                .ok_or_else(|| RunnerError::database(anyhow::anyhow!("global state not seeded")))?;

            if new_version > global.global_version_number {
                global.global_version_number = new_version;
            }

            global.rows_processed = match global.rows_processed.checked_add(rows_delta) {
                Some(v) => v,
                None => rows_delta - (i64::MAX - global.rows_processed),
            };

            state.leases.retain(|_, lease| !lease.version_number.map(|v| v <= new_version).unwrap_or(false));

            Ok(true)
        })
    }

    async fn cleanup_stale_workers(
        &self,
        table: &TableId,
        self_worker: &WorkerId,
        older_than: Duration,
    ) -> Result<(), RunnerError> {
        let now = self.now();
        let older_than = chrono::Duration::from_std(older_than).map_err(|e| RunnerError::database(anyhow::anyhow!("{e}")))?;
        self.with_table(table, |state| {
            state
                .worker_batches
                .retain(|worker, (_, ts)| worker == self_worker || now - *ts < older_than);
            Ok(())
        })
    }

    async fn delete_worker(&self, table: &TableId, worker: &WorkerId) -> Result<(), RunnerError> {
        self.with_table(table, |state| {
            state.worker_batches.remove(worker);
            Ok(())
        })
    }

    async fn read_global_state(&self, table: &TableId) -> Result<GlobalState, RunnerError> {
        self.with_table(table, |state| {
            state
                .global_state
                .ok_or_else(|| RunnerError::database(anyhow::anyhow!("global state not seeded")))
        })
    }

    async fn count_changes(&self, table: &TableId, unprocessed_only: bool) -> Result<Option<i64>, RunnerError> {
        self.with_table(table, |state| {
            if !state.change_tracking_enabled {
                return Ok(None);
            }
            if !unprocessed_only {
                return Ok(Some(state.changes.len() as i64));
            }
            let count = Self::net_changes(state)
                .into_iter()
                .filter(|(pk, version, _, _)| {
                    state
                        .leases
                        .get(pk)
                        .and_then(|l| l.version_number)
                        .map(|v| v < *version)
                        .unwrap_or(true)
                })
                .count();
            Ok(Some(count as i64))
        })
    }

    async fn count_active_workers(&self, table: &TableId, within: Duration) -> Result<i64, RunnerError> {
        let now = self.now();
        let within = chrono::Duration::from_std(within).map_err(|e| RunnerError::database(anyhow::anyhow!("{e}")))?;
        self.with_table(table, |state| {
            Ok(state.worker_batches.values().filter(|(_, ts)| now - *ts <= within).count() as i64)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_table_finds_seeded_table() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap();
        assert!(table.is_some());
    }

    #[tokio::test]
    async fn resolve_table_is_none_for_unknown_table() {
        let db = InMemoryDatabase::new();
        let table = db.resolve_table("dbo.Nope").await.unwrap();
        assert!(table.is_none());
    }

    #[tokio::test]
    async fn fetch_and_lease_batch_enforces_lease_exclusivity() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 10, ChangeType::Inserted, &[("id", 1)]);

        let worker_a = WorkerId::new("a");
        let worker_b = WorkerId::new("b");

        let batch_a = db
            .fetch_and_lease_batch(&table, &worker_a, 10, Duration::from_secs(30), 5)
            .await
            .unwrap();
        assert_eq!(batch_a.len(), 1);

        let batch_b = db
            .fetch_and_lease_batch(&table, &worker_b, 10, Duration::from_secs(30), 5)
            .await
            .unwrap();
        assert!(batch_b.is_empty(), "worker B must not see A's live lease");
    }

    #[tokio::test]
    async fn expired_lease_is_stealable() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 10, ChangeType::Inserted, &[("id", 1)]);

        let worker_a = WorkerId::new("a");
        let worker_b = WorkerId::new("b");

        db.fetch_and_lease_batch(&table, &worker_a, 10, Duration::from_secs(1), 5)
            .await
            .unwrap();
        db.advance_clock(Duration::from_secs(2));

        let batch_b = db
            .fetch_and_lease_batch(&table, &worker_b, 10, Duration::from_secs(30), 5)
            .await
            .unwrap();
        assert_eq!(batch_b.len(), 1, "worker B should steal the expired lease");
    }

    #[tokio::test]
    async fn poison_quarantine_stops_redelivery() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 10, ChangeType::Inserted, &[("id", 1)]);
        let worker = WorkerId::new("w1");

        for _ in 0..3 {
            db.fetch_and_lease_batch(&table, &worker, 10, Duration::from_millis(1), 3)
                .await
                .unwrap();
            db.advance_clock(Duration::from_millis(5));
        }

        let batch = db
            .fetch_and_lease_batch(&table, &worker, 10, Duration::from_secs(30), 3)
            .await
            .unwrap();
        assert!(batch.is_empty(), "row should be poison-quarantined after MaxDequeueCount");
    }

    #[tokio::test]
    async fn advance_global_version_refuses_when_unprocessed_rows_remain() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 10, ChangeType::Inserted, &[("id", 1)]);
        db.seed_global_state(&table, 0, 1).await.unwrap();

        let advanced = db.advance_global_version(&table, 10, 1, 5).await.unwrap();
        assert!(!advanced, "row has neither a released lease nor poison status");
    }

    #[tokio::test]
    async fn advance_global_version_succeeds_once_lease_released() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_change(&table, 10, ChangeType::Inserted, &[("id", 1)]);
        db.seed_global_state(&table, 0, 1).await.unwrap();

        let worker = WorkerId::new("w1");
        let batch = db
            .fetch_and_lease_batch(&table, &worker, 10, Duration::from_secs(30), 5)
            .await
            .unwrap();
        db.release_leases(&table, &worker, &batch).await.unwrap();

        let advanced = db.advance_global_version(&table, 10, 1, 5).await.unwrap();
        assert!(advanced);
        let state = db.read_global_state(&table).await.unwrap();
        assert_eq!(state.global_version_number, 10);
    }

    #[tokio::test]
    async fn rows_processed_wraps_past_i64_max() {
        let db = InMemoryDatabase::with_seeded_table("dbo.Widgets", &["id"]);
        let table = db.resolve_table("dbo.Widgets").await.unwrap().unwrap();
        db.seed_global_state(&table, 0, 1).await.unwrap();
        {
            let mut tables = db.tables.lock().unwrap();
            let state = tables.values_mut().next().unwrap();
            state.global_state.as_mut().unwrap().rows_processed = i64::MAX - 5;
        }

        db.advance_global_version(&table, 0, 10, 5).await.unwrap();
        let state = db.read_global_state(&table).await.unwrap();
        assert_eq!(state.rows_processed, 5);
    }
}
