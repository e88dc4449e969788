//! Lease Manager (§4.3): the concurrency core of a single worker for one
//! user table.
//!
//! Three `tokio::spawn`ed tasks — poll, renew, housekeep — cooperate over a
//! shared [`Shared`] struct guarded by a `tokio::sync::Mutex`. The poll task
//! is the only one that mutates the batch's membership or the
//! [`WorkerState`]; the renew task only reads/extends leases on the current
//! batch and may trigger the per-batch handler cancellation on wedge
//! detection (§4.3 item 2); the housekeep task never touches `Shared` at
//! all — it only talks to [`Database`].

use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::db::{Database, TableId};
use crate::handler::Handler;
use crate::options::RunnerOptions;
use crate::reader::ChangeReader;
use crate::types::{ChangeRow, WorkerId};

/// §4.3, §9 ("State machine replaces threading flags"): an explicit
/// two-variant state, not ad-hoc booleans.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    CheckingForChanges,
    ProcessingChanges,
}

struct Shared {
    state: WorkerState,
    batch: Vec<ChangeRow>,
    lease_renewal_count: u32,
    handler_cancel: Option<CancellationToken>,
}

impl Shared {
    fn new() -> Self {
        Self {
            state: WorkerState::CheckingForChanges,
            batch: Vec::new(),
            lease_renewal_count: 0,
            handler_cancel: None,
        }
    }
}

/// §9: "the second-highest `SYS_CHANGE_VERSION` in the batch, or the only
/// one if the batch has one element." Positional (by rank), not by distinct
/// value — see `DESIGN.md` for why duplicate top versions don't collapse.
///
/// # Panics
/// Never called with an empty batch: the poll task only reaches the release
/// step after confirming `batch` is non-empty.
pub fn compute_advance_version(batch: &[ChangeRow]) -> i64 {
    let mut versions: Vec<i64> = batch.iter().map(|r| r.version).collect();
    versions.sort_unstable();
    match versions.len() {
        0 => unreachable!("release-and-advance is never run on an empty batch"),
        1 => versions[0],
        n => versions[n - 2],
    }
}

/// Runs the poll/renew/housekeep trio for one `(table, worker)` pair.
pub struct LeaseManager {
    table: TableId,
    worker: WorkerId,
    db: Arc<dyn Database>,
    handler: Arc<dyn Handler>,
    options: RunnerOptions,
}

impl LeaseManager {
    pub fn new(
        table: TableId,
        worker: WorkerId,
        db: Arc<dyn Database>,
        handler: Arc<dyn Handler>,
        options: RunnerOptions,
    ) -> Self {
        Self {
            table,
            worker,
            db,
            handler,
            options,
        }
    }

    /// Runs until `shutdown` is cancelled, then stops the renew and
    /// housekeep tasks and waits for them (§5 "Cancellation & timeouts",
    /// §4.3 failure table's "Poll task terminates" row).
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let shared = Arc::new(Mutex::new(Shared::new()));

        let renew_cancel = shutdown.child_token();
        let housekeep_cancel = shutdown.child_token();

        let renew_handle = {
            let this = Arc::clone(&self);
            let shared = Arc::clone(&shared);
            let cancel = renew_cancel.clone();
            tokio::spawn(async move { this.renew_loop(shared, cancel).await })
        };
        let housekeep_handle = {
            let this = Arc::clone(&self);
            let cancel = housekeep_cancel.clone();
            tokio::spawn(async move { this.housekeep_loop(cancel).await })
        };

        self.poll_loop(Arc::clone(&shared), shutdown.clone()).await;

        renew_cancel.cancel();
        housekeep_cancel.cancel();
        if let Err(e) = renew_handle.await {
            error!(worker = %self.worker, error = %e, "renew task panicked");
        }
        if let Err(e) = housekeep_handle.await {
            error!(worker = %self.worker, error = %e, "housekeep task panicked");
        }
    }

    async fn poll_loop(&self, shared: Arc<Mutex<Shared>>, shutdown: CancellationToken) {
        info!(table = %self.table, worker = %self.worker, "poll task starting");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let reader = ChangeReader::new(
                &self.table,
                &self.worker,
                self.options.batch_size,
                self.options.lease_interval,
                self.options.max_dequeue_count as i64,
            );

            let batch = match reader.fetch_batch(self.db.as_ref()).await {
                Ok(batch) => batch,
                Err(e) => {
                    // §4.3 failure table: clear batch, log, stay in
                    // CheckingForChanges, sleep, retry.
                    warn!(table = %self.table, worker = %self.worker, error = %e, "fetch_batch failed; retrying next tick");
                    let mut guard = shared.lock().await;
                    guard.batch.clear();
                    guard.state = WorkerState::CheckingForChanges;
                    drop(guard);
                    if sleep_or_stop(&shutdown, self.options.polling_interval).await {
                        break;
                    }
                    continue;
                }
            };

            if batch.is_empty() {
                if sleep_or_stop(&shutdown, self.options.polling_interval).await {
                    break;
                }
                continue;
            }

            debug!(table = %self.table, worker = %self.worker, count = batch.len(), "entering ProcessingChanges");
            let handler_cancel = shutdown.child_token();
            {
                let mut guard = shared.lock().await;
                guard.batch = batch.clone();
                guard.state = WorkerState::ProcessingChanges;
                guard.lease_renewal_count = 0;
                guard.handler_cancel = Some(handler_cancel.clone());
            }

            let handler_result = self.handler.handle(batch.clone(), handler_cancel.clone()).await;

            // §5: renewal must not interleave with release, so the renew
            // task has to observe CheckingForChanges (and thus skip) before
            // release_and_advance touches the database — otherwise a
            // renew_tick can re-stamp LeaseExpirationTime on a key that
            // release_leases just released.
            {
                let mut guard = shared.lock().await;
                guard.batch.clear();
                guard.state = WorkerState::CheckingForChanges;
                guard.handler_cancel = None;
            }

            match handler_result {
                Ok(()) => {
                    self.release_and_advance(&batch).await;
                }
                Err(e) => {
                    // §4.3 failure table: leases are left to expire;
                    // DequeueCount already incremented at acquisition time,
                    // eventually poisoning (I4).
                    if handler_cancel.is_cancelled() {
                        warn!(table = %self.table, worker = %self.worker, "handler cancelled after exceeding max lease renewals");
                    } else {
                        warn!(table = %self.table, worker = %self.worker, error = %e, "handler failed; leases left to expire");
                    }
                }
            }
        }

        info!(table = %self.table, worker = %self.worker, "poll task stopped");
    }

    async fn release_and_advance(&self, batch: &[ChangeRow]) {
        let new_version = compute_advance_version(batch);

        if let Err(e) = self.db.release_leases(&self.table, &self.worker, batch).await {
            warn!(table = %self.table, worker = %self.worker, error = %e, "releasing leases failed; they will expire and be retried");
            return;
        }

        match self
            .db
            .advance_global_version(&self.table, new_version, batch.len() as i64, self.options.max_dequeue_count as i64)
            .await
        {
            Ok(true) => debug!(table = %self.table, new_version, "advanced GlobalVersionNumber"),
            Ok(false) => debug!(table = %self.table, new_version, "advance deferred: unprocessed rows remain at or below this version"),
            Err(e) => warn!(table = %self.table, error = %e, "advancing GlobalVersionNumber failed; next batch's advance will retry"),
        }
    }

    async fn renew_loop(&self, shared: Arc<Mutex<Shared>>, cancel: CancellationToken) {
        let cadence = self.options.renewal_cadence();
        let mut ticker = tokio::time::interval(cadence);
        ticker.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    self.renew_tick(&shared).await;
                }
            }
        }
    }

    async fn renew_tick(&self, shared: &Arc<Mutex<Shared>>) {
        let mut guard = shared.lock().await;
        if guard.state != WorkerState::ProcessingChanges || guard.batch.is_empty() {
            return;
        }

        let batch = guard.batch.clone();
        if let Err(e) = self
            .db
            .renew_leases(&self.table, &self.worker, &batch, self.options.lease_interval)
            .await
        {
            // §4.3 failure table: log, continue; a later tick or eventual
            // lease expiry covers the gap.
            warn!(table = %self.table, worker = %self.worker, error = %e, "lease renewal failed");
            return;
        }

        guard.lease_renewal_count += 1;
        if guard.lease_renewal_count >= self.options.max_lease_renewal_count {
            warn!(
                table = %self.table,
                worker = %self.worker,
                count = guard.lease_renewal_count,
                "handler exceeded max lease renewals; assuming wedged and cancelling"
            );
            if let Some(cancel) = guard.handler_cancel.take() {
                cancel.cancel();
            }
        }
    }

    async fn housekeep_loop(&self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.options.cleanup_interval);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self
                        .db
                        .cleanup_stale_workers(&self.table, &self.worker, self.options.cleanup_interval)
                        .await
                    {
                        warn!(table = %self.table, error = %e, "stale worker cleanup failed");
                    }
                    if let Err(e) = self.db.upsert_worker_batch_size(&self.table, &self.worker, 0).await {
                        warn!(table = %self.table, worker = %self.worker, error = %e, "liveness refresh failed");
                    }
                }
            }
        }

        if let Err(e) = self.db.delete_worker(&self.table, &self.worker).await {
            warn!(table = %self.table, worker = %self.worker, error = %e, "failed to delete liveness row on shutdown");
        }
        info!(table = %self.table, worker = %self.worker, "housekeep task stopped");
    }
}

/// Sleeps for `duration` unless `shutdown` fires first. Returns `true` if
/// shutdown fired (caller should stop the loop).
async fn sleep_or_stop(shutdown: &CancellationToken, duration: std::time::Duration) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => true,
        _ = tokio::time::sleep(duration) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::ChangeType;

    fn row(version: i64) -> ChangeRow {
        ChangeRow::new(
            ChangeType::Inserted,
            version,
            crate::types::PrimaryKey::new(),
            crate::types::PrimaryKey::new(),
        )
    }

    #[test]
    fn compute_advance_version_single_element_batch() {
        assert_eq!(compute_advance_version(&[row(12)]), 12);
    }

    #[test]
    fn compute_advance_version_is_second_highest() {
        assert_eq!(compute_advance_version(&[row(10), row(11), row(12)]), 11);
    }

    #[test]
    fn compute_advance_version_handles_unsorted_input() {
        assert_eq!(compute_advance_version(&[row(12), row(10), row(11)]), 11);
    }
}
