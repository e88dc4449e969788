//! # changetrack
//!
//! A distributed, lease-based coordination runtime for running a handler
//! over every row SQL Server's Change Tracking reports for a table, with no
//! cross-process state beyond the tracked database itself.
//!
//! ## Architecture
//!
//! ```text
//! SchemaProvisioner::start()
//!     │  resolve table, create GlobalState / Worker_Table_<id> /
//!     │  WorkerBatchSizes, seed GlobalState, announce liveness
//!     ▼
//! LeaseManager::run()  (one per tracked table, per worker process)
//!     │
//!     ├─► poll task ──► ChangeReader::fetch_batch() ──► Handler::handle()
//!     │                      │                               │
//!     │                      ▼                               ▼
//!     │                 preamble (I2)                release_leases +
//!     │                                              advance_global_version (I3)
//!     │
//!     ├─► renew task ──► renew_leases(), cancels handler on wedge (§4.3)
//!     │
//!     └─► housekeep task ──► cleanup_stale_workers(), liveness refresh (I5)
//!
//! ScaleMonitor::heartbeat()  (independent, read-only, no leases)
//!     │  samples change arrival rate vs. throughput → AddWorker / RemoveWorker / None
//! ```
//!
//! Every component above is generic over [`Database`], the seam described in
//! [`db`]. The production implementation (feature `mssql`) wraps the
//! `mssql-client` crate; [`testing::InMemoryDatabase`] (feature `testing`,
//! always available under `#[cfg(test)]`) enforces the identical contract in
//! plain Rust for this crate's own tests and for downstream integration
//! tests that don't want a live SQL Server.
//!
//! ## Example
//!
//! ```ignore
//! use changetrack::{Handler, FnHandler, LeaseManager, RunnerOptions, SchemaProvisioner, WorkerId};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn run(db: Arc<dyn changetrack::Database>) -> anyhow::Result<()> {
//! let worker = WorkerId::generate();
//! let options = RunnerOptions::from_env()?;
//!
//! let table = SchemaProvisioner::new("dbo.Widgets", &worker).start(db.as_ref()).await?;
//!
//! let handler = Arc::new(FnHandler(|batch, _cancel| async move {
//!     for row in &batch {
//!         tracing::info!(version = row.version, "processing change");
//!     }
//!     Ok(())
//! }));
//!
//! let manager = Arc::new(LeaseManager::new(table, worker, db, handler, options));
//! manager.run(CancellationToken::new()).await;
//! # Ok(())
//! # }
//! ```
//!
//! ## What This Is Not
//!
//! This crate is **not**:
//! - A function-runtime host binding (triggers, bindings, deployment — left
//!   to the embedding application)
//! - A generic outbox or job queue (see the host's own job system for that)
//! - A metrics or dashboarding layer (the crate emits `tracing` spans and
//!   events only; wiring those to a backend is the caller's job)

mod db;
mod handler;
mod lease;
mod reader;
mod schema;
mod scale;

pub mod error;
pub mod options;
pub mod types;

#[cfg(feature = "mssql")]
pub mod mssql;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use crate::db::{Database, PreambleOutcome, TableId};
pub use crate::error::{
    HandlerError, HandlerWedgeError, RunnerError, SchemaError, ShutdownError, TransientDatabaseError,
};
pub use crate::handler::{FnHandler, Handler};
pub use crate::lease::{compute_advance_version, LeaseManager, WorkerState};
pub use crate::options::{RunnerOptions, RunnerOptionsBuilder};
pub use crate::reader::{ChangeQueryBuilder, ChangeReader};
pub use crate::scale::ScaleMonitor;
pub use crate::schema::SchemaProvisioner;
pub use crate::types::{
    ChangeRow, ChangeType, ColumnValue, GlobalState, PrimaryKey, PrimaryKeyColumn, ScaleAction, ScaleHeartbeat,
    UserTableId, WorkerBatchSize, WorkerId,
};

// Re-export commonly used external types, matching the convention this
// stack's other crates follow for their own public trait boundaries.
pub use async_trait::async_trait;
