//! Reference wiring for a single worker process tracking one table.
//!
//! This is not the crate's public API surface — it's a copy-and-adapt
//! starting point for the embedding host, which owns connection-string
//! parsing, the function-runtime binding, and JSON serialization of the
//! handler's row payloads (all explicitly out of scope for this crate).
//!
//! ```bash
//! cargo run --example basic_worker --features mssql
//! ```

use std::sync::Arc;

use anyhow::{Context, Result};
use changetrack::{FnHandler, LeaseManager, RunnerOptions, SchemaProvisioner, WorkerId};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,changetrack=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(true))
        .init();

    let options = RunnerOptions::from_env().context("loading RunnerOptions")?;
    let worker = WorkerId::generate();

    let conn_str = std::env::var("CHANGETRACK_CONNECTION_STRING")
        .context("CHANGETRACK_CONNECTION_STRING must be set")?;
    let pool = mssql_client::Pool::connect(&conn_str)
        .await
        .context("connecting to SQL Server")?;
    let db: Arc<dyn changetrack::Database> = Arc::new(changetrack::mssql::MssqlDatabase::new(pool));

    let table = SchemaProvisioner::new("dbo.Widgets", &worker)
        .start(db.as_ref())
        .await
        .context("provisioning coordination schema")?;

    let handler = Arc::new(FnHandler(|batch, _cancel: CancellationToken| async move {
        for row in &batch {
            tracing::info!(change_type = %row.change_type, version = row.version, "processing change");
        }
        Ok(())
    }));

    let manager = Arc::new(LeaseManager::new(table, worker, db, handler, options));

    let shutdown = CancellationToken::new();
    tokio::select! {
        _ = manager.run(shutdown.clone()) => {}
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("shutdown requested");
            shutdown.cancel();
        }
    }

    Ok(())
}
