//! Structured error kinds for the runtime (§7).
//!
//! Each kind below is pattern-matchable on purpose: the Lease Manager reacts
//! differently to a [`SchemaError`] (fatal, propagates out of startup) than
//! to a [`TransientDatabaseError`] (logged, tick abandoned, retried) or a
//! [`HandlerWedgeError`] (cancel and treat as [`HandlerError`]). Collapsing
//! these into one generic `anyhow::Error` would make that dispatch
//! impossible without string matching.

use std::fmt;

use thiserror::Error;

/// Errors raised by the Schema Provisioner (§4.1, §7-1).
///
/// Always fatal to startup: the worker cannot run against a table it cannot
/// provision coordination state for.
#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("user table {table:?} does not exist or change tracking is not enabled on it")]
    TableNotFound { table: String },

    #[error(
        "change tracking is not enabled on table {table:?} or its database \
         (CHANGE_TRACKING_MIN_VALID_VERSION returned NULL)"
    )]
    ChangeTrackingNotEnabled { table: String },

    #[error("user table {table:?} has no primary key")]
    NoPrimaryKey { table: String },

    #[error("failed to provision coordination schema: {0}")]
    Backend(#[source] anyhow::Error),
}

/// Any exception during polling, renewal, or housekeeping (§7-2).
///
/// Never propagates past the task it occurred in: the affected tick is
/// abandoned, the in-memory batch is cleared, and the next tick retries.
#[derive(Debug, Error)]
#[error("transient database error: {0}")]
pub struct TransientDatabaseError(#[source] pub anyhow::Error);

/// The handler signalled failure, or decoding a batch for the handler threw
/// (§7-3). Leases are left to expire rather than explicitly released, so
/// another worker (or this one, after `LeaseInterval`) retries the row.
#[derive(Debug, Error)]
#[error("handler failed: {reason}")]
pub struct HandlerError {
    pub reason: String,
    #[source]
    pub source: Option<anyhow::Error>,
}

impl HandlerError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            source: None,
        }
    }

    pub fn from_source(reason: impl Into<String>, source: anyhow::Error) -> Self {
        Self {
            reason: reason.into(),
            source: Some(source),
        }
    }
}

/// Renewals exceeded `MaxLeaseRenewalCount`; the handler is assumed wedged
/// and its cancellation token has been triggered (§7-4). Treated thereafter
/// as a [`HandlerError`].
#[derive(Debug, Error)]
#[error("handler exceeded {max_lease_renewal_count} lease renewals and was cancelled")]
pub struct HandlerWedgeError {
    pub max_lease_renewal_count: u32,
}

impl From<HandlerWedgeError> for HandlerError {
    fn from(e: HandlerWedgeError) -> Self {
        HandlerError::new(e.to_string())
    }
}

/// Cancellation-induced shutdown (§7-5). Deliberately carries no detail: the
/// propagation policy requires this NOT be logged as an error.
#[derive(Error)]
#[error("shutdown requested")]
pub struct ShutdownError;

impl fmt::Debug for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ShutdownError")
    }
}

/// The aggregate error type returned by fallible public operations that
/// aren't already committed to one specific kind above (mainly
/// [`crate::db::Database`] methods, whose failures are reclassified by the
/// caller into one of the kinds above where the call site knows which kind
/// applies).
#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Schema(#[from] SchemaError),

    #[error(transparent)]
    Transient(#[from] TransientDatabaseError),

    #[error(transparent)]
    Handler(#[from] HandlerError),

    #[error(transparent)]
    HandlerWedge(#[from] HandlerWedgeError),

    #[error(transparent)]
    Shutdown(#[from] ShutdownError),

    /// An as-yet-unclassified database failure. `Database` implementations
    /// return this; call sites that know the operational context (a poll
    /// tick vs. startup provisioning) convert it into the kind above that
    /// matches §7's propagation policy.
    #[error("database error: {0}")]
    Database(#[source] anyhow::Error),
}

impl RunnerError {
    /// True for [`RunnerError::Shutdown`], the one kind §7 says must not be
    /// logged at error level.
    pub fn is_shutdown(&self) -> bool {
        matches!(self, RunnerError::Shutdown(_))
    }

    pub fn database(err: impl Into<anyhow::Error>) -> Self {
        RunnerError::Database(err.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_error_messages_name_the_table() {
        let err = SchemaError::TableNotFound {
            table: "dbo.Widgets".into(),
        };
        assert!(err.to_string().contains("dbo.Widgets"));
    }

    #[test]
    fn handler_wedge_converts_to_handler_error() {
        let wedge = HandlerWedgeError {
            max_lease_renewal_count: 5,
        };
        let handler: HandlerError = wedge.into();
        assert!(handler.reason.contains('5'));
    }

    #[test]
    fn runner_error_is_shutdown_only_for_shutdown_variant() {
        let shutdown: RunnerError = ShutdownError.into();
        assert!(shutdown.is_shutdown());

        let transient: RunnerError = TransientDatabaseError(anyhow::anyhow!("boom")).into();
        assert!(!transient.is_shutdown());
    }

    #[test]
    fn runner_error_database_wraps_arbitrary_errors() {
        let err = RunnerError::database(anyhow::anyhow!("connection reset"));
        assert!(err.to_string().contains("connection reset"));
    }
}
