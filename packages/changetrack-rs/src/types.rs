//! Shared value types for rows, primary keys, and scale recommendations.
//!
//! These types are the vocabulary every other module in this crate speaks:
//! [`ColumnValue`] is how a change row's data crosses the [`crate::db::Database`]
//! boundary, [`PrimaryKey`] is how the lease tables key on a user table's
//! primary-key tuple, and [`ChangeRow`] is what the handler contract (§6)
//! receives.

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use uuid::Uuid;

/// A single value read from (or bound into) a SQL Server column.
///
/// This is intentionally a small, closed set: the core only ever needs to
/// carry primary-key values, change-tracking metadata, and opaque row data
/// through to the handler. It never interprets the data itself.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ColumnValue {
    Null,
    Bit(bool),
    Int(i64),
    /// Decimal/numeric/money types, carried as their SQL Server text
    /// representation to avoid committing this crate to a particular
    /// fixed-point type.
    Decimal(String),
    Text(String),
    Binary(Bytes),
    DateTime(DateTime<Utc>),
    Uuid(Uuid),
}

impl fmt::Display for ColumnValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ColumnValue::Null => write!(f, "NULL"),
            ColumnValue::Bit(b) => write!(f, "{b}"),
            ColumnValue::Int(i) => write!(f, "{i}"),
            ColumnValue::Decimal(s) => write!(f, "{s}"),
            ColumnValue::Text(s) => write!(f, "{s}"),
            ColumnValue::Binary(b) => write!(f, "0x{}", hex_encode(b)),
            ColumnValue::DateTime(dt) => write!(f, "{}", dt.to_rfc3339()),
            ColumnValue::Uuid(u) => write!(f, "{u}"),
        }
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// An ordered map from column name to value, used both for a table's
/// primary-key tuple and for the full set of columns on a change row.
///
/// `BTreeMap` (rather than `HashMap`) gives deterministic iteration order,
/// which matters because the lease tables are keyed on the whole tuple and
/// two `PrimaryKey`s built from the same columns in a different insertion
/// order must compare and hash equal.
pub type PrimaryKey = BTreeMap<String, ColumnValue>;

/// The kind of row-level change, mirroring `SYS_CHANGE_OPERATION` (I/U/D).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChangeType {
    Inserted,
    Updated,
    Deleted,
}

impl ChangeType {
    /// Parse from the single-character `SYS_CHANGE_OPERATION` value.
    pub fn from_sql(op: &str) -> Option<Self> {
        match op.trim() {
            "I" => Some(ChangeType::Inserted),
            "U" => Some(ChangeType::Updated),
            "D" => Some(ChangeType::Deleted),
            _ => None,
        }
    }

    pub fn as_sql(self) -> &'static str {
        match self {
            ChangeType::Inserted => "I",
            ChangeType::Updated => "U",
            ChangeType::Deleted => "D",
        }
    }
}

impl fmt::Display for ChangeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChangeType::Inserted => write!(f, "Inserted"),
            ChangeType::Updated => write!(f, "Updated"),
            ChangeType::Deleted => write!(f, "Deleted"),
        }
    }
}

/// One row returned by the Change Reader and handed to the user handler.
///
/// For `Deleted` rows, `data` contains only the primary-key fields — the
/// underlying row is gone, so there is nothing else to join against (§4.2).
#[derive(Debug, Clone)]
pub struct ChangeRow {
    pub change_type: ChangeType,
    /// `SYS_CHANGE_VERSION` for this row. Used internally by the Lease
    /// Manager to compute the release-and-advance version (§4.3); not part
    /// of the public handler payload contract, but exposed for handlers
    /// that want to log or order by it.
    pub version: i64,
    pub primary_key: PrimaryKey,
    pub data: PrimaryKey,
}

impl ChangeRow {
    pub fn new(change_type: ChangeType, version: i64, primary_key: PrimaryKey, data: PrimaryKey) -> Self {
        Self {
            change_type,
            version,
            primary_key,
            data,
        }
    }
}

/// A worker's stable identity, suggested to be host machine name + a
/// process-scoped tag (§6: "Inputs required from collaborators").
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Generate a worker identity from the host machine name and this
    /// process's id, matching the spec's suggested convention.
    pub fn generate() -> Self {
        let host = std::env::var("HOSTNAME")
            .or_else(|_| std::env::var("COMPUTERNAME"))
            .unwrap_or_else(|_| "localhost".to_string());
        Self(format!("{host}:{}", std::process::id()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A user table's SQL object id, the key used throughout §3's data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct UserTableId(pub i64);

impl fmt::Display for UserTableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A primary-key column's declared SQL type, read once by the Schema
/// Provisioner and used verbatim to define `WorkerLease_T`'s matching
/// columns (§4.1 step 2).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrimaryKeyColumn {
    pub name: String,
    /// The SQL Server type name, e.g. "int", "nvarchar", "uniqueidentifier".
    pub sql_type: String,
    /// Declared length for variable-length string/binary types.
    pub length: Option<i32>,
    /// (precision, scale) for numeric types.
    pub precision_scale: Option<(u8, u8)>,
}

/// `GlobalState` row (§3): one per tracked user table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GlobalState {
    pub user_table_id: UserTableId,
    pub global_version_number: i64,
    pub database_id: i64,
    pub rows_processed: i64,
}

/// `WorkerBatchSizes` row (§3): per-worker liveness and last-batch report.
#[derive(Debug, Clone)]
pub struct WorkerBatchSize {
    pub worker_id: WorkerId,
    pub batch_size: i64,
    pub timestamp: DateTime<Utc>,
}

/// A scale recommendation emitted by the Scale Monitor (§4.4).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScaleAction {
    AddWorker,
    RemoveWorker,
    None,
}

impl fmt::Display for ScaleAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScaleAction::AddWorker => write!(f, "AddWorker"),
            ScaleAction::RemoveWorker => write!(f, "RemoveWorker"),
            ScaleAction::None => write!(f, "None"),
        }
    }
}

/// The result of one Scale Monitor heartbeat (§4.4).
#[derive(Debug, Clone)]
pub struct ScaleHeartbeat {
    pub recommendation: ScaleAction,
    pub reason: String,
    /// Whether the host's fleet controller should keep calling back
    /// (`false` only accompanies `RemoveWorker`, per §4.4 step 8).
    pub keep_alive: bool,
    pub new_changes: Option<i64>,
    pub new_rows_processed: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn change_type_round_trips_through_sql_chars() {
        for ty in [ChangeType::Inserted, ChangeType::Updated, ChangeType::Deleted] {
            assert_eq!(ChangeType::from_sql(ty.as_sql()), Some(ty));
        }
        assert_eq!(ChangeType::from_sql("X"), None);
        assert_eq!(ChangeType::from_sql(" I "), Some(ChangeType::Inserted));
    }

    #[test]
    fn primary_key_equality_is_order_independent() {
        let mut a = PrimaryKey::new();
        a.insert("id".into(), ColumnValue::Int(1));
        a.insert("tenant".into(), ColumnValue::Text("acme".into()));

        let mut b = PrimaryKey::new();
        b.insert("tenant".into(), ColumnValue::Text("acme".into()));
        b.insert("id".into(), ColumnValue::Int(1));

        assert_eq!(a, b);
    }

    #[test]
    fn worker_id_generate_is_stable_within_process() {
        assert_eq!(WorkerId::generate(), WorkerId::generate());
    }

    #[test]
    fn column_value_display_is_human_readable() {
        assert_eq!(ColumnValue::Int(7).to_string(), "7");
        assert_eq!(ColumnValue::Null.to_string(), "NULL");
        assert_eq!(ColumnValue::Text("hi".into()).to_string(), "hi");
    }
}
