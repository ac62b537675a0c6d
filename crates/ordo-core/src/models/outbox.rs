//! Outbox record types
//!
//! The outbox is the local append-only log of mutations awaiting
//! transmission. Records move through
//! pending → syncing → {synced, failed, rejected}; failed records become
//! pending again once their retry deadline passes.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Synchronized entity types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntityKind {
    #[serde(rename = "order")]
    Order,
    #[serde(rename = "order_line")]
    OrderLine,
}

impl EntityKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Order => "order",
            Self::OrderLine => "order_line",
        }
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "order" => Ok(Self::Order),
            "order_line" => Ok(Self::OrderLine),
            other => Err(format!("unknown entity type: {other}")),
        }
    }
}

/// Mutation kinds recorded in the outbox and the server change log
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OpType {
    #[serde(rename = "CREATE")]
    Create,
    #[serde(rename = "UPDATE")]
    Update,
    #[serde(rename = "DELETE")]
    Delete,
}

impl OpType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "CREATE",
            Self::Update => "UPDATE",
            Self::Delete => "DELETE",
        }
    }
}

impl fmt::Display for OpType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OpType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "CREATE" => Ok(Self::Create),
            "UPDATE" => Ok(Self::Update),
            "DELETE" => Ok(Self::Delete),
            other => Err(format!("unknown operation type: {other}")),
        }
    }
}

/// Outbox record lifecycle states
///
/// `Synced` and `Rejected` are terminal for a given operation id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpStatus {
    Pending,
    Syncing,
    Synced,
    Failed,
    Rejected,
}

impl OpStatus {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }
}

impl FromStr for OpStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "syncing" => Ok(Self::Syncing),
            "synced" => Ok(Self::Synced),
            "failed" => Ok(Self::Failed),
            "rejected" => Ok(Self::Rejected),
            other => Err(format!("unknown operation status: {other}")),
        }
    }
}

/// A pending local mutation awaiting transmission to the server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxOperation {
    /// Unique operation id
    pub id: Uuid,
    /// Strictly increasing, gap-free per client instance
    pub sequence_number: i64,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub op_type: OpType,
    /// Opaque field bag; for UPDATE/DELETE carries the expected
    /// pre-increment `version`
    pub data: Value,
    /// Wall-clock creation timestamp (Unix ms)
    pub timestamp: i64,
    pub status: OpStatus,
    pub retry_count: i64,
    /// Epoch ms of the next retry attempt; `None` on terminally failed ops
    pub next_retry_at: Option<i64>,
    pub last_error: Option<String>,
}

impl OutboxOperation {
    /// The data bag as a JSON object map (empty map when it is not one).
    #[must_use]
    pub fn data_map(&self) -> Map<String, Value> {
        self.data.as_object().cloned().unwrap_or_default()
    }

    /// The expected pre-image version carried in the data bag, if any.
    #[must_use]
    pub fn expected_version(&self) -> Option<i64> {
        self.data.get("version").and_then(Value::as_i64)
    }

    /// The data bag with the client-side `version` key stripped, as sent
    /// on the wire.
    #[must_use]
    pub fn wire_data(&self) -> Map<String, Value> {
        let mut map = self.data_map();
        map.remove("version");
        map
    }
}
