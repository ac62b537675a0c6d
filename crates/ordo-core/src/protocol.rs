//! Wire contract between the sync client and the server
//!
//! These types are shared with `ordo-api`; the serialized shapes are the
//! compatibility boundary, so every rename here is load-bearing.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::models::{EntityKind, OpType};

/// `POST /sync/push` request body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushRequest {
    pub operations: Vec<PushOperation>,
}

/// One outbound operation in a push batch
///
/// `data` carries business fields only, never client-side `version` or
/// timestamps. `expected_version` is `None` exactly for CREATE.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOperation {
    pub id: Uuid,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub operation_type: OpType,
    pub data: Value,
    pub expected_version: Option<i64>,
    /// ISO 8601 creation timestamp of the (coalesced) operation
    pub timestamp: String,
}

/// `POST /sync/push` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushResponse {
    pub results: Vec<OperationResult>,
}

/// Per-operation outcome of a push
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationResult {
    pub operation_id: Uuid,
    pub status: ResultStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_version: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflicts: Option<Vec<FieldConflict>>,
}

/// Outcome classes for a pushed operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    /// Applied as sent
    Success,
    /// Applied after field-level resolution, or refused for DELETE
    Conflict,
    /// Permanent business error; the client must not retry
    Error,
}

/// How a single contested field was resolved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldConflict {
    pub field: String,
    pub client_value: Value,
    pub server_value: Value,
    pub winner: ConflictWinner,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictWinner {
    Client,
    Server,
}

/// `GET /sync/pull?since=<id>&limit=<n>` response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullResponse {
    pub operations: Vec<LogOperation>,
    pub has_more: bool,
}

/// One entry of the server change log
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogOperation {
    pub sync_id: i64,
    pub entity_type: EntityKind,
    pub entity_id: Uuid,
    pub operation_type: OpType,
    pub data: Value,
    /// ISO 8601 server acceptance timestamp
    pub timestamp: String,
}

/// `GET /sync/snapshot` response body: the full reference and entity sets,
/// without versions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotResponse {
    pub partners: Vec<WirePartner>,
    pub products: Vec<WireProduct>,
    pub units: Vec<WireUnit>,
    pub orders: Vec<WireOrder>,
    pub order_lines: Vec<WireOrderLine>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WirePartner {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub code: Option<String>,
    pub partner_type: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireProduct {
    pub id: Uuid,
    pub name: String,
    #[serde(default)]
    pub short_name: Option<String>,
    #[serde(default)]
    pub sku: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireUnit {
    pub id: Uuid,
    pub name: String,
    pub abbreviation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrder {
    pub id: Uuid,
    pub partner_id: Uuid,
    pub status: i64,
    #[serde(default)]
    pub order_date: Option<String>,
    pub delivery_date: String,
    #[serde(default)]
    pub comment: Option<String>,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339
    pub updated_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireOrderLine {
    pub id: Uuid,
    pub order_id: Uuid,
    pub product_id: Uuid,
    pub unit_id: Uuid,
    pub quantity: f64,
    pub price: f64,
    #[serde(default)]
    pub comment: Option<String>,
    /// RFC 3339
    pub created_at: String,
    /// RFC 3339
    pub updated_at: String,
}

/// One event on the `GET /sync/events` stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncEvent {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<EntityKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sync_id: Option<i64>,
}

impl SyncEvent {
    /// A change notification for one entity.
    #[must_use]
    pub fn sync(entity_type: EntityKind, entity_id: Uuid, sync_id: i64) -> Self {
        Self {
            event: "sync".to_string(),
            entity_type: Some(entity_type),
            entity_id: Some(entity_id),
            sync_id: Some(sync_id),
        }
    }

    /// A keepalive.
    #[must_use]
    pub fn ping() -> Self {
        Self {
            event: "ping".to_string(),
            entity_type: None,
            entity_id: None,
            sync_id: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn push_operation_wire_shape() {
        let op = PushOperation {
            id: Uuid::nil(),
            entity_type: EntityKind::Order,
            entity_id: Uuid::nil(),
            operation_type: OpType::Update,
            data: json!({"status": 1}),
            expected_version: Some(3),
            timestamp: "2024-06-15T10:00:00+00:00".to_string(),
        };

        let value = serde_json::to_value(&op).unwrap();
        assert_eq!(value["entity_type"], "order");
        assert_eq!(value["operation_type"], "UPDATE");
        assert_eq!(value["expected_version"], 3);
    }

    #[test]
    fn operation_result_accepts_minimal_payload() {
        let result: OperationResult = serde_json::from_value(json!({
            "operation_id": Uuid::nil(),
            "status": "success"
        }))
        .unwrap();

        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.new_version, None);
        assert!(result.conflicts.is_none());
    }

    #[test]
    fn conflict_roundtrip() {
        let conflict = FieldConflict {
            field: "status".to_string(),
            client_value: json!(1),
            server_value: json!(2),
            winner: ConflictWinner::Server,
        };
        let text = serde_json::to_string(&conflict).unwrap();
        assert!(text.contains("\"winner\":\"server\""));
    }

    #[test]
    fn sync_event_shapes() {
        let ping: SyncEvent = serde_json::from_str("{\"event\":\"ping\"}").unwrap();
        assert_eq!(ping.event, "ping");
        assert_eq!(ping.sync_id, None);

        let event = SyncEvent::sync(EntityKind::OrderLine, Uuid::nil(), 9);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], "sync");
        assert_eq!(value["entity_type"], "order_line");
        assert_eq!(value["sync_id"], 9);
    }
}
