//! In-process server double for end-to-end sync tests
//!
//! Implements the wire contract with the real conflict semantics (version
//! check, field-level merge with server-wins on contested fields,
//! idempotent CREATE/DELETE) over plain in-memory maps, so the engines can
//! be driven through full offline/online stories without HTTP.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Map, Value};
use uuid::Uuid;

use ordo_core::error::{Error, Result};
use ordo_core::models::{EntityKind, OpType};
use ordo_core::protocol::{
    ConflictWinner, FieldConflict, LogOperation, OperationResult, PullResponse, PushOperation,
    PushRequest, PushResponse, ResultStatus, SnapshotResponse,
};
use ordo_core::sync::SyncTransport;

#[derive(Default)]
struct Inner {
    orders: HashMap<Uuid, Map<String, Value>>,
    log: Vec<LogOperation>,
    fail_pushes: usize,
    push_requests: Vec<PushRequest>,
}

/// Scripted server double
#[derive(Default)]
pub struct FakeServer {
    inner: Mutex<Inner>,
}

#[allow(dead_code)]
impl FakeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `count` pushes fail with a transport error.
    pub fn fail_next_pushes(&self, count: usize) {
        self.inner.lock().unwrap().fail_pushes = count;
    }

    /// Every push request body received so far.
    pub fn push_requests(&self) -> Vec<PushRequest> {
        self.inner.lock().unwrap().push_requests.clone()
    }

    /// Total operations received across all pushes.
    pub fn pushed_operation_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .push_requests
            .iter()
            .map(|request| request.operations.len())
            .sum()
    }

    /// The server-side order row, if any.
    pub fn order(&self, id: Uuid) -> Option<Map<String, Value>> {
        self.inner.lock().unwrap().orders.get(&id).cloned()
    }

    /// The full change log.
    pub fn log(&self) -> Vec<LogOperation> {
        self.inner.lock().unwrap().log.clone()
    }

    /// Apply an operation as if another client had pushed it.
    pub fn apply_from_other_client(&self, op: PushOperation) -> OperationResult {
        let mut inner = self.inner.lock().unwrap();
        process_op(&mut inner, &op)
    }

    /// Append a raw log entry (for pull-side stories that need exact data).
    pub fn append_log(
        &self,
        entity_type: EntityKind,
        entity_id: Uuid,
        operation_type: OpType,
        data: Value,
    ) -> i64 {
        let mut inner = self.inner.lock().unwrap();
        append_log(&mut inner, entity_type, entity_id, operation_type, data)
    }
}

#[async_trait]
impl SyncTransport for FakeServer {
    async fn push(&self, request: &PushRequest) -> Result<PushResponse> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_pushes > 0 {
            inner.fail_pushes -= 1;
            return Err(Error::Transport("HTTP 500: server error".to_string()));
        }

        inner.push_requests.push(request.clone());
        let results = request
            .operations
            .iter()
            .map(|op| process_op(&mut inner, op))
            .collect();
        Ok(PushResponse { results })
    }

    async fn pull(&self, since: i64, limit: i64) -> Result<PullResponse> {
        let inner = self.inner.lock().unwrap();
        let mut operations: Vec<LogOperation> = inner
            .log
            .iter()
            .filter(|entry| entry.sync_id > since)
            .cloned()
            .collect();
        let has_more = operations.len() as i64 > limit;
        operations.truncate(limit as usize);
        Ok(PullResponse {
            operations,
            has_more,
        })
    }

    async fn snapshot(&self) -> Result<SnapshotResponse> {
        // These stories start from an empty server; the snapshot only has
        // to exist so the initial-snapshot step completes.
        Ok(SnapshotResponse {
            partners: vec![],
            products: vec![],
            units: vec![],
            orders: vec![],
            order_lines: vec![],
        })
    }
}

fn append_log(
    inner: &mut Inner,
    entity_type: EntityKind,
    entity_id: Uuid,
    operation_type: OpType,
    data: Value,
) -> i64 {
    let sync_id = inner.log.last().map_or(1, |entry| entry.sync_id + 1);
    inner.log.push(LogOperation {
        sync_id,
        entity_type,
        entity_id,
        operation_type,
        data,
        timestamp: "2024-06-15T12:00:00+00:00".to_string(),
    });
    sync_id
}

fn process_op(inner: &mut Inner, op: &PushOperation) -> OperationResult {
    // The double only models orders; lines go through the real server's
    // unit tests.
    assert_eq!(op.entity_type, EntityKind::Order, "FakeServer models orders only");
    match op.operation_type {
        OpType::Create => process_create(inner, op),
        OpType::Update => process_update(inner, op),
        OpType::Delete => process_delete(inner, op),
    }
}

fn process_create(inner: &mut Inner, op: &PushOperation) -> OperationResult {
    if let Some(existing) = inner.orders.get(&op.entity_id) {
        return OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: existing.get("version").and_then(Value::as_i64),
            message: Some("already exists (idempotent)".to_string()),
            conflicts: None,
        };
    }

    let mut row = op.data.as_object().cloned().unwrap_or_default();
    row.insert("version".into(), Value::from(1));
    row.insert("deleted_at".into(), Value::Null);
    inner.orders.insert(op.entity_id, row.clone());

    let sync_id = append_log(
        inner,
        EntityKind::Order,
        op.entity_id,
        OpType::Create,
        Value::Object(row),
    );
    OperationResult {
        operation_id: op.id,
        status: ResultStatus::Success,
        sync_id: Some(sync_id),
        new_version: Some(1),
        message: None,
        conflicts: None,
    }
}

fn process_update(inner: &mut Inner, op: &PushOperation) -> OperationResult {
    let Some(row) = inner.orders.get(&op.entity_id).cloned() else {
        return error_result(op, "not found");
    };
    if row.get("deleted_at").is_some_and(|value| !value.is_null()) {
        return error_result(op, "entity deleted");
    }

    let server_version = row.get("version").and_then(Value::as_i64).unwrap_or(1);
    let mismatch = op.expected_version.is_some() && op.expected_version != Some(server_version);
    let changed = if mismatch {
        changed_fields_since(inner, op.entity_id, op.expected_version.unwrap_or(0))
    } else {
        HashSet::new()
    };

    let data = op.data.as_object().cloned().unwrap_or_default();
    let mut fields_to_apply = Map::new();
    let mut conflicts = Vec::new();

    for (field, client_value) in &data {
        let server_value = row.get(field).cloned().unwrap_or(Value::Null);
        if *client_value == server_value {
            continue;
        }
        if mismatch && changed.contains(field) {
            conflicts.push(FieldConflict {
                field: field.clone(),
                client_value: client_value.clone(),
                server_value,
                winner: ConflictWinner::Server,
            });
        } else {
            fields_to_apply.insert(field.clone(), client_value.clone());
        }
    }

    if !mismatch && fields_to_apply.is_empty() {
        return OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: Some(server_version),
            message: Some("No changes to apply, no-op".to_string()),
            conflicts: None,
        };
    }

    let new_version = server_version + 1;
    let row = inner.orders.get_mut(&op.entity_id).expect("row exists");
    for (field, value) in &fields_to_apply {
        row.insert(field.clone(), value.clone());
    }
    row.insert("version".into(), Value::from(new_version));

    let mut log_data = fields_to_apply;
    log_data.insert("version".into(), Value::from(new_version));
    let sync_id = append_log(
        inner,
        EntityKind::Order,
        op.entity_id,
        OpType::Update,
        Value::Object(log_data),
    );

    OperationResult {
        operation_id: op.id,
        status: if mismatch {
            ResultStatus::Conflict
        } else {
            ResultStatus::Success
        },
        sync_id: Some(sync_id),
        new_version: Some(new_version),
        message: None,
        conflicts: (!conflicts.is_empty()).then_some(conflicts),
    }
}

fn process_delete(inner: &mut Inner, op: &PushOperation) -> OperationResult {
    let Some(row) = inner.orders.get(&op.entity_id).cloned() else {
        return error_result(op, "not found");
    };
    let server_version = row.get("version").and_then(Value::as_i64).unwrap_or(1);

    if row.get("deleted_at").is_some_and(|value| !value.is_null()) {
        return OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: Some(server_version),
            message: Some("already deleted, no-op".to_string()),
            conflicts: None,
        };
    }

    if op.expected_version.is_some() && op.expected_version != Some(server_version) {
        return OperationResult {
            operation_id: op.id,
            status: ResultStatus::Conflict,
            sync_id: None,
            new_version: Some(server_version),
            message: Some("Delete rejected: entity was updated on server".to_string()),
            conflicts: None,
        };
    }

    let new_version = server_version + 1;
    let row = inner.orders.get_mut(&op.entity_id).expect("row exists");
    row.insert("version".into(), Value::from(new_version));
    row.insert(
        "deleted_at".into(),
        Value::String("2024-06-15T12:00:00+00:00".to_string()),
    );

    let sync_id = append_log(
        inner,
        EntityKind::Order,
        op.entity_id,
        OpType::Delete,
        serde_json::json!({"version": new_version, "deleted_at": "2024-06-15T12:00:00+00:00"}),
    );

    OperationResult {
        operation_id: op.id,
        status: ResultStatus::Success,
        sync_id: Some(sync_id),
        new_version: Some(new_version),
        message: None,
        conflicts: None,
    }
}

/// Replay UPDATE log entries to find fields the server changed after
/// `since_version`.
fn changed_fields_since(inner: &Inner, entity_id: Uuid, since_version: i64) -> HashSet<String> {
    let mut fields = HashSet::new();
    for entry in &inner.log {
        if entry.entity_id != entity_id || entry.operation_type != OpType::Update {
            continue;
        }
        let Some(data) = entry.data.as_object() else {
            continue;
        };
        let version = data.get("version").and_then(Value::as_i64);
        if version.is_some_and(|version| version > since_version) {
            for key in data.keys() {
                if key != "version" {
                    fields.insert(key.clone());
                }
            }
        }
    }
    fields
}

fn error_result(op: &PushOperation, message: &str) -> OperationResult {
    OperationResult {
        operation_id: op.id,
        status: ResultStatus::Error,
        sync_id: None,
        new_version: None,
        message: Some(message.to_string()),
        conflicts: None,
    }
}
