//! Push/pull processing against the server store
//!
//! Every pushed operation runs in its own transaction: one operation's
//! failure rolls back only itself and never aborts the rest of the batch.
//! Accepted mutations append exactly one change-log entry and broadcast
//! one SSE event after commit.

use serde_json::{Map, Value};

use ordo_core::models::{EntityKind, OpType};
use ordo_core::protocol::{
    FieldConflict, OperationResult, PushOperation, PushRequest, PushResponse, PullResponse,
    ResultStatus, SnapshotResponse, SyncEvent,
};
use rusqlite::Connection;

use crate::broadcast::EventBroadcaster;
use crate::db::{
    apply_entity_fields, changed_fields_since, get_entity_map, insert_line_row, insert_order_row,
    now_rfc3339, record_log, soft_delete_entity, ServerStore,
};
use crate::error::AppError;
use crate::resolver::ConflictResolver;

/// Handles `/sync/push`, `/sync/pull` and `/sync/snapshot`
#[derive(Clone)]
pub struct SyncService {
    store: ServerStore,
    broadcaster: EventBroadcaster,
}

impl SyncService {
    pub fn new(store: ServerStore, broadcaster: EventBroadcaster) -> Self {
        Self { store, broadcaster }
    }

    /// Process a push batch, one transaction per operation.
    pub async fn process_push(&self, request: PushRequest) -> PushResponse {
        let mut results = Vec::with_capacity(request.operations.len());

        for op in request.operations {
            let operation_id = op.id;
            let outcome = self
                .store
                .with_conn(move |conn| {
                    let tx = conn.transaction()?;
                    let outcome = dispatch(&tx, &op)?;
                    tx.commit()?;
                    Ok(outcome)
                })
                .await;

            match outcome {
                Ok((result, event)) => {
                    // Broadcast strictly after commit, so subscribers can
                    // immediately pull what the event announces.
                    if let Some(event) = event {
                        self.broadcaster.send(event);
                    }
                    results.push(result);
                }
                Err(error) => {
                    tracing::error!(operation = %operation_id, %error, "push operation failed");
                    results.push(error_result(operation_id, error.to_string()));
                }
            }
        }

        PushResponse { results }
    }

    /// Change-log entries after `since`.
    pub async fn pull(&self, since: i64, limit: i64) -> Result<PullResponse, AppError> {
        let (operations, has_more) = self.store.list_log(since, limit).await?;
        Ok(PullResponse {
            operations,
            has_more,
        })
    }

    /// The full snapshot for fresh clients.
    pub async fn snapshot(&self) -> Result<SnapshotResponse, AppError> {
        let rows = self.store.snapshot().await?;
        Ok(SnapshotResponse {
            partners: rows.partners,
            products: rows.products,
            units: rows.units,
            orders: rows.orders,
            order_lines: rows.order_lines,
        })
    }
}

type OpOutcome = (OperationResult, Option<SyncEvent>);

fn dispatch(conn: &Connection, op: &PushOperation) -> Result<OpOutcome, AppError> {
    let data = op.data.as_object().cloned().unwrap_or_default();
    match op.operation_type {
        OpType::Create => handle_create(conn, op, &data),
        OpType::Update => handle_update(conn, op, &data),
        OpType::Delete => handle_delete(conn, op),
    }
}

fn handle_create(
    conn: &Connection,
    op: &PushOperation,
    data: &Map<String, Value>,
) -> Result<OpOutcome, AppError> {
    // Idempotency: a replayed CREATE acknowledges the existing row.
    if let Some(existing) = get_entity_map(conn, op.entity_type, op.entity_id)? {
        let result = OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: Some(row_version(&existing)),
            message: Some(format!(
                "{} {} already exists (idempotent)",
                op.entity_type, op.entity_id
            )),
            conflicts: None,
        };
        return Ok((result, None));
    }

    let inserted = match op.entity_type {
        EntityKind::Order => insert_order_row(conn, op.entity_id, data),
        EntityKind::OrderLine => match line_parent(conn, data)? {
            ParentState::Ok => insert_line_row(conn, op.entity_id, data),
            ParentState::Missing(message) | ParentState::Deleted(message) => {
                return Ok((error_result(op.id, message), None));
            }
        },
    };

    let snapshot = match inserted {
        Ok(snapshot) => snapshot,
        Err(AppError::BadRequest(message)) => {
            return Ok((error_result(op.id, format!("Validation error: {message}")), None));
        }
        Err(error) => return Err(error),
    };

    let sync_id = record_log(
        conn,
        op.entity_type,
        op.entity_id,
        OpType::Create,
        &Value::Object(snapshot),
    )?;

    let result = OperationResult {
        operation_id: op.id,
        status: ResultStatus::Success,
        sync_id: Some(sync_id),
        new_version: Some(1),
        message: None,
        conflicts: None,
    };
    Ok((result, Some(SyncEvent::sync(op.entity_type, op.entity_id, sync_id))))
}

fn handle_update(
    conn: &Connection,
    op: &PushOperation,
    data: &Map<String, Value>,
) -> Result<OpOutcome, AppError> {
    let Some(entity) = get_entity_map(conn, op.entity_type, op.entity_id)? else {
        return Ok((
            error_result(op.id, format!("{} {} not found", op.entity_type, op.entity_id)),
            None,
        ));
    };
    if is_deleted(&entity) {
        return Ok((error_result(op.id, "entity deleted".to_string()), None));
    }

    let server_version = row_version(&entity);
    let version_mismatch =
        op.expected_version.is_some() && op.expected_version != Some(server_version);
    let server_changed_fields = if version_mismatch {
        changed_fields_since(
            conn,
            op.entity_type,
            op.entity_id,
            op.expected_version.unwrap_or(0),
        )?
    } else {
        Default::default()
    };

    let resolution = ConflictResolver.resolve_update(
        &entity,
        data,
        op.expected_version,
        server_version,
        &server_changed_fields,
    );

    if !resolution.had_version_mismatch && resolution.fields_to_apply.is_empty() {
        let result = OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: Some(server_version),
            message: Some("No changes to apply, no-op".to_string()),
            conflicts: None,
        };
        return Ok((result, None));
    }

    // Whether matched or merged, the row moves to a fresh version so every
    // replica converges on the same number.
    let new_version = server_version + 1;
    apply_entity_fields(conn, op.entity_type, op.entity_id, &resolution.fields_to_apply, new_version)?;

    let mut log_data = resolution.fields_to_apply.clone();
    log_data.insert("version".into(), Value::from(new_version));
    let sync_id = record_log(
        conn,
        op.entity_type,
        op.entity_id,
        OpType::Update,
        &Value::Object(log_data),
    )?;

    let (status, message) = if resolution.had_version_mismatch {
        let message = if resolution.has_conflicts() {
            "version mismatch: contested fields kept the server values"
        } else {
            "version mismatch: disjoint fields merged"
        };
        (ResultStatus::Conflict, Some(message.to_string()))
    } else {
        (ResultStatus::Success, None)
    };

    let conflicts: Option<Vec<FieldConflict>> =
        (!resolution.conflicts.is_empty()).then_some(resolution.conflicts);

    let result = OperationResult {
        operation_id: op.id,
        status,
        sync_id: Some(sync_id),
        new_version: Some(new_version),
        message,
        conflicts,
    };
    Ok((result, Some(SyncEvent::sync(op.entity_type, op.entity_id, sync_id))))
}

fn handle_delete(conn: &Connection, op: &PushOperation) -> Result<OpOutcome, AppError> {
    let Some(entity) = get_entity_map(conn, op.entity_type, op.entity_id)? else {
        return Ok((
            error_result(op.id, format!("{} {} not found", op.entity_type, op.entity_id)),
            None,
        ));
    };

    let server_version = row_version(&entity);

    // Idempotency: deleting twice acknowledges the first delete.
    if is_deleted(&entity) {
        let result = OperationResult {
            operation_id: op.id,
            status: ResultStatus::Success,
            sync_id: None,
            new_version: Some(server_version),
            message: Some("already deleted, no-op".to_string()),
            conflicts: None,
        };
        return Ok((result, None));
    }

    if op.expected_version.is_some() && op.expected_version != Some(server_version) {
        // Someone updated the row after the client decided to delete it;
        // the delete loses and the client restores the entity.
        let result = OperationResult {
            operation_id: op.id,
            status: ResultStatus::Conflict,
            sync_id: None,
            new_version: Some(server_version),
            message: Some(format!(
                "Delete rejected: entity was updated on server (version {server_version}, expected {})",
                op.expected_version.unwrap_or(0)
            )),
            conflicts: None,
        };
        return Ok((result, None));
    }

    let new_version = server_version + 1;
    soft_delete_entity(conn, op.entity_type, op.entity_id, new_version)?;

    let mut log_data = Map::new();
    log_data.insert("version".into(), Value::from(new_version));
    log_data.insert("deleted_at".into(), Value::String(now_rfc3339()));
    let sync_id = record_log(
        conn,
        op.entity_type,
        op.entity_id,
        OpType::Delete,
        &Value::Object(log_data),
    )?;

    let result = OperationResult {
        operation_id: op.id,
        status: ResultStatus::Success,
        sync_id: Some(sync_id),
        new_version: Some(new_version),
        message: None,
        conflicts: None,
    };
    Ok((result, Some(SyncEvent::sync(op.entity_type, op.entity_id, sync_id))))
}

enum ParentState {
    Ok,
    Missing(String),
    Deleted(String),
}

/// An order line CREATE needs a live parent order.
fn line_parent(conn: &Connection, data: &Map<String, Value>) -> Result<ParentState, AppError> {
    let Some(order_id) = data
        .get("order_id")
        .and_then(Value::as_str)
        .and_then(|value| uuid::Uuid::parse_str(value).ok())
    else {
        return Ok(ParentState::Missing(
            "Validation error: missing or invalid field: order_id".to_string(),
        ));
    };

    match get_entity_map(conn, EntityKind::Order, order_id)? {
        None => Ok(ParentState::Missing(format!("order {order_id} not found"))),
        Some(parent) if is_deleted(&parent) => {
            Ok(ParentState::Deleted(format!("order {order_id} is deleted")))
        }
        Some(_) => Ok(ParentState::Ok),
    }
}

fn row_version(entity: &Map<String, Value>) -> i64 {
    entity.get("version").and_then(Value::as_i64).unwrap_or(1)
}

fn is_deleted(entity: &Map<String, Value>) -> bool {
    entity.get("deleted_at").is_some_and(|value| !value.is_null())
}

fn error_result(operation_id: uuid::Uuid, message: String) -> OperationResult {
    OperationResult {
        operation_id,
        status: ResultStatus::Error,
        sync_id: None,
        new_version: None,
        message: Some(message),
        conflicts: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ordo_core::protocol::ConflictWinner;
    use serde_json::json;
    use uuid::Uuid;

    fn service() -> SyncService {
        SyncService::new(ServerStore::open_in_memory().unwrap(), EventBroadcaster::new())
    }

    fn push_op(
        entity_type: EntityKind,
        entity_id: Uuid,
        operation_type: OpType,
        data: Value,
        expected_version: Option<i64>,
    ) -> PushOperation {
        PushOperation {
            id: Uuid::now_v7(),
            entity_type,
            entity_id,
            operation_type,
            data,
            expected_version,
            timestamp: now_rfc3339(),
        }
    }

    fn create_order_op(entity_id: Uuid) -> PushOperation {
        push_op(
            EntityKind::Order,
            entity_id,
            OpType::Create,
            json!({
                "partner_id": Uuid::now_v7().to_string(),
                "delivery_date": "2024-06-15",
                "status": 0
            }),
            None,
        )
    }

    #[tokio::test]
    async fn create_succeeds_then_replays_idempotently() {
        let service = service();
        let entity_id = Uuid::now_v7();

        let first = service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;
        assert_eq!(first.results[0].status, ResultStatus::Success);
        assert_eq!(first.results[0].new_version, Some(1));
        assert_eq!(first.results[0].sync_id, Some(1));

        let replay = service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;
        assert_eq!(replay.results[0].status, ResultStatus::Success);
        // No second log entry for the replay.
        assert_eq!(replay.results[0].sync_id, None);
        let (log, _) = service.store.list_log(0, 100).await.unwrap();
        assert_eq!(log.len(), 1);
    }

    #[tokio::test]
    async fn update_with_matching_version_bumps_and_logs() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;

        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"status": 1}),
                    Some(1),
                )],
            })
            .await;

        let result = &response.results[0];
        assert_eq!(result.status, ResultStatus::Success);
        assert_eq!(result.new_version, Some(2));
        assert!(result.conflicts.is_none());

        let (log, _) = service.store.list_log(0, 100).await.unwrap();
        assert_eq!(log.len(), 2);
        assert_eq!(log[1].operation_type, OpType::Update);
        assert_eq!(log[1].data.get("version"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn stale_update_keeps_server_value_on_contested_field() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;

        // Another client moves status to 2 (version 1 -> 2).
        service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"status": 2}),
                    Some(1),
                )],
            })
            .await;

        // A stale client still at version 1 tries status = 1.
        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"status": 1}),
                    Some(1),
                )],
            })
            .await;

        let result = &response.results[0];
        assert_eq!(result.status, ResultStatus::Conflict);
        assert_eq!(result.new_version, Some(3));
        let conflicts = result.conflicts.as_ref().unwrap();
        assert_eq!(conflicts.len(), 1);
        assert_eq!(conflicts[0].field, "status");
        assert_eq!(conflicts[0].client_value, json!(1));
        assert_eq!(conflicts[0].server_value, json!(2));
        assert_eq!(conflicts[0].winner, ConflictWinner::Server);

        // The server row kept status 2 but moved to version 3.
        let entity = service
            .store
            .with_conn(move |conn| get_entity_map(conn, EntityKind::Order, entity_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.get("status"), Some(&json!(2)));
        assert_eq!(entity.get("version"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn stale_update_merges_disjoint_fields() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;

        service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"status": 2}),
                    Some(1),
                )],
            })
            .await;

        // Stale client edits a different field entirely.
        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"comment": "call before delivery"}),
                    Some(1),
                )],
            })
            .await;

        let result = &response.results[0];
        assert_eq!(result.status, ResultStatus::Conflict);
        assert!(result.conflicts.is_none());
        assert_eq!(result.new_version, Some(3));

        let entity = service
            .store
            .with_conn(move |conn| get_entity_map(conn, EntityKind::Order, entity_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.get("comment"), Some(&json!("call before delivery")));
        assert_eq!(entity.get("status"), Some(&json!(2)));
    }

    #[tokio::test]
    async fn update_of_deleted_entity_is_a_business_error() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;
        service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Delete,
                    json!({}),
                    Some(1),
                )],
            })
            .await;

        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"comment": "too late"}),
                    Some(1),
                )],
            })
            .await;

        let result = &response.results[0];
        assert_eq!(result.status, ResultStatus::Error);
        assert_eq!(result.message.as_deref(), Some("entity deleted"));
    }

    #[tokio::test]
    async fn delete_conflict_reports_current_version_and_keeps_row() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;
        service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Update,
                    json!({"status": 1}),
                    Some(1),
                )],
            })
            .await;

        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::Order,
                    entity_id,
                    OpType::Delete,
                    json!({}),
                    Some(1),
                )],
            })
            .await;

        let result = &response.results[0];
        assert_eq!(result.status, ResultStatus::Conflict);
        assert_eq!(result.new_version, Some(2));

        let entity = service
            .store
            .with_conn(move |conn| get_entity_map(conn, EntityKind::Order, entity_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(entity.get("deleted_at"), Some(&Value::Null));
    }

    #[tokio::test]
    async fn line_create_requires_a_live_parent() {
        let service = service();

        let response = service
            .process_push(PushRequest {
                operations: vec![push_op(
                    EntityKind::OrderLine,
                    Uuid::now_v7(),
                    OpType::Create,
                    json!({
                        "order_id": Uuid::now_v7().to_string(),
                        "product_id": Uuid::now_v7().to_string(),
                        "unit_id": Uuid::now_v7().to_string(),
                        "quantity": 1.0,
                        "price": 2.0
                    }),
                    None,
                )],
            })
            .await;

        assert_eq!(response.results[0].status, ResultStatus::Error);
        assert!(response.results[0]
            .message
            .as_deref()
            .unwrap()
            .contains("not found"));
    }

    #[tokio::test]
    async fn one_bad_operation_never_aborts_the_batch() {
        let service = service();
        let good = Uuid::now_v7();

        let response = service
            .process_push(PushRequest {
                operations: vec![
                    push_op(
                        EntityKind::Order,
                        Uuid::now_v7(),
                        OpType::Update,
                        json!({"status": 1}),
                        Some(1),
                    ),
                    create_order_op(good),
                ],
            })
            .await;

        assert_eq!(response.results.len(), 2);
        assert_eq!(response.results[0].status, ResultStatus::Error);
        assert_eq!(response.results[1].status, ResultStatus::Success);
    }

    #[tokio::test]
    async fn pull_pages_reflect_accepted_operations() {
        let service = service();
        let entity_id = Uuid::now_v7();
        service
            .process_push(PushRequest {
                operations: vec![create_order_op(entity_id)],
            })
            .await;

        let page = service.pull(0, 10).await.unwrap();
        assert_eq!(page.operations.len(), 1);
        assert_eq!(page.operations[0].operation_type, OpType::Create);
        assert_eq!(page.operations[0].entity_id, entity_id);
        assert!(!page.has_more);
    }
}
