//! Push engine
//!
//! Drains the outbox into one `/sync/push` request per invocation:
//! snapshot pending work, coalesce per entity, send, reconcile the per-op
//! results, and invalidate the affected recap queries in one call.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::invalidate::QueryInvalidator;
use super::transport::SyncTransport;
use super::SyncingGuard;
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{EntityKind, OpType, OrderId, OrderLineId, OutboxOperation};
use crate::protocol::{
    ConflictWinner, FieldConflict, OperationResult, PushOperation, PushRequest, ResultStatus,
};
use crate::util::{ms_to_rfc3339, now_ms};

/// Counters describing one push cycle
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushOutcome {
    /// Outbox operations taken from the pending snapshot
    pub processed: usize,
    /// Operations that ended up synced (including vacuously satisfied ones)
    pub success_count: usize,
    /// Operations the server resolved with a field-level conflict
    pub conflict_count: usize,
    /// Operations terminally rejected by the server
    pub rejected_count: usize,
}

/// One wire operation plus the outbox rows it stands for
#[derive(Debug, Clone)]
pub(crate) struct CoalescedOp {
    pub op: OutboxOperation,
    /// Ids of outbox rows folded into `op` (excluding `op.id` itself);
    /// they share its fate during reconciliation.
    pub absorbed: Vec<Uuid>,
}

impl CoalescedOp {
    fn ids(&self) -> Vec<Uuid> {
        let mut ids = vec![self.op.id];
        ids.extend(&self.absorbed);
        ids
    }
}

/// Result of coalescing a pending snapshot
#[derive(Debug, Default)]
pub(crate) struct CoalescePlan {
    /// Operations to send, in ascending sequence order
    pub send: Vec<CoalescedOp>,
    /// Outbox rows that are vacuously satisfied and never hit the wire
    pub dropped: Vec<Uuid>,
}

/// Reduce a pending snapshot to the minimal equivalent batch.
///
/// Groups by (entity type, entity id) preserving sequence order inside each
/// group. Applying the result to a fresh server state has the same effect
/// as applying the original sequence.
pub(crate) fn coalesce(ops: &[OutboxOperation]) -> CoalescePlan {
    let mut order: Vec<(EntityKind, Uuid)> = Vec::new();
    let mut groups: HashMap<(EntityKind, Uuid), Vec<&OutboxOperation>> = HashMap::new();

    for op in ops {
        let key = (op.entity_type, op.entity_id);
        groups
            .entry(key)
            .or_insert_with(|| {
                order.push(key);
                Vec::new()
            })
            .push(op);
    }

    let mut plan = CoalescePlan::default();

    for key in order {
        let group = &groups[&key];
        let starts_with_create = group[0].op_type == OpType::Create;
        let delete = group.iter().find(|op| op.op_type == OpType::Delete);

        match delete {
            // CREATE … DELETE: the entity never existed as far as the
            // server is concerned; the whole group cancels.
            Some(_) if starts_with_create => {
                plan.dropped.extend(group.iter().map(|op| op.id));
            }
            // UPDATE(s) … DELETE: only the DELETE travels, with its own
            // recorded expected version.
            Some(delete) => {
                plan.dropped
                    .extend(group.iter().filter(|op| op.id != delete.id).map(|op| op.id));
                plan.send.push(CoalescedOp {
                    op: (*delete).clone(),
                    absorbed: Vec::new(),
                });
            }
            None if group.len() == 1 => {
                plan.send.push(CoalescedOp {
                    op: group[0].clone(),
                    absorbed: Vec::new(),
                });
            }
            // CREATE + UPDATEs fold into one CREATE; UPDATE + UPDATEs fold
            // into one UPDATE keeping the first op's expected version.
            None => {
                let mut merged = group[0].clone();
                let mut data = merged.data_map();
                for op in &group[1..] {
                    merge_fields(&mut data, &op.data_map());
                }
                merged.data = Value::Object(data);
                merged.timestamp = group[group.len() - 1].timestamp;

                plan.send.push(CoalescedOp {
                    absorbed: group[1..].iter().map(|op| op.id).collect(),
                    op: merged,
                });
            }
        }
    }

    plan
}

/// Merge `other` into `base` field by field, last writer wins. The `version`
/// key is never merged: a CREATE has no expected version and a folded
/// UPDATE run keeps the first op's pre-image.
fn merge_fields(base: &mut Map<String, Value>, other: &Map<String, Value>) {
    for (key, value) in other {
        if key != "version" {
            base.insert(key.clone(), value.clone());
        }
    }
}

/// Drains the outbox toward the server
pub struct PushEngine {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    invalidator: Arc<dyn QueryInvalidator>,
    is_syncing: AtomicBool,
}

impl PushEngine {
    pub fn new(
        store: LocalStore,
        transport: Arc<dyn SyncTransport>,
        invalidator: Arc<dyn QueryInvalidator>,
    ) -> Self {
        Self {
            store,
            transport,
            invalidator,
            is_syncing: AtomicBool::new(false),
        }
    }

    /// Run one push cycle.
    ///
    /// Transport failures mark every sent operation failed (scheduling the
    /// backoff retry) and surface as an error; per-operation business
    /// errors never abort the rest of the batch.
    pub async fn run(&self) -> Result<PushOutcome> {
        let Some(_guard) = SyncingGuard::acquire(&self.is_syncing) else {
            tracing::debug!("push already in flight, skipping");
            return Ok(PushOutcome::default());
        };

        let pending = self.store.pending_operations().await?;
        if pending.is_empty() {
            return Ok(PushOutcome::default());
        }

        let mut outcome = PushOutcome {
            processed: pending.len(),
            ..Default::default()
        };

        let plan = coalesce(&pending);

        // Vacuously satisfied rows never hit the wire.
        if !plan.dropped.is_empty() {
            self.store.mark_synced_many(&plan.dropped).await?;
            outcome.success_count += plan.dropped.len();
        }

        if plan.send.is_empty() {
            if outcome.success_count > 0 {
                self.store.set_last_push_timestamp(now_ms()).await?;
            }
            return Ok(outcome);
        }

        let in_flight: Vec<Uuid> = plan.send.iter().flat_map(CoalescedOp::ids).collect();
        self.store.mark_syncing(&in_flight).await?;

        let request = PushRequest {
            operations: plan.send.iter().map(|entry| to_wire(&entry.op)).collect(),
        };

        tracing::debug!(
            operations = request.operations.len(),
            coalesced_from = pending.len(),
            "pushing batch"
        );

        let response = match self.transport.push(&request).await {
            Ok(response) => response,
            Err(error) => {
                let message = error.to_string();
                for id in &in_flight {
                    self.store.mark_failed(*id, &message).await?;
                }
                return Err(error);
            }
        };

        let mut results: HashMap<Uuid, OperationResult> = response
            .results
            .into_iter()
            .map(|result| (result.operation_id, result))
            .collect();

        let mut affected_orders: HashSet<Uuid> = HashSet::new();

        for entry in &plan.send {
            match results.remove(&entry.op.id) {
                Some(result) => {
                    self.reconcile(entry, &result, &mut outcome, &mut affected_orders)
                        .await?;
                }
                None => {
                    // Treated like a transport failure for this operation,
                    // but a missing result is a server-side contract breach.
                    tracing::error!(operation = %entry.op.id, "push response missing result");
                    let message = Error::Protocol("missing result for operation".into()).to_string();
                    for id in entry.ids() {
                        self.store.mark_failed(id, &message).await?;
                    }
                }
            }
        }

        for orphan in results.keys() {
            tracing::warn!(operation = %orphan, "push response contained unknown operation id");
        }

        if outcome.success_count > 0 {
            self.store.set_last_push_timestamp(now_ms()).await?;
        }

        let keys = super::invalidate::recap_keys(&self.store, &affected_orders).await?;
        if !keys.is_empty() {
            self.invalidator.invalidate(&keys).await;
        }

        Ok(outcome)
    }

    async fn reconcile(
        &self,
        entry: &CoalescedOp,
        result: &OperationResult,
        outcome: &mut PushOutcome,
        affected_orders: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let op = &entry.op;
        match result.status {
            ResultStatus::Success => {
                self.store.mark_synced_many(&entry.ids()).await?;
                if let Some(new_version) = result.new_version {
                    self.store
                        .update_entity_version(op.entity_type, op.entity_id, new_version)
                        .await?;
                }
                self.track_affected_order(op, affected_orders).await?;
                outcome.success_count += 1 + entry.absorbed.len();
            }
            ResultStatus::Conflict if op.op_type != OpType::Delete => {
                // Logically handled: the server already merged what it
                // could; adopt its version and its winning field values.
                self.apply_server_wins(op, result).await?;
                self.store.mark_synced_many(&entry.ids()).await?;
                tracing::warn!(
                    entity = %op.entity_id,
                    new_version = result.new_version,
                    "push conflict resolved by server"
                );
                self.track_affected_order(op, affected_orders).await?;
                outcome.success_count += 1 + entry.absorbed.len();
                outcome.conflict_count += 1;
            }
            ResultStatus::Conflict => {
                // The server refused the delete; restore the local row.
                self.restore_deleted(op, result.new_version).await?;
                let message = result
                    .message
                    .as_deref()
                    .unwrap_or("delete refused: entity was modified concurrently");
                self.store.mark_rejected(op.id, message).await?;
                tracing::warn!(entity = %op.entity_id, "delete conflict, entity restored");
                self.track_affected_order(op, affected_orders).await?;
                outcome.rejected_count += 1;
            }
            ResultStatus::Error => {
                let message = result.message.as_deref().unwrap_or("server rejected operation");
                for id in entry.ids() {
                    self.store.mark_rejected(id, message).await?;
                }
                tracing::warn!(entity = %op.entity_id, message, "push operation rejected");
                outcome.rejected_count += 1 + entry.absorbed.len();
            }
        }
        Ok(())
    }

    /// Overwrite local fields the server won, and adopt the new version.
    async fn apply_server_wins(&self, op: &OutboxOperation, result: &OperationResult) -> Result<()> {
        let server_wins: Map<String, Value> = result
            .conflicts
            .iter()
            .flatten()
            .filter(|conflict| conflict.winner == ConflictWinner::Server)
            .map(|conflict: &FieldConflict| (conflict.field.clone(), conflict.server_value.clone()))
            .collect();

        match op.entity_type {
            EntityKind::Order => {
                let id = OrderId::from(op.entity_id);
                if let Some(mut order) = self.store.get_order_any(&id).await? {
                    order.apply_fields(&server_wins);
                    if let Some(new_version) = result.new_version {
                        order.version = new_version;
                    }
                    order.updated_at = now_ms();
                    self.store.put_order(&order).await?;
                }
            }
            EntityKind::OrderLine => {
                let id = OrderLineId::from(op.entity_id);
                if let Some(mut line) = self.store.get_order_line_any(&id).await? {
                    line.apply_fields(&server_wins);
                    if let Some(new_version) = result.new_version {
                        line.version = new_version;
                    }
                    line.updated_at = now_ms();
                    self.store.put_order_line(&line).await?;
                }
            }
        }
        Ok(())
    }

    /// Undo a local soft delete after the server refused it.
    async fn restore_deleted(&self, op: &OutboxOperation, new_version: Option<i64>) -> Result<()> {
        match op.entity_type {
            EntityKind::Order => {
                let id = OrderId::from(op.entity_id);
                if let Some(mut order) = self.store.get_order_any(&id).await? {
                    order.deleted_at = None;
                    if let Some(version) = new_version {
                        order.version = version;
                    }
                    order.updated_at = now_ms();
                    self.store.put_order(&order).await?;
                }
            }
            EntityKind::OrderLine => {
                let id = OrderLineId::from(op.entity_id);
                if let Some(mut line) = self.store.get_order_line_any(&id).await? {
                    line.deleted_at = None;
                    if let Some(version) = new_version {
                        line.version = version;
                    }
                    line.updated_at = now_ms();
                    self.store.put_order_line(&line).await?;
                }
            }
        }
        Ok(())
    }

    /// Resolve the order id a reconciled operation affects.
    async fn track_affected_order(
        &self,
        op: &OutboxOperation,
        affected_orders: &mut HashSet<Uuid>,
    ) -> Result<()> {
        match op.entity_type {
            EntityKind::Order => {
                affected_orders.insert(op.entity_id);
            }
            EntityKind::OrderLine => {
                let from_data = op
                    .data
                    .get("order_id")
                    .and_then(Value::as_str)
                    .and_then(|value| Uuid::parse_str(value).ok());
                let order_id = match from_data {
                    Some(order_id) => Some(order_id),
                    None => self
                        .store
                        .get_order_line_any(&OrderLineId::from(op.entity_id))
                        .await?
                        .map(|line| line.order_id.as_uuid()),
                };
                if let Some(order_id) = order_id {
                    affected_orders.insert(order_id);
                }
            }
        }
        Ok(())
    }
}

fn to_wire(op: &OutboxOperation) -> PushOperation {
    PushOperation {
        id: op.id,
        entity_type: op.entity_type,
        entity_id: op.entity_id,
        operation_type: op.op_type,
        data: Value::Object(op.wire_data()),
        expected_version: match op.op_type {
            OpType::Create => None,
            OpType::Update | OpType::Delete => op.expected_version(),
        },
        timestamp: ms_to_rfc3339(op.timestamp),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::OpStatus;
    use serde_json::json;

    fn op(
        sequence: i64,
        entity_type: EntityKind,
        entity_id: Uuid,
        op_type: OpType,
        data: Value,
    ) -> OutboxOperation {
        OutboxOperation {
            id: Uuid::now_v7(),
            sequence_number: sequence,
            entity_type,
            entity_id,
            op_type,
            data,
            timestamp: 1_000 + sequence,
            status: OpStatus::Pending,
            retry_count: 0,
            next_retry_at: None,
            last_error: None,
        }
    }

    #[test]
    fn single_ops_pass_through() {
        let entity = Uuid::now_v7();
        let ops = vec![op(1, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 3}))];

        let plan = coalesce(&ops);

        assert!(plan.dropped.is_empty());
        assert_eq!(plan.send.len(), 1);
        assert_eq!(plan.send[0].op.id, ops[0].id);
        assert!(plan.send[0].absorbed.is_empty());
    }

    #[test]
    fn create_plus_updates_fold_into_one_create() {
        let entity = Uuid::now_v7();
        let ops = vec![
            op(
                1,
                EntityKind::Order,
                entity,
                OpType::Create,
                json!({"partner_id": "P1", "status": 0, "comment": null}),
            ),
            op(2, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 1})),
            op(
                3,
                EntityKind::Order,
                entity,
                OpType::Update,
                json!({"comment": "hello", "version": 2}),
            ),
        ];

        let plan = coalesce(&ops);

        assert!(plan.dropped.is_empty());
        assert_eq!(plan.send.len(), 1);
        let merged = &plan.send[0];
        assert_eq!(merged.op.id, ops[0].id);
        assert_eq!(merged.op.sequence_number, 1);
        assert_eq!(merged.op.op_type, OpType::Create);
        assert_eq!(merged.op.timestamp, ops[2].timestamp);
        assert_eq!(merged.absorbed, vec![ops[1].id, ops[2].id]);

        let data = merged.op.data_map();
        assert_eq!(data.get("status"), Some(&Value::from(1)));
        assert_eq!(data.get("comment"), Some(&Value::from("hello")));
        assert_eq!(data.get("partner_id"), Some(&Value::from("P1")));
        // UPDATE version fields are stripped: a CREATE carries none.
        assert!(!data.contains_key("version"));
    }

    #[test]
    fn create_then_delete_cancels_the_group() {
        let entity = Uuid::now_v7();
        let ops = vec![
            op(1, EntityKind::Order, entity, OpType::Create, json!({"partner_id": "P1"})),
            op(2, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 1})),
            op(3, EntityKind::Order, entity, OpType::Delete, json!({"version": 2})),
        ];

        let plan = coalesce(&ops);

        assert!(plan.send.is_empty());
        assert_eq!(plan.dropped.len(), 3);
    }

    #[test]
    fn updates_fold_keeping_first_expected_version() {
        let entity = Uuid::now_v7();
        let ops = vec![
            op(1, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 4})),
            op(
                2,
                EntityKind::Order,
                entity,
                OpType::Update,
                json!({"status": 2, "comment": "x", "version": 5}),
            ),
        ];

        let plan = coalesce(&ops);

        assert_eq!(plan.send.len(), 1);
        let merged = &plan.send[0];
        assert_eq!(merged.op.expected_version(), Some(4));
        let data = merged.op.data_map();
        assert_eq!(data.get("status"), Some(&Value::from(2)));
        assert_eq!(data.get("comment"), Some(&Value::from("x")));
        assert_eq!(merged.op.timestamp, ops[1].timestamp);
    }

    #[test]
    fn updates_then_delete_keep_only_the_delete() {
        let entity = Uuid::now_v7();
        let ops = vec![
            op(1, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 2})),
            op(2, EntityKind::Order, entity, OpType::Update, json!({"comment": "x", "version": 3})),
            op(3, EntityKind::Order, entity, OpType::Delete, json!({"version": 4})),
        ];

        let plan = coalesce(&ops);

        assert_eq!(plan.dropped, vec![ops[0].id, ops[1].id]);
        assert_eq!(plan.send.len(), 1);
        assert_eq!(plan.send[0].op.id, ops[2].id);
        // The DELETE keeps its own expected version, not the last UPDATE's.
        assert_eq!(plan.send[0].op.expected_version(), Some(4));
    }

    #[test]
    fn coalescing_never_merges_across_entities() {
        let first = Uuid::now_v7();
        let second = Uuid::now_v7();
        let ops = vec![
            op(1, EntityKind::Order, first, OpType::Update, json!({"status": 1, "version": 1})),
            op(2, EntityKind::OrderLine, second, OpType::Update, json!({"price": 2.0, "version": 1})),
            op(3, EntityKind::Order, first, OpType::Update, json!({"status": 2, "version": 2})),
        ];

        let plan = coalesce(&ops);

        assert_eq!(plan.send.len(), 2);
        // Entity groups keep their first-appearance order.
        assert_eq!(plan.send[0].op.entity_id, first);
        assert_eq!(plan.send[1].op.entity_id, second);
        assert_eq!(plan.send[0].op.data_map().get("status"), Some(&Value::from(2)));
    }

    #[test]
    fn wire_ops_carry_no_version_in_data() {
        let entity = Uuid::now_v7();
        let update = op(1, EntityKind::Order, entity, OpType::Update, json!({"status": 1, "version": 7}));

        let wire = to_wire(&update);

        assert_eq!(wire.expected_version, Some(7));
        assert!(wire.data.get("version").is_none());

        let create = op(2, EntityKind::Order, entity, OpType::Create, json!({"partner_id": "P1"}));
        assert_eq!(to_wire(&create).expected_version, None);
    }
}
