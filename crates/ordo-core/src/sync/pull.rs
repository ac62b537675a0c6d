//! Pull engine
//!
//! Two modes: the one-time initial snapshot, and incremental ingestion of
//! the server change log with rebasing of local pending work. The rebase
//! only rewrites entity rows; the outbox stays untouched so the next push
//! still sends exactly what the user committed.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use serde_json::{Map, Value};
use uuid::Uuid;

use super::invalidate::{recap_keys, QueryInvalidator, QueryKey};
use super::transport::SyncTransport;
use super::SyncingGuard;
use crate::db::LocalStore;
use crate::error::Result;
use crate::models::{
    EntityKind, OpStatus, OpType, Order, OrderId, OrderLine, OrderLineId, OutboxOperation,
    Partner, Product, Unit,
};
use crate::protocol::{LogOperation, SnapshotResponse};
use crate::util::{now_ms, rfc3339_to_ms};

const DEFAULT_PAGE_LIMIT: i64 = 100;

/// Counters describing one incremental pull
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PullOutcome {
    /// Log operations applied directly
    pub applied: usize,
    /// Log operations that required rebasing over local pending work
    pub rebased: usize,
    /// Cursor after the pull
    pub last_sync_id: i64,
}

/// Ingests the server change log into the local store
pub struct PullEngine {
    store: LocalStore,
    transport: Arc<dyn SyncTransport>,
    invalidator: Arc<dyn QueryInvalidator>,
    is_syncing: AtomicBool,
    page_limit: i64,
}

impl PullEngine {
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
            page_limit: DEFAULT_PAGE_LIMIT,
        }
    }

    /// Override the pull page size (tests).
    #[must_use]
    pub fn with_page_limit(mut self, page_limit: i64) -> Self {
        self.page_limit = page_limit;
        self
    }

    /// Load the full snapshot once, before the first incremental pull.
    ///
    /// Returns `false` when a snapshot already happened and nothing was
    /// fetched.
    pub async fn initial_snapshot(&self) -> Result<bool> {
        let Some(_guard) = SyncingGuard::acquire(&self.is_syncing) else {
            tracing::debug!("pull already in flight, skipping snapshot");
            return Ok(false);
        };

        if self.store.last_snapshot_timestamp().await?.is_some() {
            return Ok(false);
        }

        let snapshot = self.transport.snapshot().await?;
        let counts = (
            snapshot.partners.len(),
            snapshot.products.len(),
            snapshot.units.len(),
            snapshot.orders.len(),
            snapshot.order_lines.len(),
        );
        self.load_snapshot(snapshot).await?;
        self.store.set_last_snapshot_timestamp(now_ms()).await?;
        self.invalidator.invalidate(&[QueryKey::All]).await;

        tracing::info!(
            partners = counts.0,
            products = counts.1,
            units = counts.2,
            orders = counts.3,
            order_lines = counts.4,
            "initial snapshot loaded"
        );
        Ok(true)
    }

    async fn load_snapshot(&self, snapshot: SnapshotResponse) -> Result<()> {
        let now = now_ms();

        let partners = snapshot
            .partners
            .into_iter()
            .map(|wire| Partner {
                id: wire.id,
                name: wire.name,
                code: wire.code,
                partner_type: wire.partner_type,
            })
            .collect();
        self.store.bulk_put_partners(partners).await?;

        let products = snapshot
            .products
            .into_iter()
            .map(|wire| Product {
                id: wire.id,
                name: wire.name,
                short_name: wire.short_name,
                sku: wire.sku,
                code: wire.code,
            })
            .collect();
        self.store.bulk_put_products(products).await?;

        let units = snapshot
            .units
            .into_iter()
            .map(|wire| Unit {
                id: wire.id,
                name: wire.name,
                abbreviation: wire.abbreviation,
            })
            .collect();
        self.store.bulk_put_units(units).await?;

        let orders = snapshot
            .orders
            .into_iter()
            .map(|wire| Order {
                id: OrderId::from(wire.id),
                partner_id: wire.partner_id,
                status: wire.status,
                order_date: wire.order_date,
                delivery_date: wire.delivery_date,
                comment: wire.comment,
                created_at: rfc3339_to_ms(&wire.created_at).unwrap_or(now),
                updated_at: rfc3339_to_ms(&wire.updated_at).unwrap_or(now),
                version: 1,
                deleted_at: None,
            })
            .collect();
        self.store.bulk_put_orders(orders).await?;

        let lines = snapshot
            .order_lines
            .into_iter()
            .map(|wire| OrderLine {
                id: OrderLineId::from(wire.id),
                order_id: OrderId::from(wire.order_id),
                product_id: wire.product_id,
                unit_id: wire.unit_id,
                quantity: wire.quantity,
                price: wire.price,
                comment: wire.comment,
                created_at: rfc3339_to_ms(&wire.created_at).unwrap_or(now),
                updated_at: rfc3339_to_ms(&wire.updated_at).unwrap_or(now),
                version: 1,
                deleted_at: None,
            })
            .collect();
        self.store.bulk_put_order_lines(lines).await?;

        Ok(())
    }

    /// Run one incremental pull from the current cursor.
    pub async fn run(&self) -> Result<PullOutcome> {
        let Some(_guard) = SyncingGuard::acquire(&self.is_syncing) else {
            tracing::debug!("pull already in flight, skipping");
            return Ok(PullOutcome::default());
        };

        let mut cursor = self.store.last_sync_id().await?;
        let mut outcome = PullOutcome {
            last_sync_id: cursor,
            ..Default::default()
        };

        // Local intent still owed to the server, grouped per entity. Ops in
        // any non-terminal state count: they will all be pushed eventually.
        let pending_by_entity = self.pending_by_entity().await?;
        let mut touched_orders: HashSet<Uuid> = HashSet::new();

        loop {
            let page = self.transport.pull(cursor, self.page_limit).await?;
            if page.operations.is_empty() {
                break;
            }

            for op in &page.operations {
                let key = (op.entity_type, op.entity_id);
                let result = match pending_by_entity.get(&key) {
                    Some(pending) => {
                        outcome.rebased += 1;
                        self.rebase(op, pending, &mut touched_orders).await
                    }
                    None => {
                        outcome.applied += 1;
                        self.apply(op, &mut touched_orders).await
                    }
                };

                if let Err(error) = result {
                    // Leave the cursor at the last fully processed op.
                    if cursor > outcome.last_sync_id {
                        self.store.set_last_sync_id(cursor).await?;
                    }
                    return Err(error);
                }

                cursor = cursor.max(op.sync_id);
            }

            self.store.set_last_sync_id(cursor).await?;
            outcome.last_sync_id = cursor;

            if !page.has_more {
                break;
            }
        }

        self.store.set_last_sync_timestamp(now_ms()).await?;

        let keys = recap_keys(&self.store, &touched_orders).await?;
        if !keys.is_empty() {
            self.invalidator.invalidate(&keys).await;
        }

        Ok(outcome)
    }

    async fn pending_by_entity(
        &self,
    ) -> Result<HashMap<(EntityKind, Uuid), Vec<OutboxOperation>>> {
        let mut map: HashMap<(EntityKind, Uuid), Vec<OutboxOperation>> = HashMap::new();
        for op in self.store.list_operations().await? {
            if matches!(op.status, OpStatus::Synced | OpStatus::Rejected) {
                continue;
            }
            map.entry((op.entity_type, op.entity_id)).or_default().push(op);
        }
        Ok(map)
    }

    /// Apply one server log operation to the local store.
    async fn apply(&self, op: &LogOperation, touched: &mut HashSet<Uuid>) -> Result<()> {
        let data = op.data.as_object().cloned().unwrap_or_default();
        match op.entity_type {
            EntityKind::Order => self.apply_order(op, &data, touched).await,
            EntityKind::OrderLine => self.apply_line(op, &data, touched).await,
        }
    }

    async fn apply_order(
        &self,
        op: &LogOperation,
        data: &Map<String, Value>,
        touched: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let id = OrderId::from(op.entity_id);
        match op.operation_type {
            OpType::Create => {
                let Some(order) = order_from_log(op.entity_id, data) else {
                    tracing::warn!(entity = %op.entity_id, "skipping CREATE with incomplete data");
                    return Ok(());
                };
                self.store.put_order(&order).await?;
                touched.insert(op.entity_id);
            }
            OpType::Update => {
                let Some(mut order) = self.store.get_order_any(&id).await? else {
                    tracing::warn!(entity = %op.entity_id, "skipping UPDATE for unknown order");
                    return Ok(());
                };
                order.apply_fields(data);
                if let Some(version) = data.get("version").and_then(Value::as_i64) {
                    order.version = version;
                }
                if let Some(updated_at) = data.get("updated_at").and_then(timestamp_value) {
                    order.updated_at = updated_at;
                }
                if let Some(deleted_at) = data.get("deleted_at").map(nullable_timestamp) {
                    order.deleted_at = deleted_at;
                }
                self.store.put_order(&order).await?;
                touched.insert(op.entity_id);
            }
            OpType::Delete => {
                let Some(mut order) = self.store.get_order_any(&id).await? else {
                    tracing::warn!(entity = %op.entity_id, "skipping DELETE for unknown order");
                    return Ok(());
                };
                if order.deleted_at.is_some() {
                    // Replayed delete, nothing left to do.
                    return Ok(());
                }
                let now = now_ms();
                order.deleted_at = Some(now);
                order.version += 1;
                order.updated_at = now;
                self.store.put_order(&order).await?;

                // Cascade: an order delete takes its lines with it.
                for mut line in self.store.lines_for_order(&id).await? {
                    line.deleted_at = Some(now);
                    line.version += 1;
                    line.updated_at = now;
                    self.store.put_order_line(&line).await?;
                }
                touched.insert(op.entity_id);
            }
        }
        Ok(())
    }

    async fn apply_line(
        &self,
        op: &LogOperation,
        data: &Map<String, Value>,
        touched: &mut HashSet<Uuid>,
    ) -> Result<()> {
        let id = OrderLineId::from(op.entity_id);
        match op.operation_type {
            OpType::Create => {
                let Some(line) = line_from_log(op.entity_id, data) else {
                    tracing::warn!(entity = %op.entity_id, "skipping CREATE with incomplete data");
                    return Ok(());
                };
                touched.insert(line.order_id.as_uuid());
                self.store.put_order_line(&line).await?;
            }
            OpType::Update => {
                let Some(mut line) = self.store.get_order_line_any(&id).await? else {
                    tracing::warn!(entity = %op.entity_id, "skipping UPDATE for unknown order line");
                    return Ok(());
                };
                line.apply_fields(data);
                if let Some(version) = data.get("version").and_then(Value::as_i64) {
                    line.version = version;
                }
                if let Some(updated_at) = data.get("updated_at").and_then(timestamp_value) {
                    line.updated_at = updated_at;
                }
                if let Some(deleted_at) = data.get("deleted_at").map(nullable_timestamp) {
                    line.deleted_at = deleted_at;
                }
                touched.insert(line.order_id.as_uuid());
                self.store.put_order_line(&line).await?;
            }
            OpType::Delete => {
                let Some(mut line) = self.store.get_order_line_any(&id).await? else {
                    tracing::warn!(entity = %op.entity_id, "skipping DELETE for unknown order line");
                    return Ok(());
                };
                if line.deleted_at.is_some() {
                    return Ok(());
                }
                let now = now_ms();
                line.deleted_at = Some(now);
                line.version += 1;
                line.updated_at = now;
                touched.insert(line.order_id.as_uuid());
                self.store.put_order_line(&line).await?;
            }
        }
        Ok(())
    }

    /// Apply a server op for an entity that has local pending work, then
    /// re-apply the local intent on top so the optimistic view survives
    /// until the next push resolves it. The outbox itself is not modified.
    async fn rebase(
        &self,
        server_op: &LogOperation,
        pending: &[OutboxOperation],
        touched: &mut HashSet<Uuid>,
    ) -> Result<()> {
        self.apply(server_op, touched).await?;

        let deleted_by_server = server_op.operation_type == OpType::Delete
            || server_op
                .data
                .get("deleted_at")
                .is_some_and(|value| !value.is_null());
        if deleted_by_server {
            tracing::warn!(
                entity = %server_op.entity_id,
                pending = pending.len(),
                "server deleted an entity with local pending ops; they will be rejected on push"
            );
            return Ok(());
        }

        for local in pending {
            self.reapply_local(local).await?;
        }
        Ok(())
    }

    /// Re-apply one local pending op's effect onto the entity row only,
    /// leaving the version at the server's value.
    async fn reapply_local(&self, local: &OutboxOperation) -> Result<()> {
        let data = local.data_map();
        match (local.entity_type, local.op_type) {
            (EntityKind::Order, OpType::Create | OpType::Update) => {
                let id = OrderId::from(local.entity_id);
                if let Some(mut order) = self.store.get_order_any(&id).await? {
                    order.apply_fields(&data);
                    self.store.put_order(&order).await?;
                }
            }
            (EntityKind::Order, OpType::Delete) => {
                let id = OrderId::from(local.entity_id);
                if let Some(mut order) = self.store.get_order_any(&id).await? {
                    let now = now_ms();
                    order.deleted_at = Some(now);
                    self.store.put_order(&order).await?;
                    for mut line in self.store.lines_for_order(&id).await? {
                        line.deleted_at = Some(now);
                        self.store.put_order_line(&line).await?;
                    }
                }
            }
            (EntityKind::OrderLine, OpType::Create | OpType::Update) => {
                let id = OrderLineId::from(local.entity_id);
                if let Some(mut line) = self.store.get_order_line_any(&id).await? {
                    line.apply_fields(&data);
                    self.store.put_order_line(&line).await?;
                }
            }
            (EntityKind::OrderLine, OpType::Delete) => {
                let id = OrderLineId::from(local.entity_id);
                if let Some(mut line) = self.store.get_order_line_any(&id).await? {
                    line.deleted_at = Some(now_ms());
                    self.store.put_order_line(&line).await?;
                }
            }
        }
        Ok(())
    }
}

/// Assemble a full order row from a CREATE log entry.
fn order_from_log(entity_id: Uuid, data: &Map<String, Value>) -> Option<Order> {
    let now = now_ms();
    let mut order = Order {
        id: OrderId::from(entity_id),
        partner_id: Uuid::nil(),
        status: 0,
        order_date: None,
        delivery_date: String::new(),
        comment: None,
        created_at: data.get("created_at").and_then(timestamp_value).unwrap_or(now),
        updated_at: data.get("updated_at").and_then(timestamp_value).unwrap_or(now),
        version: data.get("version").and_then(Value::as_i64).unwrap_or(1),
        deleted_at: None,
    };
    order.apply_fields(data);

    if order.partner_id.is_nil() || order.delivery_date.is_empty() {
        return None;
    }
    Some(order)
}

/// Assemble a full order line row from a CREATE log entry.
fn line_from_log(entity_id: Uuid, data: &Map<String, Value>) -> Option<OrderLine> {
    let order_id = data
        .get("order_id")
        .and_then(Value::as_str)
        .and_then(|value| Uuid::parse_str(value).ok())?;
    let now = now_ms();
    let mut line = OrderLine {
        id: OrderLineId::from(entity_id),
        order_id: OrderId::from(order_id),
        product_id: Uuid::nil(),
        unit_id: Uuid::nil(),
        quantity: 0.0,
        price: 0.0,
        comment: None,
        created_at: data.get("created_at").and_then(timestamp_value).unwrap_or(now),
        updated_at: data.get("updated_at").and_then(timestamp_value).unwrap_or(now),
        version: data.get("version").and_then(Value::as_i64).unwrap_or(1),
        deleted_at: None,
    };
    line.apply_fields(data);

    if line.product_id.is_nil() || line.unit_id.is_nil() {
        return None;
    }
    Some(line)
}

/// A timestamp carried either as Unix ms or as an RFC 3339 string.
fn timestamp_value(value: &Value) -> Option<i64> {
    match value {
        Value::Number(_) => value.as_i64(),
        Value::String(text) => rfc3339_to_ms(text),
        _ => None,
    }
}

/// `deleted_at` as sent by the server: null clears, otherwise a timestamp.
fn nullable_timestamp(value: &Value) -> Option<i64> {
    if value.is_null() {
        None
    } else {
        timestamp_value(value)
    }
}
