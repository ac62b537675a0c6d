//! Order line repository

use serde_json::Value;

use crate::db::store::{
    append_operation_conn, get_order_conn, get_order_line_conn, put_order_line_conn,
};
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{
    EntityKind, NewOrderLine, OpType, OrderLine, OrderLineId, OrderLinePatch,
};
use crate::util::now_ms;

/// CRUD for order lines, with automatic outbox emission
#[derive(Clone)]
pub struct OrderLineRepository {
    store: LocalStore,
}

impl OrderLineRepository {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Create a line under an existing order and queue a CREATE.
    pub async fn create(&self, fields: NewOrderLine) -> Result<OrderLine> {
        let now = now_ms();
        let line = OrderLine {
            id: OrderLineId::new(),
            order_id: fields.order_id,
            product_id: fields.product_id,
            unit_id: fields.unit_id,
            quantity: fields.quantity,
            price: fields.price,
            comment: fields.comment,
            created_at: now,
            updated_at: now,
            version: 1,
            deleted_at: None,
        };

        let row = line.clone();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                if get_order_conn(&tx, &row.order_id, false)?.is_none() {
                    return Err(Error::NotFound(format!("order {}", row.order_id)));
                }
                put_order_line_conn(&tx, &row)?;
                append_operation_conn(
                    &tx,
                    EntityKind::OrderLine,
                    row.id.as_uuid(),
                    OpType::Create,
                    Value::Object(row.create_fields()),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(line)
    }

    /// Apply a patch locally and queue an UPDATE carrying the expected
    /// pre-increment version.
    pub async fn update(&self, id: &OrderLineId, patch: OrderLinePatch) -> Result<OrderLine> {
        let id = *id;
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut line = get_order_line_conn(&tx, &id, false)?
                    .ok_or_else(|| Error::NotFound(format!("order line {id}")))?;

                let mut data = patch.fields();
                line.apply_fields(&data);
                // Sent so the server can resolve the parent order without a
                // lookup; not a writable field.
                data.insert("order_id".into(), Value::String(line.order_id.as_str()));
                data.insert("version".into(), Value::from(line.version));

                line.version += 1;
                line.updated_at = now_ms();

                put_order_line_conn(&tx, &line)?;
                append_operation_conn(
                    &tx,
                    EntityKind::OrderLine,
                    id.as_uuid(),
                    OpType::Update,
                    Value::Object(data),
                )?;
                tx.commit()?;
                Ok(line)
            })
            .await
    }

    /// Soft-delete a line locally and queue a DELETE.
    pub async fn delete(&self, id: &OrderLineId) -> Result<()> {
        let id = *id;
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut line = get_order_line_conn(&tx, &id, false)?
                    .ok_or_else(|| Error::NotFound(format!("order line {id}")))?;

                let mut data = serde_json::Map::new();
                data.insert("order_id".into(), Value::String(line.order_id.as_str()));
                data.insert("version".into(), Value::from(line.version));
                append_operation_conn(
                    &tx,
                    EntityKind::OrderLine,
                    id.as_uuid(),
                    OpType::Delete,
                    Value::Object(data),
                )?;

                let now = now_ms();
                line.deleted_at = Some(now);
                line.version += 1;
                line.updated_at = now;
                put_order_line_conn(&tx, &line)?;

                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Fetch one non-deleted line.
    pub async fn get(&self, id: &OrderLineId) -> Result<Option<OrderLine>> {
        self.store.get_order_line(id).await
    }
}
