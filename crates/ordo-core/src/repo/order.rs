//! Order repository

use std::collections::HashMap;

use serde_json::Value;
use uuid::Uuid;

use crate::db::store::{append_operation_conn, get_order_conn, put_order_conn};
use crate::db::LocalStore;
use crate::error::{Error, Result};
use crate::models::{
    EntityKind, NewOrder, OpType, Order, OrderId, OrderLine, OrderPatch, Partner,
};
use crate::util::now_ms;

/// An order together with its non-deleted lines
#[derive(Debug, Clone, PartialEq)]
pub struct OrderWithLines {
    pub order: Order,
    pub lines: Vec<OrderLine>,
}

/// Recap entry: one partner's orders for a delivery date
#[derive(Debug, Clone, PartialEq)]
pub struct RecapGroup {
    /// `None` when the partner is not (yet) in the local reference set
    pub partner: Option<Partner>,
    pub orders: Vec<OrderWithLines>,
}

/// CRUD for orders, with automatic outbox emission
#[derive(Clone)]
pub struct OrderRepository {
    store: LocalStore,
}

impl OrderRepository {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    /// Create an order locally and queue a CREATE for the server.
    pub async fn create(&self, fields: NewOrder) -> Result<Order> {
        let now = now_ms();
        let order = Order {
            id: OrderId::new(),
            partner_id: fields.partner_id,
            status: fields.status,
            order_date: fields.order_date,
            delivery_date: fields.delivery_date,
            comment: fields.comment,
            created_at: now,
            updated_at: now,
            version: 1,
            deleted_at: None,
        };

        let row = order.clone();
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                put_order_conn(&tx, &row)?;
                append_operation_conn(
                    &tx,
                    EntityKind::Order,
                    row.id.as_uuid(),
                    OpType::Create,
                    Value::Object(row.create_fields()),
                )?;
                tx.commit()?;
                Ok(())
            })
            .await?;

        Ok(order)
    }

    /// Apply a patch locally and queue an UPDATE carrying the expected
    /// pre-increment version.
    pub async fn update(&self, id: &OrderId, patch: OrderPatch) -> Result<Order> {
        let id = *id;
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut order = get_order_conn(&tx, &id, false)?
                    .ok_or_else(|| Error::NotFound(format!("order {id}")))?;

                let mut data = patch.fields();
                order.apply_fields(&data);
                data.insert("version".into(), Value::from(order.version));

                order.version += 1;
                order.updated_at = now_ms();

                put_order_conn(&tx, &order)?;
                append_operation_conn(
                    &tx,
                    EntityKind::Order,
                    id.as_uuid(),
                    OpType::Update,
                    Value::Object(data),
                )?;
                tx.commit()?;
                Ok(order)
            })
            .await
    }

    /// Soft-delete an order (and its lines) locally and queue a DELETE.
    pub async fn delete(&self, id: &OrderId) -> Result<()> {
        let id = *id;
        self.store
            .with_conn(move |conn| {
                let tx = conn.transaction()?;
                let mut order = get_order_conn(&tx, &id, false)?
                    .ok_or_else(|| Error::NotFound(format!("order {id}")))?;

                let mut data = serde_json::Map::new();
                data.insert("version".into(), Value::from(order.version));
                append_operation_conn(
                    &tx,
                    EntityKind::Order,
                    id.as_uuid(),
                    OpType::Delete,
                    Value::Object(data),
                )?;

                let now = now_ms();
                order.deleted_at = Some(now);
                order.version += 1;
                order.updated_at = now;
                put_order_conn(&tx, &order)?;

                // Lines are left untouched here: hiding the parent already
                // hides them, and a conflicted delete can then restore the
                // order without guessing which lines to resurrect. The
                // cascade happens when the accepted DELETE comes back
                // through the pull path.
                tx.commit()?;
                Ok(())
            })
            .await
    }

    /// Fetch one order with its lines.
    pub async fn get(&self, id: &OrderId) -> Result<Option<OrderWithLines>> {
        let Some(order) = self.store.get_order(id).await? else {
            return Ok(None);
        };
        let lines = self.store.lines_for_order(id).await?;
        Ok(Some(OrderWithLines { order, lines }))
    }

    /// The recap read query: orders for a delivery date grouped by partner,
    /// partners sorted by name, unknown partners last.
    pub async fn recap(&self, delivery_date: &str) -> Result<Vec<RecapGroup>> {
        let orders = self.store.orders_for_delivery_date(delivery_date).await?;
        let partners: HashMap<Uuid, Partner> = self
            .store
            .list_partners()
            .await?
            .into_iter()
            .map(|partner| (partner.id, partner))
            .collect();

        let mut groups: Vec<RecapGroup> = Vec::new();
        let mut index_by_partner: HashMap<Uuid, usize> = HashMap::new();

        for order in orders {
            let lines = self.store.lines_for_order(&order.id).await?;
            let entry = OrderWithLines { order, lines };
            let partner_id = entry.order.partner_id;

            if let Some(&index) = index_by_partner.get(&partner_id) {
                groups[index].orders.push(entry);
            } else {
                index_by_partner.insert(partner_id, groups.len());
                groups.push(RecapGroup {
                    partner: partners.get(&partner_id).cloned(),
                    orders: vec![entry],
                });
            }
        }

        groups.sort_by(|a, b| match (&a.partner, &b.partner) {
            (Some(a), Some(b)) => a.name.cmp(&b.name),
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        });

        Ok(groups)
    }
}
