//! Store operations over the local database
//!
//! `LocalStore` is a cheap-to-clone async handle; all access serializes on
//! one connection, so write groups executed inside a single call are atomic
//! with respect to every other task.

use std::str::FromStr;
use std::sync::Arc;

use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::Value;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::connection::Database;
use crate::error::{Error, Result};
use crate::models::{
    EntityKind, OpStatus, OpType, Order, OrderId, OrderLine, OrderLineId, OutboxOperation, Partner,
    Product, Unit,
};
use crate::util::now_ms;

/// After this many failed attempts an operation becomes terminally failed.
pub const MAX_RETRIES: i64 = 5;

const BASE_RETRY_DELAY_MS: i64 = 1_000;
const MAX_RETRY_DELAY_MS: i64 = 5 * 60 * 1_000;

const META_LAST_SYNC_ID: &str = "last_sync_id";
const META_LAST_SNAPSHOT_TIMESTAMP: &str = "last_snapshot_timestamp";
const META_LAST_PUSH_TIMESTAMP: &str = "last_push_timestamp";
const META_LAST_SYNC_TIMESTAMP: &str = "last_sync_timestamp";

/// Exponential backoff delay for the given (1-based) retry count.
#[must_use]
pub fn retry_delay_ms(retry_count: i64) -> i64 {
    let exponent = (retry_count - 1).clamp(0, 30) as u32;
    BASE_RETRY_DELAY_MS
        .saturating_mul(1_i64 << exponent)
        .min(MAX_RETRY_DELAY_MS)
}

/// Thread-safe handle to the local store.
#[derive(Clone)]
pub struct LocalStore {
    db: Arc<Mutex<Database>>,
}

impl LocalStore {
    /// Open a store at the given filesystem path.
    pub fn open(path: impl AsRef<std::path::Path>) -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open(path)?)),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub fn open_in_memory() -> Result<Self> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
        })
    }

    /// Run a closure against the locked connection.
    ///
    /// Repositories use this to write an entity row and its outbox record
    /// inside one transaction.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        let mut db = self.db.lock().await;
        f(db.connection_mut())
    }

    // --- orders ---

    /// Fetch a non-deleted order.
    pub async fn get_order(&self, id: &OrderId) -> Result<Option<Order>> {
        let id = *id;
        self.with_conn(move |conn| get_order_conn(conn, &id, false)).await
    }

    /// Fetch an order regardless of soft-delete state (sync internal).
    pub async fn get_order_any(&self, id: &OrderId) -> Result<Option<Order>> {
        let id = *id;
        self.with_conn(move |conn| get_order_conn(conn, &id, true)).await
    }

    /// Insert or replace an order row.
    pub async fn put_order(&self, order: &Order) -> Result<()> {
        let order = order.clone();
        self.with_conn(move |conn| put_order_conn(conn, &order)).await
    }

    /// Insert or replace many order rows in one transaction.
    pub async fn bulk_put_orders(&self, orders: Vec<Order>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for order in &orders {
                put_order_conn(&tx, order)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Non-deleted orders for a delivery date, oldest first.
    pub async fn orders_for_delivery_date(&self, date: &str) -> Result<Vec<Order>> {
        let date = date.to_string();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, partner_id, status, order_date, delivery_date, comment,
                        created_at, updated_at, version, deleted_at
                 FROM orders
                 WHERE delivery_date = ? AND deleted_at IS NULL
                 ORDER BY created_at ASC",
            )?;
            let orders = stmt
                .query_map(params![date], map_order)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(orders)
        })
        .await
    }

    // --- order lines ---

    /// Fetch a non-deleted order line.
    pub async fn get_order_line(&self, id: &OrderLineId) -> Result<Option<OrderLine>> {
        let id = *id;
        self.with_conn(move |conn| get_order_line_conn(conn, &id, false)).await
    }

    /// Fetch an order line regardless of soft-delete state (sync internal).
    pub async fn get_order_line_any(&self, id: &OrderLineId) -> Result<Option<OrderLine>> {
        let id = *id;
        self.with_conn(move |conn| get_order_line_conn(conn, &id, true)).await
    }

    /// Insert or replace an order line row.
    pub async fn put_order_line(&self, line: &OrderLine) -> Result<()> {
        let line = line.clone();
        self.with_conn(move |conn| put_order_line_conn(conn, &line)).await
    }

    /// Insert or replace many order line rows in one transaction.
    pub async fn bulk_put_order_lines(&self, lines: Vec<OrderLine>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for line in &lines {
                put_order_line_conn(&tx, line)?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Non-deleted lines of an order, oldest first.
    pub async fn lines_for_order(&self, order_id: &OrderId) -> Result<Vec<OrderLine>> {
        let order_id = *order_id;
        self.with_conn(move |conn| lines_for_order_conn(conn, &order_id)).await
    }

    // --- reference collections ---

    /// Replace reference partners in one transaction.
    pub async fn bulk_put_partners(&self, partners: Vec<Partner>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for partner in &partners {
                tx.execute(
                    "INSERT OR REPLACE INTO partners (id, name, code, partner_type)
                     VALUES (?, ?, ?, ?)",
                    params![
                        partner.id.to_string(),
                        partner.name,
                        partner.code,
                        partner.partner_type
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Replace reference products in one transaction.
    pub async fn bulk_put_products(&self, products: Vec<Product>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for product in &products {
                tx.execute(
                    "INSERT OR REPLACE INTO products (id, name, short_name, sku, code)
                     VALUES (?, ?, ?, ?, ?)",
                    params![
                        product.id.to_string(),
                        product.name,
                        product.short_name,
                        product.sku,
                        product.code
                    ],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Replace reference units in one transaction.
    pub async fn bulk_put_units(&self, units: Vec<Unit>) -> Result<()> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for unit in &units {
                tx.execute(
                    "INSERT OR REPLACE INTO units (id, name, abbreviation) VALUES (?, ?, ?)",
                    params![unit.id.to_string(), unit.name, unit.abbreviation],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// All partners, sorted by name.
    pub async fn list_partners(&self) -> Result<Vec<Partner>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, code, partner_type FROM partners ORDER BY name ASC",
            )?;
            let partners = stmt
                .query_map([], map_partner)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(partners)
        })
        .await
    }

    /// All products, sorted by name.
    pub async fn list_products(&self) -> Result<Vec<Product>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, name, short_name, sku, code FROM products ORDER BY name ASC",
            )?;
            let products = stmt
                .query_map([], map_product)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(products)
        })
        .await
    }

    /// All units, sorted by name.
    pub async fn list_units(&self) -> Result<Vec<Unit>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, name, abbreviation FROM units ORDER BY name ASC")?;
            let units = stmt
                .query_map([], map_unit)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(units)
        })
        .await
    }

    // --- outbox ---

    /// Append a pending operation, allocating the next sequence number.
    pub async fn append_operation(
        &self,
        entity_type: EntityKind,
        entity_id: Uuid,
        op_type: OpType,
        data: Value,
    ) -> Result<OutboxOperation> {
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let op = append_operation_conn(&tx, entity_type, entity_id, op_type, data)?;
            tx.commit()?;
            Ok(op)
        })
        .await
    }

    /// Operations eligible for the next push: pending ones plus failed ones
    /// whose retry deadline has passed, in sequence order.
    pub async fn pending_operations(&self) -> Result<Vec<OutboxOperation>> {
        let now = now_ms();
        self.with_conn(move |conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sequence_number, entity_type, entity_id, op_type, data,
                        timestamp, status, retry_count, next_retry_at, last_error
                 FROM outbox
                 WHERE status = 'pending'
                    OR (status = 'failed' AND next_retry_at IS NOT NULL AND next_retry_at <= ?)
                 ORDER BY sequence_number ASC",
            )?;
            let ops = stmt
                .query_map(params![now], map_operation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ops)
        })
        .await
    }

    /// Count of operations still owed to the server, including failed ones
    /// scheduled for retry (terminally failed ones are excluded).
    pub async fn pending_count(&self) -> Result<i64> {
        self.with_conn(|conn| {
            let count = conn.query_row(
                "SELECT COUNT(*) FROM outbox
                 WHERE status IN ('pending', 'syncing')
                    OR (status = 'failed' AND next_retry_at IS NOT NULL)",
                [],
                |row| row.get(0),
            )?;
            Ok(count)
        })
        .await
    }

    /// Fetch one operation by id.
    pub async fn get_operation(&self, id: Uuid) -> Result<Option<OutboxOperation>> {
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT id, sequence_number, entity_type, entity_id, op_type, data,
                        timestamp, status, retry_count, next_retry_at, last_error
                 FROM outbox WHERE id = ?",
                params![id.to_string()],
                map_operation,
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    /// Every outbox row, in sequence order (diagnostics and tests).
    pub async fn list_operations(&self) -> Result<Vec<OutboxOperation>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, sequence_number, entity_type, entity_id, op_type, data,
                        timestamp, status, retry_count, next_retry_at, last_error
                 FROM outbox ORDER BY sequence_number ASC",
            )?;
            let ops = stmt
                .query_map([], map_operation)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(ops)
        })
        .await
    }

    /// Move the given operations to `syncing`.
    pub async fn mark_syncing(&self, ids: &[Uuid]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE outbox SET status = 'syncing' WHERE id = ?",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Mark one operation synced (terminal).
    pub async fn mark_synced(&self, id: Uuid) -> Result<()> {
        self.mark_synced_many(&[id]).await
    }

    /// Mark many operations synced in one transaction.
    pub async fn mark_synced_many(&self, ids: &[Uuid]) -> Result<()> {
        let ids: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            for id in &ids {
                tx.execute(
                    "UPDATE outbox
                     SET status = 'synced', next_retry_at = NULL, last_error = NULL
                     WHERE id = ?",
                    params![id],
                )?;
            }
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Record a transport failure: bump the retry count and schedule the
    /// next attempt with exponential backoff. After [`MAX_RETRIES`] the
    /// operation becomes terminally failed (`next_retry_at = NULL`).
    pub async fn mark_failed(&self, id: Uuid, error_message: &str) -> Result<()> {
        let message = error_message.to_string();
        self.with_conn(move |conn| {
            let tx = conn.transaction()?;
            let retry_count: i64 = tx
                .query_row(
                    "SELECT retry_count FROM outbox WHERE id = ?",
                    params![id.to_string()],
                    |row| row.get(0),
                )
                .optional()?
                .ok_or_else(|| Error::NotFound(format!("outbox operation {id}")))?;

            let new_count = retry_count + 1;
            let next_retry_at = if new_count > MAX_RETRIES {
                None
            } else {
                Some(now_ms() + retry_delay_ms(new_count))
            };

            tx.execute(
                "UPDATE outbox
                 SET status = 'failed', retry_count = ?, next_retry_at = ?, last_error = ?
                 WHERE id = ?",
                params![new_count, next_retry_at, message, id.to_string()],
            )?;
            tx.commit()?;
            Ok(())
        })
        .await
    }

    /// Mark one operation rejected by the server (terminal).
    pub async fn mark_rejected(&self, id: Uuid, message: &str) -> Result<()> {
        let message = message.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "UPDATE outbox
                 SET status = 'rejected', next_retry_at = NULL, last_error = ?
                 WHERE id = ?",
                params![message, id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    /// Set the local version of an entity after server acknowledgement.
    pub async fn update_entity_version(
        &self,
        entity_type: EntityKind,
        entity_id: Uuid,
        new_version: i64,
    ) -> Result<()> {
        self.with_conn(move |conn| {
            let table = match entity_type {
                EntityKind::Order => "orders",
                EntityKind::OrderLine => "order_lines",
            };
            conn.execute(
                &format!("UPDATE {table} SET version = ? WHERE id = ?"),
                params![new_version, entity_id.to_string()],
            )?;
            Ok(())
        })
        .await
    }

    // --- sync metadata ---

    /// Read a metadata value.
    pub async fn meta_get(&self, key: &str) -> Result<Option<String>> {
        let key = key.to_string();
        self.with_conn(move |conn| {
            conn.query_row(
                "SELECT value FROM metadata WHERE key = ?",
                params![key],
                |row| row.get(0),
            )
            .optional()
            .map_err(Error::from)
        })
        .await
    }

    /// Write a metadata value.
    pub async fn meta_set(&self, key: &str, value: &str) -> Result<()> {
        let key = key.to_string();
        let value = value.to_string();
        self.with_conn(move |conn| {
            conn.execute(
                "INSERT OR REPLACE INTO metadata (key, value) VALUES (?, ?)",
                params![key, value],
            )?;
            Ok(())
        })
        .await
    }

    /// Highest server sync id already ingested (0 before the first pull).
    pub async fn last_sync_id(&self) -> Result<i64> {
        Ok(self
            .meta_get(META_LAST_SYNC_ID)
            .await?
            .and_then(|value| value.parse().ok())
            .unwrap_or(0))
    }

    pub async fn set_last_sync_id(&self, sync_id: i64) -> Result<()> {
        self.meta_set(META_LAST_SYNC_ID, &sync_id.to_string()).await
    }

    /// When the initial snapshot completed, if ever.
    pub async fn last_snapshot_timestamp(&self) -> Result<Option<i64>> {
        Ok(self
            .meta_get(META_LAST_SNAPSHOT_TIMESTAMP)
            .await?
            .and_then(|value| value.parse().ok()))
    }

    pub async fn set_last_snapshot_timestamp(&self, timestamp: i64) -> Result<()> {
        self.meta_set(META_LAST_SNAPSHOT_TIMESTAMP, &timestamp.to_string())
            .await
    }

    pub async fn last_push_timestamp(&self) -> Result<Option<i64>> {
        Ok(self
            .meta_get(META_LAST_PUSH_TIMESTAMP)
            .await?
            .and_then(|value| value.parse().ok()))
    }

    pub async fn set_last_push_timestamp(&self, timestamp: i64) -> Result<()> {
        self.meta_set(META_LAST_PUSH_TIMESTAMP, &timestamp.to_string())
            .await
    }

    pub async fn set_last_sync_timestamp(&self, timestamp: i64) -> Result<()> {
        self.meta_set(META_LAST_SYNC_TIMESTAMP, &timestamp.to_string())
            .await
    }
}

// --- connection-level helpers shared with the repositories ---

pub(crate) fn get_order_conn(
    conn: &Connection,
    id: &OrderId,
    include_deleted: bool,
) -> Result<Option<Order>> {
    let sql = if include_deleted {
        "SELECT id, partner_id, status, order_date, delivery_date, comment,
                created_at, updated_at, version, deleted_at
         FROM orders WHERE id = ?"
    } else {
        "SELECT id, partner_id, status, order_date, delivery_date, comment,
                created_at, updated_at, version, deleted_at
         FROM orders WHERE id = ? AND deleted_at IS NULL"
    };
    conn.query_row(sql, params![id.as_str()], map_order)
        .optional()
        .map_err(Error::from)
}

pub(crate) fn put_order_conn(conn: &Connection, order: &Order) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO orders
         (id, partner_id, status, order_date, delivery_date, comment,
          created_at, updated_at, version, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            order.id.as_str(),
            order.partner_id.to_string(),
            order.status,
            order.order_date,
            order.delivery_date,
            order.comment,
            order.created_at,
            order.updated_at,
            order.version,
            order.deleted_at
        ],
    )?;
    Ok(())
}

pub(crate) fn get_order_line_conn(
    conn: &Connection,
    id: &OrderLineId,
    include_deleted: bool,
) -> Result<Option<OrderLine>> {
    let sql = if include_deleted {
        "SELECT id, order_id, product_id, unit_id, quantity, price, comment,
                created_at, updated_at, version, deleted_at
         FROM order_lines WHERE id = ?"
    } else {
        "SELECT id, order_id, product_id, unit_id, quantity, price, comment,
                created_at, updated_at, version, deleted_at
         FROM order_lines WHERE id = ? AND deleted_at IS NULL"
    };
    conn.query_row(sql, params![id.as_str()], map_order_line)
        .optional()
        .map_err(Error::from)
}

pub(crate) fn put_order_line_conn(conn: &Connection, line: &OrderLine) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO order_lines
         (id, order_id, product_id, unit_id, quantity, price, comment,
          created_at, updated_at, version, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            line.id.as_str(),
            line.order_id.as_str(),
            line.product_id.to_string(),
            line.unit_id.to_string(),
            line.quantity,
            line.price,
            line.comment,
            line.created_at,
            line.updated_at,
            line.version,
            line.deleted_at
        ],
    )?;
    Ok(())
}

pub(crate) fn lines_for_order_conn(conn: &Connection, order_id: &OrderId) -> Result<Vec<OrderLine>> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, unit_id, quantity, price, comment,
                created_at, updated_at, version, deleted_at
         FROM order_lines
         WHERE order_id = ? AND deleted_at IS NULL
         ORDER BY created_at ASC",
    )?;
    let lines = stmt
        .query_map(params![order_id.as_str()], map_order_line)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(lines)
}

/// Allocate the next sequence number and insert a pending operation.
///
/// Must run inside the caller's transaction so that the max+1 allocation
/// and the insert are atomic.
pub(crate) fn append_operation_conn(
    conn: &Connection,
    entity_type: EntityKind,
    entity_id: Uuid,
    op_type: OpType,
    data: Value,
) -> Result<OutboxOperation> {
    let sequence_number: i64 = conn.query_row(
        "SELECT COALESCE(MAX(sequence_number), 0) + 1 FROM outbox",
        [],
        |row| row.get(0),
    )?;

    let op = OutboxOperation {
        id: Uuid::now_v7(),
        sequence_number,
        entity_type,
        entity_id,
        op_type,
        data,
        timestamp: now_ms(),
        status: OpStatus::Pending,
        retry_count: 0,
        next_retry_at: None,
        last_error: None,
    };

    conn.execute(
        "INSERT INTO outbox
         (id, sequence_number, entity_type, entity_id, op_type, data, timestamp,
          status, retry_count, next_retry_at, last_error)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        params![
            op.id.to_string(),
            op.sequence_number,
            op.entity_type.as_str(),
            op.entity_id.to_string(),
            op.op_type.as_str(),
            op.data.to_string(),
            op.timestamp,
            op.status.as_str(),
            op.retry_count,
            op.next_retry_at,
            op.last_error
        ],
    )?;

    Ok(op)
}

// --- row mappers ---

fn parse_uuid(index: usize, value: &str) -> rusqlite::Result<Uuid> {
    Uuid::parse_str(value)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e)))
}

fn map_order(row: &rusqlite::Row<'_>) -> rusqlite::Result<Order> {
    let id: String = row.get(0)?;
    let partner_id: String = row.get(1)?;
    Ok(Order {
        id: OrderId::from(parse_uuid(0, &id)?),
        partner_id: parse_uuid(1, &partner_id)?,
        status: row.get(2)?,
        order_date: row.get(3)?,
        delivery_date: row.get(4)?,
        comment: row.get(5)?,
        created_at: row.get(6)?,
        updated_at: row.get(7)?,
        version: row.get(8)?,
        deleted_at: row.get(9)?,
    })
}

fn map_order_line(row: &rusqlite::Row<'_>) -> rusqlite::Result<OrderLine> {
    let id: String = row.get(0)?;
    let order_id: String = row.get(1)?;
    let product_id: String = row.get(2)?;
    let unit_id: String = row.get(3)?;
    Ok(OrderLine {
        id: OrderLineId::from(parse_uuid(0, &id)?),
        order_id: OrderId::from(parse_uuid(1, &order_id)?),
        product_id: parse_uuid(2, &product_id)?,
        unit_id: parse_uuid(3, &unit_id)?,
        quantity: row.get(4)?,
        price: row.get(5)?,
        comment: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
        version: row.get(9)?,
        deleted_at: row.get(10)?,
    })
}

fn map_partner(row: &rusqlite::Row<'_>) -> rusqlite::Result<Partner> {
    let id: String = row.get(0)?;
    Ok(Partner {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        code: row.get(2)?,
        partner_type: row.get(3)?,
    })
}

fn map_product(row: &rusqlite::Row<'_>) -> rusqlite::Result<Product> {
    let id: String = row.get(0)?;
    Ok(Product {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        short_name: row.get(2)?,
        sku: row.get(3)?,
        code: row.get(4)?,
    })
}

fn map_unit(row: &rusqlite::Row<'_>) -> rusqlite::Result<Unit> {
    let id: String = row.get(0)?;
    Ok(Unit {
        id: parse_uuid(0, &id)?,
        name: row.get(1)?,
        abbreviation: row.get(2)?,
    })
}

fn map_operation(row: &rusqlite::Row<'_>) -> rusqlite::Result<OutboxOperation> {
    let id: String = row.get(0)?;
    let entity_type: String = row.get(2)?;
    let entity_id: String = row.get(3)?;
    let op_type: String = row.get(4)?;
    let data: String = row.get(5)?;
    let status: String = row.get(7)?;

    let conversion = |index: usize, message: String| {
        rusqlite::Error::FromSqlConversionFailure(
            index,
            Type::Text,
            Box::<dyn std::error::Error + Send + Sync>::from(message),
        )
    };

    Ok(OutboxOperation {
        id: parse_uuid(0, &id)?,
        sequence_number: row.get(1)?,
        entity_type: EntityKind::from_str(&entity_type).map_err(|e| conversion(2, e))?,
        entity_id: parse_uuid(3, &entity_id)?,
        op_type: OpType::from_str(&op_type).map_err(|e| conversion(4, e))?,
        data: serde_json::from_str(&data)
            .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?,
        timestamp: row.get(6)?,
        status: OpStatus::from_str(&status).map_err(|e| conversion(7, e))?,
        retry_count: row.get(8)?,
        next_retry_at: row.get(9)?,
        last_error: row.get(10)?,
    })
}
