//! Server-side storage: entity tables and the append-only operation log
//!
//! Entity rows are handed around as JSON maps so the conflict resolver and
//! the operation log share one snapshot format. Timestamps are RFC 3339
//! text, which is also the wire encoding.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use serde_json::{Map, Value};
use tokio::sync::Mutex;
use uuid::Uuid;

use ordo_core::models::{EntityKind, OpType};
use ordo_core::protocol::{
    LogOperation, WireOrder, WireOrderLine, WirePartner, WireProduct, WireUnit,
};

use crate::error::AppError;

/// Current Unix time as RFC 3339.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339()
}

/// Database wrapper for the server's `SQLite` connection
pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let conn = Connection::open(path)?;
        let db = Self { conn };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()?;
        let db = Self { conn };
        db.configure()?;
        db.migrate()?;
        Ok(db)
    }

    fn configure(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;
            ",
        )?;
        Ok(())
    }

    fn migrate(&self) -> Result<(), AppError> {
        self.conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS partners (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                code TEXT,
                partner_type INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS products (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                short_name TEXT,
                sku TEXT,
                code TEXT
            );

            CREATE TABLE IF NOT EXISTS units (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                abbreviation TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                partner_id TEXT NOT NULL,
                status INTEGER NOT NULL DEFAULT 0,
                order_date TEXT,
                delivery_date TEXT NOT NULL,
                comment TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_orders_delivery_date ON orders(delivery_date);

            CREATE TABLE IF NOT EXISTS order_lines (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                product_id TEXT NOT NULL,
                unit_id TEXT NOT NULL,
                quantity REAL NOT NULL DEFAULT 0,
                price REAL NOT NULL DEFAULT 0,
                comment TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                version INTEGER NOT NULL DEFAULT 1,
                deleted_at TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_order_lines_order ON order_lines(order_id);

            CREATE TABLE IF NOT EXISTS operation_log (
                sync_id INTEGER PRIMARY KEY AUTOINCREMENT,
                entity_type TEXT NOT NULL,
                entity_id TEXT NOT NULL,
                operation_type TEXT NOT NULL,
                data TEXT NOT NULL,
                timestamp TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_operation_log_entity
                ON operation_log(entity_type, entity_id);
            ",
        )?;
        Ok(())
    }

    pub fn connection_mut(&mut self) -> &mut Connection {
        &mut self.conn
    }
}

/// Thread-safe handle to the server store
#[derive(Clone)]
pub struct ServerStore {
    db: Arc<Mutex<Database>>,
}

impl ServerStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open(path)?)),
        })
    }

    pub fn open_in_memory() -> Result<Self, AppError> {
        Ok(Self {
            db: Arc::new(Mutex::new(Database::open_in_memory()?)),
        })
    }

    /// Run a closure against the locked connection; push handlers use this
    /// to wrap one operation per transaction.
    pub async fn with_conn<T, F>(&self, f: F) -> Result<T, AppError>
    where
        F: FnOnce(&mut Connection) -> Result<T, AppError>,
    {
        let mut db = self.db.lock().await;
        f(db.connection_mut())
    }

    /// Change-log entries after `since`, plus whether more are waiting.
    pub async fn list_log(&self, since: i64, limit: i64) -> Result<(Vec<LogOperation>, bool), AppError> {
        self.with_conn(move |conn| list_log(conn, since, limit)).await
    }

    /// The full snapshot served to fresh clients (soft-deleted rows are
    /// omitted; they are only reachable through the change log).
    pub async fn snapshot(&self) -> Result<SnapshotRows, AppError> {
        self.with_conn(|conn| {
            Ok(SnapshotRows {
                partners: list_partners(conn)?,
                products: list_products(conn)?,
                units: list_units(conn)?,
                orders: list_orders(conn)?,
                order_lines: list_order_lines(conn)?,
            })
        })
        .await
    }

    pub async fn list_partners(&self) -> Result<Vec<WirePartner>, AppError> {
        self.with_conn(list_partners).await
    }

    pub async fn list_products(&self) -> Result<Vec<WireProduct>, AppError> {
        self.with_conn(list_products).await
    }

    pub async fn list_units(&self) -> Result<Vec<WireUnit>, AppError> {
        self.with_conn(list_units).await
    }
}

/// The five collections served by `/sync/snapshot`
pub struct SnapshotRows {
    pub partners: Vec<WirePartner>,
    pub products: Vec<WireProduct>,
    pub units: Vec<WireUnit>,
    pub orders: Vec<WireOrder>,
    pub order_lines: Vec<WireOrderLine>,
}

// --- entity rows as JSON maps ---

/// Load an entity row as a JSON snapshot (including version, timestamps
/// and `deleted_at`), or `None` when the id is unknown.
pub fn get_entity_map(
    conn: &Connection,
    kind: EntityKind,
    id: Uuid,
) -> Result<Option<Map<String, Value>>, AppError> {
    match kind {
        EntityKind::Order => conn
            .query_row(
                "SELECT id, partner_id, status, order_date, delivery_date, comment,
                        created_at, updated_at, version, deleted_at
                 FROM orders WHERE id = ?",
                params![id.to_string()],
                |row| {
                    let mut map = Map::new();
                    map.insert("id".into(), Value::String(row.get::<_, String>(0)?));
                    map.insert("partner_id".into(), Value::String(row.get::<_, String>(1)?));
                    map.insert("status".into(), Value::from(row.get::<_, i64>(2)?));
                    map.insert("order_date".into(), option_string(row.get(3)?));
                    map.insert("delivery_date".into(), Value::String(row.get::<_, String>(4)?));
                    map.insert("comment".into(), option_string(row.get(5)?));
                    map.insert("created_at".into(), Value::String(row.get::<_, String>(6)?));
                    map.insert("updated_at".into(), Value::String(row.get::<_, String>(7)?));
                    map.insert("version".into(), Value::from(row.get::<_, i64>(8)?));
                    map.insert("deleted_at".into(), option_string(row.get(9)?));
                    Ok(map)
                },
            )
            .optional()
            .map_err(AppError::from),
        EntityKind::OrderLine => conn
            .query_row(
                "SELECT id, order_id, product_id, unit_id, quantity, price, comment,
                        created_at, updated_at, version, deleted_at
                 FROM order_lines WHERE id = ?",
                params![id.to_string()],
                |row| {
                    let mut map = Map::new();
                    map.insert("id".into(), Value::String(row.get::<_, String>(0)?));
                    map.insert("order_id".into(), Value::String(row.get::<_, String>(1)?));
                    map.insert("product_id".into(), Value::String(row.get::<_, String>(2)?));
                    map.insert("unit_id".into(), Value::String(row.get::<_, String>(3)?));
                    map.insert("quantity".into(), Value::from(row.get::<_, f64>(4)?));
                    map.insert("price".into(), Value::from(row.get::<_, f64>(5)?));
                    map.insert("comment".into(), option_string(row.get(6)?));
                    map.insert("created_at".into(), Value::String(row.get::<_, String>(7)?));
                    map.insert("updated_at".into(), Value::String(row.get::<_, String>(8)?));
                    map.insert("version".into(), Value::from(row.get::<_, i64>(9)?));
                    map.insert("deleted_at".into(), option_string(row.get(10)?));
                    Ok(map)
                },
            )
            .optional()
            .map_err(AppError::from),
    }
}

fn option_string(value: Option<String>) -> Value {
    value.map_or(Value::Null, Value::String)
}

/// Insert an order from a client CREATE data bag; returns the stored
/// snapshot. Validation failures surface as `BadRequest` so the sync
/// service can translate them into per-op errors.
pub fn insert_order_row(
    conn: &Connection,
    id: Uuid,
    data: &Map<String, Value>,
) -> Result<Map<String, Value>, AppError> {
    let partner_id = required_uuid(data, "partner_id")?;
    let delivery_date = data
        .get("delivery_date")
        .and_then(Value::as_str)
        .ok_or_else(|| AppError::bad_request("missing required field: delivery_date"))?;
    let status = data.get("status").and_then(Value::as_i64).unwrap_or(0);
    let order_date = data.get("order_date").and_then(Value::as_str);
    let comment = data.get("comment").and_then(Value::as_str);
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO orders
         (id, partner_id, status, order_date, delivery_date, comment,
          created_at, updated_at, version, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, 1, NULL)",
        params![
            id.to_string(),
            partner_id.to_string(),
            status,
            order_date,
            delivery_date,
            comment,
            now,
            now
        ],
    )?;

    get_entity_map(conn, EntityKind::Order, id)?
        .ok_or_else(|| AppError::internal("order vanished after insert"))
}

/// Insert an order line from a client CREATE data bag.
pub fn insert_line_row(
    conn: &Connection,
    id: Uuid,
    data: &Map<String, Value>,
) -> Result<Map<String, Value>, AppError> {
    let order_id = required_uuid(data, "order_id")?;
    let product_id = required_uuid(data, "product_id")?;
    let unit_id = required_uuid(data, "unit_id")?;
    let quantity = data
        .get("quantity")
        .and_then(Value::as_f64)
        .ok_or_else(|| AppError::bad_request("missing required field: quantity"))?;
    let price = data
        .get("price")
        .and_then(Value::as_f64)
        .ok_or_else(|| AppError::bad_request("missing required field: price"))?;
    let comment = data.get("comment").and_then(Value::as_str);
    let now = now_rfc3339();

    conn.execute(
        "INSERT INTO order_lines
         (id, order_id, product_id, unit_id, quantity, price, comment,
          created_at, updated_at, version, deleted_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, 1, NULL)",
        params![
            id.to_string(),
            order_id.to_string(),
            product_id.to_string(),
            unit_id.to_string(),
            quantity,
            price,
            comment,
            now,
            now
        ],
    )?;

    get_entity_map(conn, EntityKind::OrderLine, id)?
        .ok_or_else(|| AppError::internal("order line vanished after insert"))
}

fn required_uuid(data: &Map<String, Value>, field: &str) -> Result<Uuid, AppError> {
    data.get(field)
        .and_then(Value::as_str)
        .and_then(|value| Uuid::parse_str(value).ok())
        .ok_or_else(|| AppError::bad_request(format!("missing or invalid field: {field}")))
}

/// Apply resolved fields to an entity row and bump its version.
pub fn apply_entity_fields(
    conn: &Connection,
    kind: EntityKind,
    id: Uuid,
    fields: &Map<String, Value>,
    new_version: i64,
) -> Result<(), AppError> {
    let id = id.to_string();
    match kind {
        EntityKind::Order => {
            if let Some(value) = fields.get("partner_id").and_then(Value::as_str) {
                conn.execute(
                    "UPDATE orders SET partner_id = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("status").and_then(Value::as_i64) {
                conn.execute("UPDATE orders SET status = ? WHERE id = ?", params![value, id])?;
            }
            if let Some(value) = fields.get("order_date") {
                conn.execute(
                    "UPDATE orders SET order_date = ? WHERE id = ?",
                    params![value.as_str(), id],
                )?;
            }
            if let Some(value) = fields.get("delivery_date").and_then(Value::as_str) {
                conn.execute(
                    "UPDATE orders SET delivery_date = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("comment") {
                conn.execute(
                    "UPDATE orders SET comment = ? WHERE id = ?",
                    params![value.as_str(), id],
                )?;
            }
            conn.execute(
                "UPDATE orders SET version = ?, updated_at = ? WHERE id = ?",
                params![new_version, now_rfc3339(), id],
            )?;
        }
        EntityKind::OrderLine => {
            if let Some(value) = fields.get("product_id").and_then(Value::as_str) {
                conn.execute(
                    "UPDATE order_lines SET product_id = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("unit_id").and_then(Value::as_str) {
                conn.execute(
                    "UPDATE order_lines SET unit_id = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("quantity").and_then(Value::as_f64) {
                conn.execute(
                    "UPDATE order_lines SET quantity = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("price").and_then(Value::as_f64) {
                conn.execute(
                    "UPDATE order_lines SET price = ? WHERE id = ?",
                    params![value, id],
                )?;
            }
            if let Some(value) = fields.get("comment") {
                conn.execute(
                    "UPDATE order_lines SET comment = ? WHERE id = ?",
                    params![value.as_str(), id],
                )?;
            }
            conn.execute(
                "UPDATE order_lines SET version = ?, updated_at = ? WHERE id = ?",
                params![new_version, now_rfc3339(), id],
            )?;
        }
    }
    Ok(())
}

/// Soft-delete an entity. Deleting an order cascades to its lines, which
/// mirrors what every client does when it replays the DELETE log entry.
pub fn soft_delete_entity(
    conn: &Connection,
    kind: EntityKind,
    id: Uuid,
    new_version: i64,
) -> Result<(), AppError> {
    let now = now_rfc3339();
    match kind {
        EntityKind::Order => {
            conn.execute(
                "UPDATE orders SET deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
                params![now, new_version, now, id.to_string()],
            )?;
            conn.execute(
                "UPDATE order_lines
                 SET deleted_at = ?, version = version + 1, updated_at = ?
                 WHERE order_id = ? AND deleted_at IS NULL",
                params![now, now, id.to_string()],
            )?;
        }
        EntityKind::OrderLine => {
            conn.execute(
                "UPDATE order_lines SET deleted_at = ?, version = ?, updated_at = ? WHERE id = ?",
                params![now, new_version, now, id.to_string()],
            )?;
        }
    }
    Ok(())
}

// --- operation log ---

/// Append one change-log entry; returns the allocated sync id.
pub fn record_log(
    conn: &Connection,
    kind: EntityKind,
    entity_id: Uuid,
    op_type: OpType,
    data: &Value,
) -> Result<i64, AppError> {
    conn.execute(
        "INSERT INTO operation_log (entity_type, entity_id, operation_type, data, timestamp)
         VALUES (?, ?, ?, ?, ?)",
        params![
            kind.as_str(),
            entity_id.to_string(),
            op_type.as_str(),
            data.to_string(),
            now_rfc3339()
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

/// Field names this entity's UPDATE log entries touched after
/// `since_version` (replayed from the log, the way the client's pending
/// patch will collide with them).
pub fn changed_fields_since(
    conn: &Connection,
    kind: EntityKind,
    entity_id: Uuid,
    since_version: i64,
) -> Result<HashSet<String>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT data FROM operation_log
         WHERE entity_type = ? AND entity_id = ? AND operation_type = 'UPDATE'
         ORDER BY sync_id ASC",
    )?;
    let rows = stmt
        .query_map(params![kind.as_str(), entity_id.to_string()], |row| {
            row.get::<_, String>(0)
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let mut fields = HashSet::new();
    for raw in rows {
        let Ok(Value::Object(data)) = serde_json::from_str::<Value>(&raw) else {
            continue;
        };
        let log_version = data.get("version").and_then(Value::as_i64);
        if log_version.is_some_and(|version| version > since_version) {
            for key in data.keys() {
                if key != "version" {
                    fields.insert(key.clone());
                }
            }
        }
    }
    Ok(fields)
}

fn list_log(conn: &Connection, since: i64, limit: i64) -> Result<(Vec<LogOperation>, bool), AppError> {
    let mut stmt = conn.prepare(
        "SELECT sync_id, entity_type, entity_id, operation_type, data, timestamp
         FROM operation_log WHERE sync_id > ? ORDER BY sync_id ASC LIMIT ?",
    )?;
    // One extra row decides has_more without a second query.
    let mut entries = stmt
        .query_map(params![since, limit + 1], |row| {
            let entity_type: String = row.get(1)?;
            let entity_id: String = row.get(2)?;
            let operation_type: String = row.get(3)?;
            let data: String = row.get(4)?;
            Ok((
                row.get::<_, i64>(0)?,
                entity_type,
                entity_id,
                operation_type,
                data,
                row.get::<_, String>(5)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let has_more = entries.len() as i64 > limit;
    if has_more {
        entries.truncate(limit as usize);
    }

    let operations = entries
        .into_iter()
        .map(|(sync_id, entity_type, entity_id, operation_type, data, timestamp)| {
            Ok(LogOperation {
                sync_id,
                entity_type: entity_type
                    .parse()
                    .map_err(|e: String| AppError::internal(e))?,
                entity_id: Uuid::parse_str(&entity_id)
                    .map_err(|e| AppError::internal(e.to_string()))?,
                operation_type: operation_type
                    .parse()
                    .map_err(|e: String| AppError::internal(e))?,
                data: serde_json::from_str(&data)?,
                timestamp,
            })
        })
        .collect::<Result<Vec<_>, AppError>>()?;

    Ok((operations, has_more))
}

// --- snapshot queries ---

fn list_partners(conn: &mut Connection) -> Result<Vec<WirePartner>, AppError> {
    let mut stmt =
        conn.prepare("SELECT id, name, code, partner_type FROM partners ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            Ok((id, row.get::<_, String>(1)?, row.get::<_, Option<String>>(2)?, row.get::<_, i64>(3)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, name, code, partner_type)| {
            Ok(WirePartner {
                id: Uuid::parse_str(&id).map_err(|e| AppError::internal(e.to_string()))?,
                name,
                code,
                partner_type,
            })
        })
        .collect()
}

fn list_products(conn: &mut Connection) -> Result<Vec<WireProduct>, AppError> {
    let mut stmt =
        conn.prepare("SELECT id, name, short_name, sku, code FROM products ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            Ok((
                id,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, Option<String>>(4)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, name, short_name, sku, code)| {
            Ok(WireProduct {
                id: Uuid::parse_str(&id).map_err(|e| AppError::internal(e.to_string()))?,
                name,
                short_name,
                sku,
                code,
            })
        })
        .collect()
}

fn list_units(conn: &mut Connection) -> Result<Vec<WireUnit>, AppError> {
    let mut stmt = conn.prepare("SELECT id, name, abbreviation FROM units ORDER BY name ASC")?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            Ok((id, row.get::<_, String>(1)?, row.get::<_, String>(2)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(|(id, name, abbreviation)| {
            Ok(WireUnit {
                id: Uuid::parse_str(&id).map_err(|e| AppError::internal(e.to_string()))?,
                name,
                abbreviation,
            })
        })
        .collect()
}

fn list_orders(conn: &mut Connection) -> Result<Vec<WireOrder>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, partner_id, status, order_date, delivery_date, comment, created_at, updated_at
         FROM orders WHERE deleted_at IS NULL ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let partner_id: String = row.get(1)?;
            Ok((
                id,
                partner_id,
                row.get::<_, i64>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, Option<String>>(5)?,
                row.get::<_, String>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, partner_id, status, order_date, delivery_date, comment, created_at, updated_at)| {
                Ok(WireOrder {
                    id: Uuid::parse_str(&id).map_err(|e| AppError::internal(e.to_string()))?,
                    partner_id: Uuid::parse_str(&partner_id)
                        .map_err(|e| AppError::internal(e.to_string()))?,
                    status,
                    order_date,
                    delivery_date,
                    comment,
                    created_at,
                    updated_at,
                })
            },
        )
        .collect()
}

fn list_order_lines(conn: &mut Connection) -> Result<Vec<WireOrderLine>, AppError> {
    let mut stmt = conn.prepare(
        "SELECT id, order_id, product_id, unit_id, quantity, price, comment, created_at, updated_at
         FROM order_lines WHERE deleted_at IS NULL ORDER BY created_at ASC",
    )?;
    let rows = stmt
        .query_map([], |row| {
            let id: String = row.get(0)?;
            let order_id: String = row.get(1)?;
            let product_id: String = row.get(2)?;
            let unit_id: String = row.get(3)?;
            Ok((
                id,
                order_id,
                product_id,
                unit_id,
                row.get::<_, f64>(4)?,
                row.get::<_, f64>(5)?,
                row.get::<_, Option<String>>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    rows.into_iter()
        .map(
            |(id, order_id, product_id, unit_id, quantity, price, comment, created_at, updated_at)| {
                Ok(WireOrderLine {
                    id: Uuid::parse_str(&id).map_err(|e| AppError::internal(e.to_string()))?,
                    order_id: Uuid::parse_str(&order_id)
                        .map_err(|e| AppError::internal(e.to_string()))?,
                    product_id: Uuid::parse_str(&product_id)
                        .map_err(|e| AppError::internal(e.to_string()))?,
                    unit_id: Uuid::parse_str(&unit_id)
                        .map_err(|e| AppError::internal(e.to_string()))?,
                    quantity,
                    price,
                    comment,
                    created_at,
                    updated_at,
                })
            },
        )
        .collect()
}
