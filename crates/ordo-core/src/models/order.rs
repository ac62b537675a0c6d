//! Order and order line models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// A unique identifier for an order, using UUID v7 (time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderId(Uuid);

impl OrderId {
    /// Create a new unique order ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrderId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A unique identifier for an order line, using UUID v7
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct OrderLineId(Uuid);

impl OrderLineId {
    /// Create a new unique order line ID using UUID v7
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Get the string representation of this ID
    #[must_use]
    pub fn as_str(&self) -> String {
        self.0.to_string()
    }

    /// The underlying UUID
    #[must_use]
    pub const fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for OrderLineId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for OrderLineId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl fmt::Display for OrderLineId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for OrderLineId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s)?))
    }
}

/// A pre-order placed for a partner
///
/// `version` increases on every committed local or remote mutation;
/// `deleted_at` implements soft delete so the change log can still
/// reference the row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    /// Unique identifier
    pub id: OrderId,
    /// Partner the order belongs to
    pub partner_id: Uuid,
    /// 0 = draft, 1 = confirmed
    pub status: i64,
    /// Optional order date (YYYY-MM-DD)
    pub order_date: Option<String>,
    /// Requested delivery date (YYYY-MM-DD)
    pub delivery_date: String,
    /// Free-form comment
    pub comment: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Monotonically increasing entity version
    pub version: i64,
    /// Soft delete timestamp (Unix ms)
    pub deleted_at: Option<i64>,
}

impl Order {
    /// Writable field names accepted from sync data bags.
    pub const WRITABLE_FIELDS: &'static [&'static str] = &[
        "partner_id",
        "status",
        "order_date",
        "delivery_date",
        "comment",
    ];

    /// Apply the writable subset of a sync data bag onto this row.
    ///
    /// Unknown keys and values of the wrong shape are ignored; `version`,
    /// timestamps and `deleted_at` are the caller's concern.
    pub fn apply_fields(&mut self, data: &Map<String, Value>) {
        if let Some(value) = data.get("partner_id").and_then(Value::as_str) {
            if let Ok(uuid) = Uuid::parse_str(value) {
                self.partner_id = uuid;
            }
        }
        if let Some(value) = data.get("status").and_then(Value::as_i64) {
            self.status = value;
        }
        if let Some(value) = data.get("order_date") {
            self.order_date = value.as_str().map(str::to_string);
        }
        if let Some(value) = data.get("delivery_date").and_then(Value::as_str) {
            self.delivery_date = value.to_string();
        }
        if let Some(value) = data.get("comment") {
            self.comment = value.as_str().map(str::to_string);
        }
    }

    /// The sync data bag for a CREATE of this row (business fields only,
    /// no client-side version or timestamps).
    #[must_use]
    pub fn create_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("partner_id".into(), Value::String(self.partner_id.to_string()));
        map.insert("status".into(), Value::from(self.status));
        map.insert(
            "order_date".into(),
            self.order_date.clone().map_or(Value::Null, Value::String),
        );
        map.insert("delivery_date".into(), Value::String(self.delivery_date.clone()));
        map.insert(
            "comment".into(),
            self.comment.clone().map_or(Value::Null, Value::String),
        );
        map
    }
}

/// Fields required to create an order locally
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub partner_id: Uuid,
    pub status: i64,
    pub order_date: Option<String>,
    pub delivery_date: String,
    pub comment: Option<String>,
}

/// Partial update of an order; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct OrderPatch {
    pub partner_id: Option<Uuid>,
    pub status: Option<i64>,
    pub order_date: Option<String>,
    pub delivery_date: Option<String>,
    pub comment: Option<String>,
}

impl OrderPatch {
    /// The provided fields as a sync data bag.
    #[must_use]
    pub fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(partner_id) = self.partner_id {
            map.insert("partner_id".into(), Value::String(partner_id.to_string()));
        }
        if let Some(status) = self.status {
            map.insert("status".into(), Value::from(status));
        }
        if let Some(order_date) = &self.order_date {
            map.insert("order_date".into(), Value::String(order_date.clone()));
        }
        if let Some(delivery_date) = &self.delivery_date {
            map.insert("delivery_date".into(), Value::String(delivery_date.clone()));
        }
        if let Some(comment) = &self.comment {
            map.insert("comment".into(), Value::String(comment.clone()));
        }
        map
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

/// A product line belonging to an order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderLine {
    /// Unique identifier
    pub id: OrderLineId,
    /// Parent order
    pub order_id: OrderId,
    /// Product being ordered
    pub product_id: Uuid,
    /// Unit the quantity is expressed in
    pub unit_id: Uuid,
    /// Ordered quantity
    pub quantity: f64,
    /// Unit price
    pub price: f64,
    /// Free-form comment
    pub comment: Option<String>,
    /// Creation timestamp (Unix ms)
    pub created_at: i64,
    /// Last update timestamp (Unix ms)
    pub updated_at: i64,
    /// Monotonically increasing entity version
    pub version: i64,
    /// Soft delete timestamp (Unix ms)
    pub deleted_at: Option<i64>,
}

impl OrderLine {
    /// Writable field names accepted from sync data bags. The parent
    /// `order_id` is fixed at creation and never rewritten by sync.
    pub const WRITABLE_FIELDS: &'static [&'static str] =
        &["product_id", "unit_id", "quantity", "price", "comment"];

    /// Apply the writable subset of a sync data bag onto this row.
    pub fn apply_fields(&mut self, data: &Map<String, Value>) {
        if let Some(value) = data.get("product_id").and_then(Value::as_str) {
            if let Ok(uuid) = Uuid::parse_str(value) {
                self.product_id = uuid;
            }
        }
        if let Some(value) = data.get("unit_id").and_then(Value::as_str) {
            if let Ok(uuid) = Uuid::parse_str(value) {
                self.unit_id = uuid;
            }
        }
        if let Some(value) = data.get("quantity").and_then(Value::as_f64) {
            self.quantity = value;
        }
        if let Some(value) = data.get("price").and_then(Value::as_f64) {
            self.price = value;
        }
        if let Some(value) = data.get("comment") {
            self.comment = value.as_str().map(str::to_string);
        }
    }

    /// The sync data bag for a CREATE of this row.
    #[must_use]
    pub fn create_fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        map.insert("order_id".into(), Value::String(self.order_id.as_str()));
        map.insert("product_id".into(), Value::String(self.product_id.to_string()));
        map.insert("unit_id".into(), Value::String(self.unit_id.to_string()));
        map.insert("quantity".into(), Value::from(self.quantity));
        map.insert("price".into(), Value::from(self.price));
        map.insert(
            "comment".into(),
            self.comment.clone().map_or(Value::Null, Value::String),
        );
        map
    }
}

/// Fields required to create an order line locally
#[derive(Debug, Clone)]
pub struct NewOrderLine {
    pub order_id: OrderId,
    pub product_id: Uuid,
    pub unit_id: Uuid,
    pub quantity: f64,
    pub price: f64,
    pub comment: Option<String>,
}

/// Partial update of an order line; `None` fields are left untouched
#[derive(Debug, Clone, Default)]
pub struct OrderLinePatch {
    pub product_id: Option<Uuid>,
    pub unit_id: Option<Uuid>,
    pub quantity: Option<f64>,
    pub price: Option<f64>,
    pub comment: Option<String>,
}

impl OrderLinePatch {
    /// The provided fields as a sync data bag.
    #[must_use]
    pub fn fields(&self) -> Map<String, Value> {
        let mut map = Map::new();
        if let Some(product_id) = self.product_id {
            map.insert("product_id".into(), Value::String(product_id.to_string()));
        }
        if let Some(unit_id) = self.unit_id {
            map.insert("unit_id".into(), Value::String(unit_id.to_string()));
        }
        if let Some(quantity) = self.quantity {
            map.insert("quantity".into(), Value::from(quantity));
        }
        if let Some(price) = self.price {
            map.insert("price".into(), Value::from(price));
        }
        if let Some(comment) = &self.comment {
            map.insert("comment".into(), Value::String(comment.clone()));
        }
        map
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_order() -> Order {
        Order {
            id: OrderId::new(),
            partner_id: Uuid::now_v7(),
            status: 0,
            order_date: None,
            delivery_date: "2024-06-15".to_string(),
            comment: None,
            created_at: 1,
            updated_at: 1,
            version: 1,
            deleted_at: None,
        }
    }

    #[test]
    fn order_id_roundtrip() {
        let id = OrderId::new();
        let parsed: OrderId = id.as_str().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn order_ids_are_time_ordered() {
        let a = OrderId::new();
        let b = OrderId::new();
        assert!(a.as_str() <= b.as_str());
    }

    #[test]
    fn apply_fields_updates_writable_fields_only() {
        let mut order = sample_order();
        let original_version = order.version;
        let data = json!({
            "status": 1,
            "comment": "rush",
            "version": 99,
            "unknown_field": true,
        });

        order.apply_fields(data.as_object().unwrap());

        assert_eq!(order.status, 1);
        assert_eq!(order.comment.as_deref(), Some("rush"));
        assert_eq!(order.version, original_version);
    }

    #[test]
    fn apply_fields_clears_nullable_values() {
        let mut order = sample_order();
        order.comment = Some("old".to_string());
        order.order_date = Some("2024-06-01".to_string());

        let data = json!({ "comment": null, "order_date": null });
        order.apply_fields(data.as_object().unwrap());

        assert_eq!(order.comment, None);
        assert_eq!(order.order_date, None);
    }

    #[test]
    fn apply_fields_ignores_malformed_values() {
        let mut order = sample_order();
        let partner = order.partner_id;
        let data = json!({ "partner_id": "not-a-uuid", "delivery_date": 42 });

        order.apply_fields(data.as_object().unwrap());

        assert_eq!(order.partner_id, partner);
        assert_eq!(order.delivery_date, "2024-06-15");
    }

    #[test]
    fn create_fields_excludes_version_and_timestamps() {
        let order = sample_order();
        let fields = order.create_fields();
        assert!(!fields.contains_key("version"));
        assert!(!fields.contains_key("created_at"));
        assert!(!fields.contains_key("updated_at"));
        assert!(fields.contains_key("partner_id"));
    }

    #[test]
    fn order_patch_fields_skip_missing() {
        let patch = OrderPatch {
            status: Some(1),
            ..Default::default()
        };
        let fields = patch.fields();
        assert_eq!(fields.len(), 1);
        assert_eq!(fields.get("status"), Some(&Value::from(1)));
        assert!(!patch.is_empty());
        assert!(OrderPatch::default().is_empty());
    }

    #[test]
    fn line_apply_fields_never_moves_parent() {
        let order_id = OrderId::new();
        let mut line = OrderLine {
            id: OrderLineId::new(),
            order_id,
            product_id: Uuid::now_v7(),
            unit_id: Uuid::now_v7(),
            quantity: 1.0,
            price: 2.5,
            comment: None,
            created_at: 1,
            updated_at: 1,
            version: 1,
            deleted_at: None,
        };

        let data = json!({ "order_id": Uuid::now_v7().to_string(), "quantity": 4.0 });
        line.apply_fields(data.as_object().unwrap());

        assert_eq!(line.order_id, order_id);
        assert_eq!(line.quantity, 4.0);
    }
}
