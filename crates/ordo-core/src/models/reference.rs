//! Read-only reference collections replicated by snapshot

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A partner (customer or supplier) orders are placed for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Partner {
    pub id: Uuid,
    pub name: String,
    pub code: Option<String>,
    /// 1 = client, 2 = supplier
    pub partner_type: i64,
}

/// A product that can appear on an order line
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Product {
    pub id: Uuid,
    pub name: String,
    pub short_name: Option<String>,
    pub sku: Option<String>,
    pub code: Option<String>,
}

/// A measurement unit for order line quantities
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Unit {
    pub id: Uuid,
    pub name: String,
    pub abbreviation: String,
}
