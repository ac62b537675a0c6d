//! Read queries over the replicated reference collections

use crate::db::LocalStore;
use crate::error::Result;
use crate::models::{Partner, Product, Unit};

/// Read-only access to partners, products and units.
///
/// Reference rows are written exclusively by the pull engine (snapshot or
/// server-originated log entries), never by the UI.
#[derive(Clone)]
pub struct ReferenceRepository {
    store: LocalStore,
}

impl ReferenceRepository {
    pub fn new(store: LocalStore) -> Self {
        Self { store }
    }

    pub async fn partners(&self) -> Result<Vec<Partner>> {
        self.store.list_partners().await
    }

    pub async fn products(&self) -> Result<Vec<Product>> {
        self.store.list_products().await
    }

    pub async fn units(&self) -> Result<Vec<Unit>> {
        self.store.list_units().await
    }
}
