//! Query-cache invalidation contract
//!
//! The sync core treats the UI's query cache as a write-only sink: after a
//! push or pull touches entities, the affected keys are invalidated in one
//! call and the cache is never read back.

use std::collections::HashSet;

use async_trait::async_trait;
use uuid::Uuid;

use crate::db::LocalStore;
use crate::error::Result;
use crate::models::OrderId;

/// Cache keys the UI queries are registered under
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum QueryKey {
    /// `["recap", delivery_date]`
    Recap(String),
    Partners,
    Products,
    Units,
    /// Everything; used after the initial snapshot
    All,
}

/// Write-only sink for cache invalidation
#[async_trait]
pub trait QueryInvalidator: Send + Sync {
    async fn invalidate(&self, keys: &[QueryKey]);
}

/// Invalidator for headless use (CLI tools, tests that don't care)
#[derive(Debug, Default)]
pub struct NoopInvalidator;

#[async_trait]
impl QueryInvalidator for NoopInvalidator {
    async fn invalidate(&self, _keys: &[QueryKey]) {}
}

/// Records every invalidation call; test double
#[derive(Debug, Default)]
pub struct RecordingInvalidator {
    calls: std::sync::Mutex<Vec<Vec<QueryKey>>>,
}

impl RecordingInvalidator {
    /// All calls made so far, in order.
    pub fn calls(&self) -> Vec<Vec<QueryKey>> {
        self.calls.lock().expect("invalidator lock").clone()
    }
}

#[async_trait]
impl QueryInvalidator for RecordingInvalidator {
    async fn invalidate(&self, keys: &[QueryKey]) {
        self.calls
            .lock()
            .expect("invalidator lock")
            .push(keys.to_vec());
    }
}

/// Resolve a set of affected orders to the recap keys to invalidate.
///
/// Falls back to [`QueryKey::All`] when an order cannot be resolved
/// locally, since its delivery date (and therefore its recap key) is
/// unknown.
pub(crate) async fn recap_keys(
    store: &LocalStore,
    affected_orders: &HashSet<Uuid>,
) -> Result<Vec<QueryKey>> {
    let mut keys: Vec<QueryKey> = Vec::new();
    let mut seen_dates: HashSet<String> = HashSet::new();

    for order_id in affected_orders {
        match store.get_order_any(&OrderId::from(*order_id)).await? {
            Some(order) => {
                if seen_dates.insert(order.delivery_date.clone()) {
                    keys.push(QueryKey::Recap(order.delivery_date));
                }
            }
            None => return Ok(vec![QueryKey::All]),
        }
    }

    Ok(keys)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_invalidator_keeps_call_order() {
        let invalidator = RecordingInvalidator::default();
        invalidator.invalidate(&[QueryKey::All]).await;
        invalidator
            .invalidate(&[QueryKey::Recap("2024-06-15".into()), QueryKey::Partners])
            .await;

        let calls = invalidator.calls();
        assert_eq!(calls.len(), 2);
        assert_eq!(calls[0], vec![QueryKey::All]);
        assert_eq!(calls[1].len(), 2);
    }
}
