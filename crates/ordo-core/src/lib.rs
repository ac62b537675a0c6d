//! ordo-core - Offline-first sync core for the Ordo pre-order client
//!
//! The UI reads and writes orders against the embedded local store through
//! the repositories while the sync engine reconciles with the server in
//! the background: the push engine drains the outbox, the pull engine
//! ingests the server change log (rebasing local pending work on top), and
//! the orchestrator serializes the two and publishes status.

pub mod db;
pub mod error;
pub mod models;
pub mod protocol;
pub mod repo;
pub mod sync;
pub mod util;

pub use db::LocalStore;
pub use error::{Error, Result};
pub use models::{
    EntityKind, NewOrder, NewOrderLine, OpStatus, OpType, Order, OrderId, OrderLine, OrderLineId,
    OrderLinePatch, OrderPatch, OutboxOperation, Partner, Product, Unit,
};
pub use repo::{OrderLineRepository, OrderRepository, ReferenceRepository};
pub use sync::{
    Connection, HttpTransport, QueryInvalidator, QueryKey, SyncConfig, SyncOrchestrator,
    SyncState, SyncStatus, SyncTransport,
};
