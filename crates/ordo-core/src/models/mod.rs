//! Domain models shared across the store, repositories and sync engines.

mod order;
mod outbox;
mod reference;

pub use order::{
    NewOrder, NewOrderLine, Order, OrderId, OrderLine, OrderLineId, OrderLinePatch, OrderPatch,
};
pub use outbox::{EntityKind, OpStatus, OpType, OutboxOperation};
pub use reference::{Partner, Product, Unit};
