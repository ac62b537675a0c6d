//! Local store for the sync core
//!
//! A durable SQLite database holding the entity tables, the outbox of
//! pending mutations and the sync metadata, wrapped in an async handle.

mod connection;
mod migrations;
pub(crate) mod store;

pub use connection::Database;
pub use store::{LocalStore, MAX_RETRIES};
