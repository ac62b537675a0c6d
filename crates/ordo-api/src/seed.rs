//! Demo reference data
//!
//! Inserted once, on an empty database, when `ORDO_SEED_DEMO` is set.
//! Orders are never seeded; they only ever come from clients.

use rusqlite::params;
use uuid::Uuid;

use crate::db::ServerStore;
use crate::error::AppError;

/// Seed partners, products and units if the partners table is empty.
/// Returns the number of rows inserted.
pub async fn seed_demo_data(store: &ServerStore) -> Result<usize, AppError> {
    store
        .with_conn(|conn| {
            let existing: i64 =
                conn.query_row("SELECT COUNT(*) FROM partners", [], |row| row.get(0))?;
            if existing > 0 {
                return Ok(0);
            }

            let tx = conn.transaction()?;
            let mut inserted = 0;

            let partners = [
                ("Green Grocer", Some("GG"), 1),
                ("Harbor Bistro", Some("HB"), 1),
                ("Hilltop Market", None, 1),
                ("Mill & Flour Co.", Some("MF"), 2),
            ];
            for (name, code, partner_type) in partners {
                tx.execute(
                    "INSERT INTO partners (id, name, code, partner_type) VALUES (?, ?, ?, ?)",
                    params![Uuid::now_v7().to_string(), name, code, partner_type],
                )?;
                inserted += 1;
            }

            let products = [
                ("Sourdough Loaf", Some("Sour"), Some("BRD-001")),
                ("Baguette", None, Some("BRD-002")),
                ("Rye Bread", Some("Rye"), Some("BRD-003")),
                ("Butter Croissant", Some("Crois"), Some("PAS-001")),
            ];
            for (name, short_name, sku) in products {
                tx.execute(
                    "INSERT INTO products (id, name, short_name, sku, code) VALUES (?, ?, ?, ?, NULL)",
                    params![Uuid::now_v7().to_string(), name, short_name, sku],
                )?;
                inserted += 1;
            }

            let units = [("Piece", "pc"), ("Kilogram", "kg"), ("Box", "bx")];
            for (name, abbreviation) in units {
                tx.execute(
                    "INSERT INTO units (id, name, abbreviation) VALUES (?, ?, ?)",
                    params![Uuid::now_v7().to_string(), name, abbreviation],
                )?;
                inserted += 1;
            }

            tx.commit()?;
            Ok(inserted)
        })
        .await
}
