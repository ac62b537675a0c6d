//! Field-level conflict resolution
//!
//! A version mismatch never rejects an update outright. The patch is
//! merged field by field: values the server still holds unchanged are
//! accepted, values the server itself rewrote since the client's expected
//! version stay with the server. Only the latter are reported as
//! conflicts.

use std::collections::HashSet;

use serde_json::{Map, Value};

use ordo_core::protocol::{ConflictWinner, FieldConflict};

/// Result of merging one client patch against the server row
#[derive(Debug, Default)]
pub struct Resolution {
    /// Fields to persist on the server row
    pub fields_to_apply: Map<String, Value>,
    pub had_version_mismatch: bool,
    /// Contested fields, all resolved for the server
    pub conflicts: Vec<FieldConflict>,
}

impl Resolution {
    pub fn has_conflicts(&self) -> bool {
        !self.conflicts.is_empty()
    }
}

/// Entity-agnostic resolver.
///
/// `server_changed_fields` is the set of fields the operation log shows
/// modified after `expected_version`; it decides which side a contested
/// field belongs to.
#[derive(Debug, Default)]
pub struct ConflictResolver;

impl ConflictResolver {
    pub fn resolve_update(
        &self,
        server_state: &Map<String, Value>,
        client_data: &Map<String, Value>,
        expected_version: Option<i64>,
        server_version: i64,
        server_changed_fields: &HashSet<String>,
    ) -> Resolution {
        // No version check requested, or versions agree: apply everything.
        if expected_version.is_none() || expected_version == Some(server_version) {
            return Resolution {
                fields_to_apply: client_data.clone(),
                had_version_mismatch: false,
                conflicts: Vec::new(),
            };
        }

        let mut resolution = Resolution {
            had_version_mismatch: true,
            ..Default::default()
        };

        for (field, client_value) in client_data {
            let server_value = server_state.get(field).cloned().unwrap_or(Value::Null);

            if values_equal(client_value, &server_value) {
                // The client wants what the server already has.
                continue;
            }

            if server_changed_fields.contains(field) {
                // Both sides touched this field; the accepted server write
                // wins and the client is told so.
                resolution.conflicts.push(FieldConflict {
                    field: field.clone(),
                    client_value: client_value.clone(),
                    server_value,
                    winner: ConflictWinner::Server,
                });
            } else {
                // Disjoint edit: merge it in.
                resolution.fields_to_apply.insert(field.clone(), client_value.clone());
            }
        }

        resolution
    }
}

/// Loose equality: numbers compare numerically, everything else by
/// stringified value (so a UUID string equals itself regardless of case
/// conventions upstream).
fn values_equal(a: &Value, b: &Value) -> bool {
    if a == b {
        return true;
    }
    if let (Some(a), Some(b)) = (a.as_f64(), b.as_f64()) {
        return a == b;
    }
    flat_string(a) == flat_string(b)
}

fn flat_string(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
