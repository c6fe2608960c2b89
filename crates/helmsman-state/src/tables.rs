//! redb table definitions for the Helmsman record store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized types).

use redb::TableDefinition;

/// Rollout records keyed by `{env}/{workload}/{id}`.
pub const ROLLOUTS: TableDefinition<&str, &[u8]> = TableDefinition::new("rollouts");

/// Supervision leases keyed by `{env}/{workload}`.
pub const LOCKS: TableDefinition<&str, &[u8]> = TableDefinition::new("locks");
