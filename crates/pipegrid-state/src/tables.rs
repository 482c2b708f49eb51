//! redb table definitions for the pipegrid state store.
//!
//! Each table uses `&str` keys and `&[u8]` values (JSON-serialized domain types).
//! Composite keys follow the pattern `{parent_id}:{child_id}` or `{trigger_id}@{tick}`.

use redb::TableDefinition;

/// Shape shared by every table.
pub type JsonTable = TableDefinition<'static, &'static str, &'static [u8]>;

/// Triggers keyed by `{trigger_id}`.
pub const TRIGGERS: JsonTable = TableDefinition::new("triggers");

/// Pipeline definitions keyed by `{pipeline_id}`.
pub const PIPELINES: JsonTable = TableDefinition::new("pipelines");

/// Pipeline runs keyed by `{run_id}`.
pub const RUNS: JsonTable = TableDefinition::new("runs");

/// Block runs keyed by `{run_id}:{block_id}`.
pub const BLOCK_RUNS: JsonTable = TableDefinition::new("block_runs");

/// Non-terminal runs keyed by `{run_id}`, value is the owning trigger id (JSON).
pub const ACTIVE_RUNS: JsonTable = TableDefinition::new("active_runs");

/// Tick outcomes keyed by `{trigger_id}@{tick}`.
pub const TICKS: JsonTable = TableDefinition::new("ticks");

/// Coordination leases keyed by lease name (`tick:{trigger_id}@{tick}` for tick claims).
pub const LEASES: JsonTable = TableDefinition::new("leases");
