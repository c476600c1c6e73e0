use serde::{
    Deserialize,
    Serialize,
};

/// Snapshot row kind. `target` has at most one row in `state_snapshot`.
pub const SNAPSHOT_TYPE_TARGET: &str = "target";

/// Persisted record of a device state, stored as canonical JSON together
/// with its SHA-256 content hash.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StateSnapshot {
    pub snapshot_type: String,
    pub state: String,
    pub state_hash: String,
    pub created_at: Option<String>,
}
