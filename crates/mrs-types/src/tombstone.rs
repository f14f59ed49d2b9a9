use serde::{Deserialize, Serialize};

use crate::{CanonicalId, Timestamp};

/// A delete marker that prevents a released record from being resurrected
/// by a replaying peer. Retained for at least the configured retention
/// window (default 30 days).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tombstone {
    pub origin_server: String,
    pub origin_id: String,
    pub version: u64,
    pub deleted_at: Timestamp,
}

impl Tombstone {
    pub fn canonical_id(&self) -> CanonicalId {
        CanonicalId::new(self.origin_server.clone(), self.origin_id.clone())
    }

    /// Per I7: a tombstone `(o, i, v)` shadows any replica with
    /// `version <= v`.
    pub fn shadows(&self, candidate_version: u64) -> bool {
        candidate_version <= self.version
    }
}
