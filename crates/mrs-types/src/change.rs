use serde::{Deserialize, Serialize};

use crate::{Registration, Tombstone};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Updated,
    Deleted,
}

/// One entry in the monotonic change log consumed by `/sync/changes`.
/// `registration` is present for `created`/`updated`; `tombstone` is
/// present for `deleted`. `cursor` is the opaque, strictly increasing
/// position of this event -- callers resume a delta pull from it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub registration: Option<Registration>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tombstone: Option<Tombstone>,
    pub cursor: String,
}

impl ChangeEvent {
    pub fn created(registration: Registration, cursor: String) -> Self {
        Self {
            kind: ChangeKind::Created,
            registration: Some(registration),
            tombstone: None,
            cursor,
        }
    }

    pub fn updated(registration: Registration, cursor: String) -> Self {
        Self {
            kind: ChangeKind::Updated,
            registration: Some(registration),
            tombstone: None,
            cursor,
        }
    }

    pub fn deleted(tombstone: Tombstone, cursor: String) -> Self {
        Self {
            kind: ChangeKind::Deleted,
            registration: None,
            tombstone: Some(tombstone),
            cursor,
        }
    }
}
