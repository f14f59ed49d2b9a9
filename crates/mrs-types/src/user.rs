use serde::{Deserialize, Serialize};

use crate::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password_hash: Option<String>,
    pub is_local: bool,
    pub created: Timestamp,
}

impl User {
    /// A "shell" user pinned by the first signature verification for a
    /// remote identity that was never registered locally.
    pub fn shell(identity: impl Into<String>, now: Timestamp) -> Self {
        Self {
            id: identity.into(),
            password_hash: None,
            is_local: false,
            created: now,
        }
    }
}
