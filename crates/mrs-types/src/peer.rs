use serde::{Deserialize, Serialize};

use crate::{Geometry, Timestamp};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Peer {
    pub server_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub last_seen: Timestamp,
    pub is_configured: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub authoritative_regions: Option<Vec<Geometry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sync_cursor: Option<String>,
}

impl Peer {
    pub fn configured(server_url: impl Into<String>, now: Timestamp) -> Self {
        Self {
            server_url: server_url.into(),
            hint: None,
            last_seen: now,
            is_configured: true,
            authoritative_regions: None,
            sync_cursor: None,
        }
    }

    pub fn learned(server_url: impl Into<String>, now: Timestamp) -> Self {
        Self {
            server_url: server_url.into(),
            hint: None,
            last_seen: now,
            is_configured: false,
            authoritative_regions: None,
            sync_cursor: None,
        }
    }
}
