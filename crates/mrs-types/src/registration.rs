use serde::{Deserialize, Serialize};

use crate::{BoundingBox, Geometry, Timestamp};

/// The canonical identity of a record: `(origin_server, origin_id)`, not
/// the locally-assigned `id`. Two records sharing this pair are copies of
/// the same canonical record.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CanonicalId {
    pub origin_server: String,
    pub origin_id: String,
}

impl CanonicalId {
    pub fn new(origin_server: impl Into<String>, origin_id: impl Into<String>) -> Self {
        Self {
            origin_server: origin_server.into(),
            origin_id: origin_id.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Registration {
    pub id: String,
    pub space: Geometry,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_point: Option<String>,
    pub foad: bool,
    pub owner: String,
    pub origin_server: String,
    pub origin_id: String,
    pub version: u64,
    pub created: Timestamp,
    pub updated: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replicated_from: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<Timestamp>,
    pub bbox: BoundingBox,
}

impl Registration {
    pub fn canonical_id(&self) -> CanonicalId {
        CanonicalId::new(self.origin_server.clone(), self.origin_id.clone())
    }

    pub fn is_origin_of(&self, server_url: &str) -> bool {
        self.origin_server == server_url
    }
}

/// The `reg_` + random-suffix local id format (see §3 of the data model).
pub const REGISTRATION_ID_PREFIX: &str = "reg_";

pub fn generate_registration_id() -> String {
    use rand::Rng;
    const ALPHABET: &[u8] =
        b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";
    let mut rng = rand::thread_rng();
    let suffix: String = (0..16)
        .map(|_| {
            let idx = rng.gen_range(0..ALPHABET.len());
            ALPHABET[idx] as char
        })
        .collect();
    format!("{REGISTRATION_ID_PREFIX}{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_carry_the_prefix_and_minimum_length() {
        let id = generate_registration_id();
        assert!(id.starts_with(REGISTRATION_ID_PREFIX));
        assert!(id.len() >= REGISTRATION_ID_PREFIX.len() + 12);
    }
}
