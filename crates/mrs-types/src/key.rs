use serde::{Deserialize, Serialize};

use crate::Timestamp;

/// Signature algorithms a [Key] may carry. Ed25519 is the required
/// baseline; the others are optional capabilities a server may decline to
/// verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyAlgorithm {
    Ed25519,
    RsaPss,
    EcdsaP256,
    EcdsaP384,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Key {
    pub id: String,
    /// An identity string, or the reserved `_server` owner.
    pub owner: String,
    pub key_id: String,
    pub algorithm: KeyAlgorithm,
    pub public_key: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<Vec<u8>>,
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<Timestamp>,
    pub deprecated: bool,
}

impl Key {
    pub fn is_usable_at(&self, now: Timestamp) -> bool {
        if self.deprecated {
            return false;
        }
        match self.expires {
            Some(expires) => now < expires,
            None => true,
        }
    }
}
