use serde::{Deserialize, Serialize};

use crate::Timestamp;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    pub user_id: String,
    pub created: Timestamp,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires: Option<Timestamp>,
}

impl Token {
    pub fn is_valid_at(&self, now: Timestamp) -> bool {
        match self.expires {
            Some(expires) => now < expires,
            None => true,
        }
    }
}
