//! Framing for the chat relay carried by the demo binaries.
//!
//! Clients send plain UTF-8 text; the server relays each line to the other
//! clients wrapped in a [`ChatLine`] so recipients know who wrote it.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatLine {
    pub from: u32,
    pub text: String,
}

impl ChatLine {
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
