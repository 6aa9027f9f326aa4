//! Frames a session host sends to viewers.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFrame {
    /// Absolute row index.
    pub row: u64,
    pub seq: u64,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransportFrame {
    Heartbeat {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
        #[serde(alias = "timestampMs")]
        timestamp_ms: i64,
    },
    Row(RowFrame),
    Rows {
        rows: Vec<RowFrame>,
    },
    Shutdown,
}

pub fn decode(bytes: &[u8]) -> Result<TransportFrame, serde_json::Error> {
    serde_json::from_slice(bytes)
}

pub fn encode(frame: &TransportFrame) -> String {
    // Serializing these types cannot fail: every key is a string.
    serde_json::to_string(frame).unwrap_or_default()
}
