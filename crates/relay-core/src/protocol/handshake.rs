//! Versioned welcome handshake.
//!
//! The host sends a welcome immediately after a peer's channel opens. It
//! tells the peer which id the host assigned to it; every later frame is an
//! [`Envelope`](super::Envelope).

use crate::PeerId;
use serde::{Deserialize, Serialize};

/// Current protocol version.
///
/// Increment when making breaking changes to the protocol.
pub const PROTOCOL_VERSION: u32 = 1;

/// Maximum frame size accepted from either side (1MB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// First frame sent by the host on a fresh peer channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Welcome {
    /// Message type discriminator
    #[serde(rename = "type")]
    pub msg_type: String,
    /// Protocol version
    pub version: u32,
    /// Identifier the host assigned to this peer
    pub peer_id: PeerId,
}

impl Welcome {
    pub fn new(peer_id: PeerId) -> Self {
        Self {
            msg_type: "welcome".to_string(),
            version: PROTOCOL_VERSION,
            peer_id,
        }
    }

    /// Serialize to a JSON string.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("Welcome serialization should not fail")
    }

    /// Try to parse from JSON bytes.
    ///
    /// Returns `None` for non-JSON input or if the `type` field isn't `"welcome"`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        let welcome: Self = serde_json::from_slice(data).ok()?;
        if welcome.msg_type == "welcome" {
            Some(welcome)
        } else {
            None
        }
    }

    /// Check if we should log a version mismatch warning.
    pub fn should_warn_version(&self) -> bool {
        self.version != PROTOCOL_VERSION
    }
}
