//! PeerId: Host-assigned identifier for one peer (tab) in the relay.
//!
//! The host hands out opaque numeric ids. They serialize as plain JSON
//! numbers so that persisted registries stay readable.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};
use std::str::FromStr;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PeerIdError {
    #[error("Invalid peer ID: {0}")]
    InvalidFormat(#[from] std::num::ParseIntError),
}

/// Identifier of a connected peer, as assigned by the host.
///
/// Ids are never reused within one host lifetime: a peer that reconnects is
/// a brand-new peer with a new id.
///
/// # Examples
/// ```
/// use relay_core::PeerId;
///
/// let peer_id: PeerId = "42".parse().unwrap();
/// assert_eq!(peer_id.as_u64(), 42);
/// assert_eq!(peer_id.to_string(), "42");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(u64);

impl PeerId {
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the underlying numeric value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Display for PeerId {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = PeerIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.trim().parse()?))
    }
}

impl From<u64> for PeerId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<PeerId> for u64 {
    fn from(peer_id: PeerId) -> u64 {
        peer_id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_decimal() {
        assert_eq!(PeerId(1234).to_string(), "1234");
    }

    #[test]
    fn test_parse_trims_whitespace() {
        let peer_id: PeerId = " 17 ".parse().unwrap();
        assert_eq!(peer_id, PeerId(17));
    }

    #[test]
    fn test_invalid_format() {
        assert!("".parse::<PeerId>().is_err());
        assert!("tab-7".parse::<PeerId>().is_err());
        assert!("-3".parse::<PeerId>().is_err());
    }

    #[test]
    fn test_serializes_as_number() {
        let json = serde_json::to_string(&vec![PeerId(1), PeerId(2)]).unwrap();
        assert_eq!(json, "[1,2]");

        let parsed: Vec<PeerId> = serde_json::from_str("[3,4]").unwrap();
        assert_eq!(parsed, vec![PeerId(3), PeerId(4)]);
    }
}
