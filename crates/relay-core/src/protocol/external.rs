//! Wire types for the single connection to the external (editor) server.
//!
//! Outbound requests are `{"command":...,"data":...,"resid":...}`; inbound
//! messages are `{"type":"ITEM"|"TAGS","data":...,"resid":...}`.

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Live state of the external connection.
///
/// Serialized as the numeric WebSocket `readyState`, with `-1` for a
/// connection that was never created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionStatus {
    Connecting,
    Open,
    Closing,
    Closed,
    #[default]
    Uninstantiated,
}

impl ConnectionStatus {
    pub fn ready_state(self) -> i8 {
        match self {
            Self::Connecting => 0,
            Self::Open => 1,
            Self::Closing => 2,
            Self::Closed => 3,
            Self::Uninstantiated => -1,
        }
    }

    pub fn from_ready_state(value: i8) -> Option<Self> {
        match value {
            0 => Some(Self::Connecting),
            1 => Some(Self::Open),
            2 => Some(Self::Closing),
            3 => Some(Self::Closed),
            -1 => Some(Self::Uninstantiated),
            _ => None,
        }
    }

    pub fn is_open(self) -> bool {
        self == Self::Open
    }
}

impl Serialize for ConnectionStatus {
    fn serialize<S: Serializer>(&self, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_i8(self.ready_state())
    }
}

impl<'de> Deserialize<'de> for ConnectionStatus {
    fn deserialize<D: Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
        let value = i8::deserialize(d)?;
        Self::from_ready_state(value)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown readyState {value}")))
    }
}

/// Commands the external server understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ExternalCommand {
    UpdateMatchQuery,
    GetItem,
}

/// A request bound for the external server.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalRequest {
    pub command: ExternalCommand,
    pub data: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resid: Option<u64>,
}

impl ExternalRequest {
    pub fn update_match_query(query: impl Into<String>) -> Self {
        Self {
            command: ExternalCommand::UpdateMatchQuery,
            data: query.into(),
            resid: None,
        }
    }

    pub fn get_item(query: impl Into<String>) -> Self {
        Self {
            command: ExternalCommand::GetItem,
            data: query.into(),
            resid: None,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("ExternalRequest serialization should not fail")
    }
}

/// Kinds of message the external server pushes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ResponseKind {
    Item,
    Tags,
}

/// A message received from the external server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExternalResponse {
    #[serde(rename = "type")]
    pub kind: ResponseKind,
    #[serde(default)]
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resid: Option<u64>,
}

impl ExternalResponse {
    /// Try to parse from the text of a WebSocket frame.
    ///
    /// Returns `None` for non-JSON input or an unknown `type`.
    pub fn from_json(data: &[u8]) -> Option<Self> {
        serde_json::from_slice(data).ok()
    }
}

/// Snapshot of the Leader's external connection, mirrored by Followers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExternalState {
    pub status: ConnectionStatus,
    #[serde(default)]
    pub pending: Vec<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_message: Option<ExternalResponse>,
}
