//! Envelope for messages exchanged between peers and the coordinator.
//!
//! Wire format (JSON):
//! `{"direction":"to-peer","type":"set-external-state","data":{...},"resid":7,"from":3,"to":"followers"}`
//!
//! The loosely-typed wire form (`type` + optional `data`) is decoded exactly
//! once, in [`Envelope::decode`], into the [`Message`] sum type. Code past
//! the boundary never looks at raw JSON again.

use super::external::{ExternalRequest, ExternalState};
use crate::PeerId;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display, Formatter};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("Missing payload for {0}")]
    MissingPayload(MessageType),

    #[error("Invalid payload for {kind}: {source}")]
    InvalidPayload {
        kind: MessageType,
        source: serde_json::Error,
    },
}

/// Which side of the channel a message is meant for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Direction {
    /// Handled by the coordinator.
    ToBackground,
    /// Handled by a peer.
    ToPeer,
}

impl Direction {
    pub fn flip(self) -> Self {
        match self {
            Self::ToBackground => Self::ToPeer,
            Self::ToPeer => Self::ToBackground,
        }
    }
}

/// Delivery target for a `to-peer` message originated by a peer.
///
/// The coordinator resolves the address at delivery time, so `Leader`
/// always means the leader as of that instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Address {
    Leader,
    Followers,
    Peer(PeerId),
}

/// Closed set of message type tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MessageType {
    ConfirmRoleIsLeader,
    SetRoleLeader,
    SetRoleFollower,
    ConfirmAlive,
    PassToExternal,
    QueryExternalState,
    SetExternalState,
    SetExternalPort,
    QueryLeader,
    LeaderIs,
    RoleIsLeader,
    Alive,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ConfirmRoleIsLeader => "confirm-role-is-leader",
            Self::SetRoleLeader => "set-role-leader",
            Self::SetRoleFollower => "set-role-follower",
            Self::ConfirmAlive => "confirm-alive",
            Self::PassToExternal => "pass-to-external",
            Self::QueryExternalState => "query-external-state",
            Self::SetExternalState => "set-external-state",
            Self::SetExternalPort => "set-external-port",
            Self::QueryLeader => "query-leader",
            Self::LeaderIs => "leader-is",
            Self::RoleIsLeader => "role-is-leader",
            Self::Alive => "alive",
        }
    }
}

impl Display for MessageType {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Typed message body. The payload shape is fixed by the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    ConfirmRoleIsLeader,
    SetRoleLeader,
    SetRoleFollower,
    ConfirmAlive,
    /// `None` when the sender omitted (or mangled) the request payload.
    PassToExternal(Option<ExternalRequest>),
    QueryExternalState,
    SetExternalState(ExternalState),
    SetExternalPort(u16),
    QueryLeader,
    LeaderIs(Option<PeerId>),
    RoleIsLeader(bool),
    Alive,
}

#[derive(Serialize, Deserialize)]
struct PortPayload {
    port: u16,
}

#[derive(Serialize, Deserialize)]
struct LeaderPayload {
    leader: Option<PeerId>,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RoleIsLeaderPayload {
    is_leader: bool,
}

impl Message {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::ConfirmRoleIsLeader => MessageType::ConfirmRoleIsLeader,
            Self::SetRoleLeader => MessageType::SetRoleLeader,
            Self::SetRoleFollower => MessageType::SetRoleFollower,
            Self::ConfirmAlive => MessageType::ConfirmAlive,
            Self::PassToExternal(_) => MessageType::PassToExternal,
            Self::QueryExternalState => MessageType::QueryExternalState,
            Self::SetExternalState(_) => MessageType::SetExternalState,
            Self::SetExternalPort(_) => MessageType::SetExternalPort,
            Self::QueryLeader => MessageType::QueryLeader,
            Self::LeaderIs(_) => MessageType::LeaderIs,
            Self::RoleIsLeader(_) => MessageType::RoleIsLeader,
            Self::Alive => MessageType::Alive,
        }
    }

    fn payload(&self) -> Option<Value> {
        let value = match self {
            Self::PassToExternal(Some(request)) => serde_json::to_value(request),
            Self::SetExternalState(state) => serde_json::to_value(state),
            Self::SetExternalPort(port) => serde_json::to_value(PortPayload { port: *port }),
            Self::LeaderIs(leader) => serde_json::to_value(LeaderPayload { leader: *leader }),
            Self::RoleIsLeader(is_leader) => serde_json::to_value(RoleIsLeaderPayload {
                is_leader: *is_leader,
            }),
            _ => return None,
        };
        Some(value.expect("message payload serialization should not fail"))
    }

    fn from_parts(kind: MessageType, data: Option<Value>) -> Result<Self, ProtocolError> {
        Ok(match kind {
            MessageType::ConfirmRoleIsLeader => Self::ConfirmRoleIsLeader,
            MessageType::SetRoleLeader => Self::SetRoleLeader,
            MessageType::SetRoleFollower => Self::SetRoleFollower,
            MessageType::ConfirmAlive => Self::ConfirmAlive,
            MessageType::PassToExternal => {
                let request = data.and_then(|value| match serde_json::from_value(value) {
                    Ok(request) => Some(request),
                    Err(e) => {
                        debug!("Unusable pass-to-external payload: {}", e);
                        None
                    }
                });
                Self::PassToExternal(request)
            }
            MessageType::QueryExternalState => Self::QueryExternalState,
            MessageType::SetExternalState => Self::SetExternalState(payload(kind, data)?),
            MessageType::SetExternalPort => {
                Self::SetExternalPort(payload::<PortPayload>(kind, data)?.port)
            }
            MessageType::QueryLeader => Self::QueryLeader,
            MessageType::LeaderIs => Self::LeaderIs(payload::<LeaderPayload>(kind, data)?.leader),
            MessageType::RoleIsLeader => {
                Self::RoleIsLeader(payload::<RoleIsLeaderPayload>(kind, data)?.is_leader)
            }
            MessageType::Alive => Self::Alive,
        })
    }
}

fn payload<T: DeserializeOwned>(kind: MessageType, data: Option<Value>) -> Result<T, ProtocolError> {
    let value = data.ok_or(ProtocolError::MissingPayload(kind))?;
    serde_json::from_value(value).map_err(|source| ProtocolError::InvalidPayload { kind, source })
}

#[derive(Serialize, Deserialize)]
struct WireEnvelope {
    direction: Direction,
    #[serde(rename = "type")]
    kind: MessageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resid: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    to: Option<Address>,
}

/// A decoded message together with its routing metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub direction: Direction,
    pub message: Message,
    /// Correlation id used to pair a reply with its request.
    pub resid: Option<u64>,
    /// Original sender, stamped by the coordinator when relaying.
    pub from: Option<PeerId>,
    /// Delivery target for peer-originated `to-peer` messages.
    pub to: Option<Address>,
}

impl Envelope {
    fn new(direction: Direction, message: Message) -> Self {
        Self {
            direction,
            message,
            resid: None,
            from: None,
            to: None,
        }
    }

    /// A message to be handled by a peer.
    pub fn to_peer(message: Message) -> Self {
        Self::new(Direction::ToPeer, message)
    }

    /// A message to be handled by the coordinator.
    pub fn to_background(message: Message) -> Self {
        Self::new(Direction::ToBackground, message)
    }

    pub fn with_resid(mut self, resid: u64) -> Self {
        self.resid = Some(resid);
        self
    }

    pub fn addressed(mut self, to: Address) -> Self {
        self.to = Some(to);
        self
    }

    pub fn from_peer(mut self, from: PeerId) -> Self {
        self.from = Some(from);
        self
    }

    /// Build the reply to this envelope: opposite direction, same resid.
    pub fn reply(&self, message: Message) -> Self {
        Self {
            direction: self.direction.flip(),
            message,
            resid: self.resid,
            from: None,
            to: None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message.message_type()
    }

    /// Whether this envelope is an answer to a request (rather than a request itself).
    pub fn is_reply(&self) -> bool {
        matches!(
            self.message,
            Message::LeaderIs(_) | Message::RoleIsLeader(_) | Message::Alive
        )
    }

    /// Serialize to a JSON string.
    pub fn encode(&self) -> String {
        let wire = WireEnvelope {
            direction: self.direction,
            kind: self.message_type(),
            data: self.message.payload(),
            resid: self.resid,
            from: self.from,
            to: self.to,
        };
        serde_json::to_string(&wire).expect("Envelope serialization should not fail")
    }

    /// Decode from JSON bytes.
    ///
    /// Unknown `type` tags and payloads that do not match their tag are
    /// rejected here, so handlers only ever see well-formed messages.
    pub fn decode(data: &[u8]) -> Result<Self, ProtocolError> {
        let wire: WireEnvelope = serde_json::from_slice(data)?;
        let message = Message::from_parts(wire.kind, wire.data)?;
        Ok(Self {
            direction: wire.direction,
            message,
            resid: wire.resid,
            from: wire.from,
            to: wire.to,
        })
    }
}
