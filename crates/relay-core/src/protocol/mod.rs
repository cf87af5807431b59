//! Wire protocol for the relay.
//!
//! - Welcome handshake sent by the host when a peer channel opens
//! - Envelopes exchanged between peers and the coordinator
//! - Request/response types for the external server connection

pub mod envelope;
pub mod external;
pub mod handshake;

pub use envelope::{Address, Direction, Envelope, Message, MessageType, ProtocolError};
pub use external::{
    ConnectionStatus, ExternalCommand, ExternalRequest, ExternalResponse, ExternalState,
    ResponseKind,
};
pub use handshake::{Welcome, MAX_MESSAGE_SIZE, PROTOCOL_VERSION};
