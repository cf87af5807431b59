//! relay-daemon library: native WebSocket plumbing for relay-core.
//!
//! Exposes the daemon components so integration tests can drive a real
//! coordinator and real peers over loopback sockets.

pub mod client;
pub mod connection;
pub mod external;
pub mod persistence;
pub mod server;

// Re-export key types for convenience
pub use client::{CoordinatorClient, Session};
pub use connection::{ConnectionEvent, PeerConnection};
pub use external::{calculate_backoff, ReconnectConfig, ReconnectState, WebSocketLink};
pub use persistence::{JsonFileStore, STATE_FILE};
pub use server::WebSocketHost;
