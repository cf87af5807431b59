//! relay-core: tab coordination and message relay.
//!
//! Many short-lived peers share one connection to an external server. This
//! crate provides:
//! - The coordinator: membership registry, liveness probing and leader election
//! - The peer node: message routing and the leader's relay gateway
//! - Wire protocol types shared by both sides
//! - HostChannel, ExternalLink and KeyValueStore trait abstractions

pub mod arbiter;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod events;
pub mod gateway;
pub mod hub;
pub mod ledger;
pub mod peer_id;
pub mod prober;
pub mod protocol;
pub mod registry;
pub mod router;
pub mod store;

pub use arbiter::{Role, RoleArbiter};
pub use channel::{ChannelError, ChannelEvent, HostChannel, PeerOutbox, PendingReplies};
pub use config::RelayConfig;
pub use coordinator::{Coordinator, CoordinatorError, CoordinatorHandle, CoordinatorSettings};
pub use events::{EventBus, RelayEvent, Subscription};
pub use gateway::{ExternalEvent, ExternalLink, LinkError, RelayGateway};
pub use hub::Hub;
pub use peer_id::{PeerId, PeerIdError};
pub use prober::{Liveness, LivenessProber};
pub use protocol::{Address, ConnectionStatus, Direction, Envelope, Message};
pub use registry::MembershipRegistry;
pub use router::{PeerHandle, PeerNode, PeerSettings, PeerState};
pub use store::{KeyValueStore, MemoryStore, StoreError};
