//! Data models shared by the relay, negotiation and data-channel layers
//!
//! This module contains the wire messages exchanged with the relay, the
//! identity of this client, the negotiation state and the data-channel
//! statistics.

pub mod identity;
pub mod message;
pub mod session;
pub mod stats;

pub use identity::ClientIdentity;
pub use message::{IceCandidate, SdpKind, SessionDescription, SignalingMessage};
pub use session::{Phase, SessionState};
pub use stats::ChannelStats;
