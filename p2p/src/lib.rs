//! Session management and protocol state machines for the bitcoin
//! peer-to-peer network.
//!
//! This crate drives the connection lifecycle of a bitcoin node front end on
//! top of [`bitcoin_network_channel`]: the [`P2p`] orchestrator seeds the
//! known-hosts pool, maintains outbound connection slots, accepts inbound
//! connections, supervises manual endpoints, and attaches the standard
//! protocol set (version handshake, ping heartbeat, address gossip) to every
//! channel it produces.
//!
//! # Examples
//!
//! ```no_run
//! use bitcoin_network_p2p::{P2p, Settings};
//!
//! # async fn example() -> Result<(), bitcoin_network_p2p::Error> {
//! let mut settings = Settings::default();
//! settings.peers = vec!["203.0.113.7:8333".parse()?];
//!
//! let network = P2p::new(settings);
//! network.start().await?;
//! // ... run until shutdown ...
//! network.stop().await;
//! # Ok(())
//! # }
//! ```

mod collections;
mod hosts;
mod p2p;
mod protocols;
mod sessions;
mod settings;
mod user_agent;

pub use bitcoin_network_channel::{Authority, Channel, Error};
pub use collections::{Connections, PendingChannels, PendingSockets};
pub use hosts::Hosts;
pub use p2p::P2p;
pub use protocols::{
    AddressProtocol, PingProtocol, VersionProtocol, BIP31_VERSION, BIP61_VERSION,
    PROTOCOL_VERSION_CEILING, PROTOCOL_VERSION_FLOOR,
};
pub use settings::Settings;
pub use user_agent::{default_user_agent, validate_user_agent};
