//! Channel-level building blocks for the bitcoin peer-to-peer network.
//!
//! This crate provides the single-connection machinery that a session layer
//! composes into a full node front end: canonical peer endpoints
//! ([`Authority`]), the v1 message framing ([`TransportReader`] /
//! [`TransportWriter`]), write-serialized sockets ([`LockedSocket`]),
//! per-command message fan-out ([`MessageSubscriber`]), live peer channels
//! ([`Channel`]), and the [`Acceptor`] / [`Connector`] factories that produce
//! channels from listen and connect primitives.
//!
//! Message serialization is delegated to [`bitcoin`]'s consensus codec; this
//! crate deals in typed [`NetworkMessage`](bitcoin::p2p::message::NetworkMessage)
//! values keyed by their wire command.
//!
//! # Examples
//!
//! Parsing and formatting peer endpoints.
//!
//! ```
//! use bitcoin_network_channel::Authority;
//!
//! let peer: Authority = "1.2.3.4:8333".parse()?;
//! assert_eq!(peer.port(), 8333);
//! assert_eq!(peer.to_string(), "1.2.3.4:8333");
//! # Ok::<(), bitcoin_network_channel::Error>(())
//! ```

mod acceptor;
mod authority;
mod channel;
mod connector;
mod error;
mod socket;
mod stop;
mod subscriber;
mod transport;

pub use acceptor::Acceptor;
pub use authority::Authority;
pub use channel::{
    generate_nonce, Channel, ChannelOptions, PeerDetails, PeerServices, PeerVersion,
};
pub use connector::Connector;
pub use error::Error;
pub use socket::{LockedSocket, Socket};
pub use stop::{StopSignal, StopToken};
pub use subscriber::{MessageHandler, MessageSubscriber};
pub use transport::{TransportReader, TransportWriter, MAX_PAYLOAD_SIZE};
