//! Network configuration.

use crate::protocols::{PROTOCOL_VERSION_CEILING, PROTOCOL_VERSION_FLOOR};
use crate::user_agent::{default_user_agent, validate_user_agent};
use bitcoin::p2p::{Magic, ServiceFlags};
use bitcoin_network_channel::{Authority, ChannelOptions, Error};
use log::error;
use std::net::{Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Configuration consumed by [`P2p`](crate::P2p) and threaded through every
/// session and protocol.
///
/// Construction of this struct from a command line or configuration file is
/// the embedding application's concern; [`Settings::default`] carries the
/// mainnet defaults.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Worker threads the embedding runtime should provision. The library
    /// never builds a runtime of its own.
    pub threads: u32,
    /// Wire magic, little-endian.
    pub identifier: u32,
    /// Port the inbound session listens on.
    pub inbound_port: u16,
    /// Maximum concurrently accepted inbound connections; zero disables the
    /// inbound session.
    pub inbound_connections: u32,
    /// Outbound connection slots to keep filled; zero disables the outbound
    /// session.
    pub outbound_connections: u32,
    /// Reconnect attempts per manual endpoint before giving up; zero retries
    /// forever.
    pub manual_attempt_limit: u32,
    /// Simultaneous connect candidates raced per outbound slot.
    pub connect_batch_size: u32,
    /// Deadline for a single connect attempt, and the pause before a manual
    /// endpoint reconnects.
    pub connect_timeout: Duration,
    /// Deadline for the version handshake.
    pub channel_handshake: Duration,
    /// How long the seed session collects addresses before stopping its
    /// channels.
    pub channel_germination: Duration,
    /// Heartbeat period of the ping protocol.
    pub channel_heartbeat: Duration,
    /// Stop a channel when no frame arrives for this long.
    pub channel_inactivity: Duration,
    /// Stop a channel that sees no traffic past this deadline.
    pub channel_expiration: Duration,
    /// Pause between outbound candidate draws when the pool has nothing
    /// eligible.
    pub channel_poll: Duration,
    /// Bound on the known-hosts pool; zero disables address gossip and
    /// seeding.
    pub host_pool_capacity: usize,
    /// Where the known-hosts pool persists between runs.
    pub hosts_file: PathBuf,
    /// Lowest protocol version this node accepts.
    pub protocol_minimum: u32,
    /// Highest protocol version this node advertises.
    pub protocol_maximum: u32,
    /// Services this node advertises, and the minimum required of peers.
    pub services: ServiceFlags,
    /// Whether peers should relay transactions to this node.
    pub relay: bool,
    /// User agent advertised in the version message; empty selects the
    /// built-in default.
    pub user_agent: String,
    /// The address this node advertises to peers.
    pub self_authority: Authority,
    /// Seed endpoints contacted to fill an empty hosts pool.
    pub seeds: Vec<Authority>,
    /// Manual endpoints maintained for the lifetime of the network.
    pub peers: Vec<Authority>,
    /// Addresses never connected to or accepted; port zero matches every
    /// port.
    pub blacklist: Vec<Authority>,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            threads: 4,
            identifier: u32::from_le_bytes(Magic::BITCOIN.to_bytes()),
            inbound_port: 8333,
            inbound_connections: 8,
            outbound_connections: 8,
            manual_attempt_limit: 0,
            connect_batch_size: 5,
            connect_timeout: Duration::from_secs(5),
            channel_handshake: Duration::from_secs(30),
            channel_germination: Duration::from_secs(30),
            channel_heartbeat: Duration::from_secs(5 * 60),
            channel_inactivity: Duration::from_secs(10 * 60),
            channel_expiration: Duration::from_secs(60 * 60),
            channel_poll: Duration::from_secs(1),
            host_pool_capacity: 1000,
            hosts_file: PathBuf::from("hosts.cache"),
            protocol_minimum: PROTOCOL_VERSION_FLOOR,
            protocol_maximum: PROTOCOL_VERSION_CEILING,
            services: ServiceFlags::NETWORK,
            relay: true,
            user_agent: default_user_agent(),
            self_authority: Authority::unspecified(),
            seeds: Vec::new(),
            peers: Vec::new(),
            blacklist: Vec::new(),
        }
    }
}

impl Settings {
    /// The wire magic in [`Magic`] form.
    pub fn magic(&self) -> Magic {
        Magic::from_bytes(self.identifier.to_le_bytes())
    }

    /// Per-channel limits derived from this configuration.
    pub fn channel_options(&self) -> ChannelOptions {
        ChannelOptions {
            magic: self.magic(),
            protocol_minimum: self.protocol_minimum,
            inactivity: self.channel_inactivity,
            expiration: self.channel_expiration,
        }
    }

    /// The socket address the inbound session binds.
    pub fn bind_address(&self) -> SocketAddr {
        SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), self.inbound_port)
    }

    /// Whether `authority` falls under a blacklist entry.
    pub fn is_blacklisted(&self, authority: &Authority) -> bool {
        self.blacklist.iter().any(|entry| entry.matches(authority))
    }

    /// Whether `authority` is this node's own advertised endpoint.
    pub fn is_self(&self, authority: &Authority) -> bool {
        !self.self_authority.is_unspecified() && self.self_authority.matches(authority)
    }

    /// Validate the protocol version bounds.
    ///
    /// Kept separate from [`validate`](Settings::validate) because the
    /// version protocol re-checks these before honoring a peer's version
    /// message.
    pub fn validate_protocol(&self) -> Result<(), Error> {
        if self.protocol_minimum < PROTOCOL_VERSION_FLOOR {
            error!(
                "invalid protocol configuration, minimum below {}",
                PROTOCOL_VERSION_FLOOR
            );
            return Err(Error::OperationFailed);
        }
        if self.protocol_maximum > PROTOCOL_VERSION_CEILING {
            error!(
                "invalid protocol configuration, maximum above {}",
                PROTOCOL_VERSION_CEILING
            );
            return Err(Error::OperationFailed);
        }
        if self.protocol_minimum > self.protocol_maximum {
            error!("invalid protocol configuration, minimum exceeds maximum");
            return Err(Error::OperationFailed);
        }
        Ok(())
    }

    /// Validate the whole configuration ahead of start.
    pub fn validate(&self) -> Result<(), Error> {
        self.validate_protocol()?;

        if !self.user_agent.is_empty() {
            validate_user_agent(&self.user_agent)?;
        }

        for peer in &self.peers {
            if peer.port() == 0 {
                error!("manual endpoint {peer} has no port");
                return Err(Error::InvalidAuthority);
            }
        }
        for seed in &self.seeds {
            if seed.port() == 0 {
                error!("seed endpoint {seed} has no port");
                return Err(Error::InvalidAuthority);
            }
        }
        Ok(())
    }

    /// The user agent to advertise.
    pub(crate) fn effective_user_agent(&self) -> String {
        if self.user_agent.is_empty() {
            default_user_agent()
        } else {
            self.user_agent.clone()
        }
    }
}
