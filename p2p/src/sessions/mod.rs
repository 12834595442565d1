//! Connection-lifecycle supervisors.
//!
//! Each session owns a strategy for producing channels (seeding, manual
//! endpoints, outbound slots, inbound accepts) and drives every channel it
//! produces through the same lifecycle: track it through the handshake,
//! register it among the live connections, attach the standard protocol set,
//! and deregister it when it stops.

mod inbound;
mod manual;
mod outbound;
mod seed;

pub(crate) use inbound::InboundSession;
pub(crate) use manual::ManualSession;
pub(crate) use outbound::OutboundSession;
pub(crate) use seed::SeedSession;

use crate::collections::{Connections, PendingChannels, PendingSockets};
use crate::hosts::Hosts;
use crate::protocols::{AddressProtocol, PingProtocol, VersionProtocol};
use crate::settings::Settings;
use bitcoin::p2p::ServiceFlags;
use bitcoin_network_channel::{Authority, Channel, Connector, Error, StopToken};
use log::debug;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Senders notified of every newly established channel.
pub(crate) type ChannelSubscribers = Arc<Mutex<Vec<mpsc::UnboundedSender<Arc<Channel>>>>>;

/// Shared state and channel-lifecycle building blocks for every session.
#[derive(Clone)]
pub(crate) struct Session {
    pub settings: Arc<Settings>,
    pub hosts: Arc<Hosts>,
    pub connections: Arc<Connections>,
    pub pending_channels: Arc<PendingChannels>,
    pub pending_sockets: Arc<PendingSockets>,
    pub height: Arc<AtomicU32>,
    pub channel_subscribers: ChannelSubscribers,
    pub stop: StopToken,
}

impl Session {
    /// A connector configured for this network.
    pub fn connector(&self) -> Connector {
        Connector::new(
            self.settings.channel_options(),
            self.settings.connect_timeout,
            self.stop.clone(),
        )
    }

    /// Open a channel to `authority`, refusing blacklisted targets and
    /// duplicate simultaneous dials.
    pub async fn connect_channel(&self, authority: &Authority) -> Result<Arc<Channel>, Error> {
        if self.stop.fired() {
            return Err(Error::ServiceStopped);
        }
        if self.settings.is_blacklisted(authority) {
            debug!("refusing blacklisted endpoint {authority}");
            return Err(Error::OperationFailed);
        }
        if !self.pending_sockets.store(*authority) {
            return Err(Error::OperationFailed);
        }
        let _guard = SocketGuard {
            pending: self.pending_sockets.clone(),
            authority: *authority,
        };
        self.connector().connect(authority).await
    }

    /// Run the version handshake with the configured peer requirements.
    pub async fn handshake(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        self.handshake_with(
            channel,
            self.settings.protocol_minimum,
            self.settings.services,
        )
        .await
    }

    /// Run the version handshake requiring `minimum_version` and
    /// `minimum_services` of the peer.
    ///
    /// The channel is tracked in the pending set for the duration, on every
    /// exit path. A failed handshake stops the channel with the failure
    /// code.
    pub async fn handshake_with(
        &self,
        channel: &Arc<Channel>,
        minimum_version: u32,
        minimum_services: ServiceFlags,
    ) -> Result<(), Error> {
        if let Err(code) = self
            .pending_channels
            .store(channel.nonce(), *channel.authority())
        {
            channel.stop(code.clone());
            return Err(code);
        }
        let _guard = ChannelGuard {
            pending: self.pending_channels.clone(),
            nonce: channel.nonce(),
        };

        let protocol = VersionProtocol::with_requirements(
            channel.clone(),
            self.settings.clone(),
            self.pending_channels.clone(),
            self.height.load(Ordering::Acquire),
            minimum_version,
            minimum_services,
        );

        let outcome = tokio::select! {
            outcome = protocol.run() => outcome.map(|_| ()),
            _ = self.stop.wait() => Err(Error::ServiceStopped),
        };

        if let Err(code) = &outcome {
            channel.stop(code.clone());
        }
        outcome
    }

    /// Register a handshaked channel among the live connections and attach
    /// the standard protocol set.
    ///
    /// On success the channel is removed from the set again when it stops.
    /// On failure (duplicate authority or nonce) the channel is stopped.
    pub fn register(&self, channel: &Arc<Channel>) -> Result<(), Error> {
        if let Err(code) = self.connections.store(channel.clone()) {
            debug!(
                "refusing duplicate connection to {}",
                channel.authority()
            );
            channel.stop(code.clone());
            return Err(code);
        }

        PingProtocol::new(channel.clone(), self.settings.channel_heartbeat).start();
        AddressProtocol::new(channel.clone(), self.hosts.clone(), self.settings.clone()).start();

        // Callers attach their own protocols through the channel
        // subscription; a closed receiver drops out of the list.
        self.channel_subscribers
            .lock()
            .expect("channel subscribers lock")
            .retain(|subscriber| subscriber.send(channel.clone()).is_ok());

        let connections = self.connections.clone();
        let watched = channel.clone();
        tokio::spawn(async move {
            let code = watched.wait_stop().await;
            connections.remove(watched.nonce());
            debug!("channel to {} left with {}", watched.authority(), code);
        });
        Ok(())
    }

    /// Connect, handshake, nothing more. The building block outbound slots
    /// race against each other.
    pub async fn establish(&self, authority: &Authority) -> Result<Arc<Channel>, Error> {
        let channel = self.connect_channel(authority).await?;
        let guard = StopGuard::new(channel.clone());
        self.handshake(&channel).await?;
        guard.defuse();
        Ok(channel)
    }

    /// Sleep for `period`, waking early if the session stops. Returns
    /// `false` when the session stopped.
    pub async fn pause(&self, period: Duration) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(period) => true,
            _ = self.stop.wait() => false,
        }
    }
}

/// Removes a pending-socket entry when the connect attempt resolves,
/// including by task abort.
struct SocketGuard {
    pending: Arc<PendingSockets>,
    authority: Authority,
}

impl Drop for SocketGuard {
    fn drop(&mut self) {
        self.pending.remove(&self.authority);
    }
}

/// Removes a pending-channel entry when the handshake resolves, including by
/// task abort.
struct ChannelGuard {
    pending: Arc<PendingChannels>,
    nonce: u64,
}

impl Drop for ChannelGuard {
    fn drop(&mut self) {
        self.pending.remove(self.nonce);
    }
}

/// Stops a channel unless defused, so an aborted task never leaks a running
/// reader.
pub(crate) struct StopGuard {
    channel: Option<Arc<Channel>>,
}

impl StopGuard {
    pub fn new(channel: Arc<Channel>) -> Self {
        StopGuard {
            channel: Some(channel),
        }
    }

    pub fn defuse(mut self) {
        self.channel = None;
    }
}

impl Drop for StopGuard {
    fn drop(&mut self) {
        if let Some(channel) = self.channel.take() {
            channel.stop(Error::ServiceStopped);
        }
    }
}
