//! The top-level network orchestrator.

use crate::collections::{Connections, PendingChannels, PendingSockets};
use crate::hosts::Hosts;
use crate::sessions::{
    ChannelSubscribers, InboundSession, ManualSession, OutboundSession, SeedSession, Session,
};
use crate::settings::Settings;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin_network_channel::{Authority, Channel, Error, StopSignal};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

/// The peer-to-peer network engine.
///
/// Owns the configuration, the known-hosts pool, the live-connection set,
/// and the sessions that feed it: seeding, manual endpoints, outbound slots,
/// and the inbound listener. One instance drives one start/stop cycle.
///
/// # Lifecycle
///
/// [`start`](P2p::start) validates the configuration, loads the hosts pool,
/// runs the seed session to completion, then brings up the remaining
/// sessions. [`stop`](P2p::stop) fires the stop signal, stops every live
/// channel, and saves the hosts pool. A hosts save failure is logged rather
/// than propagated; by that point the network is already down.
pub struct P2p {
    settings: Arc<Settings>,
    hosts: Arc<Hosts>,
    connections: Arc<Connections>,
    pending_channels: Arc<PendingChannels>,
    pending_sockets: Arc<PendingSockets>,
    height: Arc<AtomicU32>,
    channel_subscribers: ChannelSubscribers,
    stop: StopSignal,
    started: AtomicBool,
    manual: Mutex<Option<ManualSession>>,
    listen: Mutex<Option<SocketAddr>>,
}

impl P2p {
    /// Build an engine from `settings`. Nothing runs until
    /// [`start`](P2p::start).
    pub fn new(settings: Settings) -> Self {
        let hosts = Arc::new(Hosts::new(
            settings.host_pool_capacity,
            settings.hosts_file.clone(),
        ));
        P2p {
            settings: Arc::new(settings),
            hosts,
            connections: Arc::new(Connections::new()),
            pending_channels: Arc::new(PendingChannels::new()),
            pending_sockets: Arc::new(PendingSockets::new()),
            height: Arc::new(AtomicU32::new(0)),
            channel_subscribers: ChannelSubscribers::default(),
            stop: StopSignal::new(),
            started: AtomicBool::new(false),
            manual: Mutex::new(None),
            listen: Mutex::new(None),
        }
    }

    /// Start the network.
    ///
    /// Resolves once every session is up: the hosts pool is loaded, seeding
    /// has completed, manual supervisors and outbound slots are running, and
    /// the inbound listener (if enabled) is bound. Any failure along the way
    /// aborts the start and is returned.
    pub async fn start(&self) -> Result<(), Error> {
        self.settings.validate()?;
        if self.started.swap(true, Ordering::AcqRel) {
            error!("network already started");
            return Err(Error::OperationFailed);
        }

        self.hosts.load()?;

        let session = self.session();

        SeedSession::new(session.clone()).start().await?;

        let manual = ManualSession::new(session.clone());
        manual.start();
        *self.manual.lock().expect("manual lock") = Some(manual);

        OutboundSession::new(session.clone()).start();

        let bound = InboundSession::new(session).start().await?;
        *self.listen.lock().expect("listen lock") = bound;

        info!("network started");
        Ok(())
    }

    /// Stop the network. Idempotent.
    ///
    /// Sessions observe the stop signal and cancel their in-flight work,
    /// every live channel is stopped with
    /// [`Error::ServiceStopped`], and the hosts pool is saved.
    pub async fn stop(&self) {
        if self.stop.fired() {
            return;
        }
        self.stop.fire();
        self.connections.stop_all(Error::ServiceStopped);
        if let Err(code) = self.hosts.save() {
            warn!("failed to save hosts pool: {code}");
        }
        info!("network stopped");
    }

    /// Maintain a connection to `authority` beyond the configured manual
    /// endpoints.
    ///
    /// # Errors
    ///
    /// [`Error::ServiceStopped`] when the network is not running.
    pub fn connect(&self, authority: Authority) -> Result<(), Error> {
        if self.stop.fired() {
            return Err(Error::ServiceStopped);
        }
        match self.manual.lock().expect("manual lock").as_ref() {
            Some(manual) => {
                manual.connect(authority);
                Ok(())
            }
            None => Err(Error::ServiceStopped),
        }
    }

    /// Send `message` to every live channel.
    ///
    /// Returns one entry per channel with the outcome of its send; a failed
    /// send stops only the channel it failed on.
    pub async fn broadcast(
        &self,
        message: NetworkMessage,
    ) -> Vec<(Authority, Result<(), Error>)> {
        let mut outcomes = Vec::new();
        for channel in self.connections.snapshot() {
            let outcome = channel.send(message.clone()).await;
            outcomes.push((*channel.authority(), outcome));
        }
        outcomes
    }

    /// Number of live, handshaked channels.
    pub fn connection_count(&self) -> usize {
        self.connections.count()
    }

    /// Observe every channel that completes its handshake, outbound or
    /// inbound, so callers can attach protocols of their own. Dropping the
    /// receiver ends the subscription.
    pub fn subscribe_channels(&self) -> mpsc::UnboundedReceiver<Arc<Channel>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.channel_subscribers
            .lock()
            .expect("channel subscribers lock")
            .push(tx);
        rx
    }

    /// The address the inbound listener is bound to, once started.
    pub fn listen_address(&self) -> Option<SocketAddr> {
        *self.listen.lock().expect("listen lock")
    }

    /// The current block height advertised in version messages.
    pub fn height(&self) -> u32 {
        self.height.load(Ordering::Acquire)
    }

    /// Record the block height to advertise. The embedding validation engine
    /// calls this as the chain grows.
    pub fn set_height(&self, height: u32) {
        self.height.store(height, Ordering::Release);
    }

    /// The known-hosts pool.
    pub fn hosts(&self) -> &Arc<Hosts> {
        &self.hosts
    }

    /// The configuration this engine runs with.
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    fn session(&self) -> Session {
        Session {
            settings: self.settings.clone(),
            hosts: self.hosts.clone(),
            connections: self.connections.clone(),
            pending_channels: self.pending_channels.clone(),
            pending_sockets: self.pending_sockets.clone(),
            height: self.height.clone(),
            channel_subscribers: self.channel_subscribers.clone(),
            stop: self.stop.token(),
        }
    }
}

impl std::fmt::Debug for P2p {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("P2p")
            .field("connections", &self.connection_count())
            .field("hosts", &self.hosts.count())
            .field("stopped", &self.stop.fired())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_start_rejects_invalid_settings() {
        let mut settings = Settings::default();
        settings.protocol_minimum = settings.protocol_maximum + 1;
        let network = P2p::new(settings);
        assert_eq!(network.start().await, Err(Error::OperationFailed));
    }

    #[tokio::test]
    async fn test_connect_before_start_is_refused() {
        let network = P2p::new(Settings::default());
        assert_eq!(
            network.connect("1.2.3.4:8333".parse().unwrap()),
            Err(Error::ServiceStopped)
        );
    }

    #[tokio::test]
    async fn test_height_round_trip() {
        let network = P2p::new(Settings::default());
        assert_eq!(network.height(), 0);
        network.set_height(840_000);
        assert_eq!(network.height(), 840_000);
    }

    #[tokio::test]
    async fn test_broadcast_without_connections_is_empty() {
        let network = P2p::new(Settings::default());
        assert!(network.broadcast(NetworkMessage::GetAddr).await.is_empty());
    }
}
