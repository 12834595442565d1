//! The version/verack handshake.

use super::{subscribe, unix_timestamp, BIP61_VERSION};
use crate::collections::PendingChannels;
use crate::settings::Settings;
use bitcoin::hashes::{sha256d, Hash};
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::message_network::{Reject, RejectReason, VersionMessage};
use bitcoin::p2p::ServiceFlags;
use bitcoin_network_channel::{Channel, Error};
use log::debug;
use std::cmp;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;

/// The per-channel handshake state machine.
///
/// One-shot: [`run`](VersionProtocol::run) subscribes to exactly one
/// `version` and one `verack`, sends this node's version message, and
/// resolves once when both replies have arrived or any failure has occurred.
/// The whole exchange is bounded by the configured handshake deadline.
///
/// A handshake failure leaves the channel running; the caller owns stopping
/// it with the returned code.
pub struct VersionProtocol {
    channel: Arc<Channel>,
    settings: Arc<Settings>,
    pending: Arc<PendingChannels>,
    height: u32,
    minimum_version: u32,
    minimum_services: ServiceFlags,
}

impl VersionProtocol {
    /// Attach to `channel` requiring the configured minimum version and
    /// services of the peer.
    pub fn new(
        channel: Arc<Channel>,
        settings: Arc<Settings>,
        pending: Arc<PendingChannels>,
        height: u32,
    ) -> Self {
        let minimum_version = settings.protocol_minimum;
        let minimum_services = settings.services;
        Self::with_requirements(
            channel,
            settings,
            pending,
            height,
            minimum_version,
            minimum_services,
        )
    }

    /// Attach to `channel` with explicit peer requirements.
    ///
    /// The seed session relaxes the service requirement: a seed only has to
    /// gossip addresses, not serve blocks.
    pub fn with_requirements(
        channel: Arc<Channel>,
        settings: Arc<Settings>,
        pending: Arc<PendingChannels>,
        height: u32,
        minimum_version: u32,
        minimum_services: ServiceFlags,
    ) -> Self {
        VersionProtocol {
            channel,
            settings,
            pending,
            height,
            minimum_version,
            minimum_services,
        }
    }

    /// Drive the handshake to completion.
    ///
    /// Returns the peer's version message on success. On failure the channel
    /// is left to the caller to stop with the returned code.
    pub async fn run(self) -> Result<VersionMessage, Error> {
        self.settings
            .validate_protocol()
            .map_err(|_| Error::ChannelStopped)?;

        let versions = subscribe(&self.channel, "version");
        let veracks = subscribe(&self.channel, "verack");
        self.channel.start();

        self.channel
            .send(NetworkMessage::Version(self.version_factory()))
            .await?;
        debug!("sent version to {}", self.channel.authority());

        match timeout(
            self.settings.channel_handshake,
            self.negotiate(versions, veracks),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                debug!("handshake with {} timed out", self.channel.authority());
                Err(Error::ChannelTimeout)
            }
        }
    }

    /// Wait for the peer's version and verack, in either order.
    async fn negotiate(
        &self,
        mut versions: UnboundedReceiver<Result<NetworkMessage, Error>>,
        mut veracks: UnboundedReceiver<Result<NetworkMessage, Error>>,
    ) -> Result<VersionMessage, Error> {
        let mut peer_version: Option<VersionMessage> = None;
        let mut verack = false;

        while peer_version.is_none() || !verack {
            tokio::select! {
                delivery = versions.recv() => match delivery {
                    Some(Ok(NetworkMessage::Version(version))) => {
                        if peer_version.is_none() {
                            self.handle_version(&version).await?;
                            peer_version = Some(version);
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(code)) => return Err(code),
                    None => return Err(Error::ChannelStopped),
                },
                delivery = veracks.recv() => match delivery {
                    Some(Ok(_)) => verack = true,
                    Some(Err(code)) => return Err(code),
                    None => return Err(Error::ChannelStopped),
                },
            }
        }

        Ok(peer_version.expect("loop exits with a version"))
    }

    /// Validate the peer's version message and answer it with a verack.
    async fn handle_version(&self, version: &VersionMessage) -> Result<(), Error> {
        let authority = *self.channel.authority();
        debug!("peer {} user agent: {}", authority, version.user_agent);

        // A version carrying a nonce we handed out looped back to us.
        if self.pending.contains_nonce(version.nonce) {
            debug!("connection to {authority} is a loop back to this node");
            return Err(Error::AcceptFailed);
        }

        if !version.services.has(self.minimum_services) {
            debug!(
                "insufficient peer services ({}) for {authority}",
                version.services
            );
            self.send_rejection(version, "insufficient-services").await;
            return Err(Error::ChannelStopped);
        }

        if version.version < self.minimum_version {
            debug!(
                "insufficient peer version ({}) for {authority}",
                version.version
            );
            self.send_rejection(version, "insufficient-version").await;
            return Err(Error::ChannelStopped);
        }

        let negotiated = cmp::min(version.version, self.settings.protocol_maximum);
        self.channel.set_negotiated_version(negotiated);
        self.channel.set_peer_details(
            version.services,
            version.version,
            version.user_agent.clone(),
        );
        debug!("negotiated protocol version {negotiated} for {authority}");

        self.channel.send(NetworkMessage::Verack).await?;
        Ok(())
    }

    /// Send an obsolete-version rejection when the peer can understand one.
    ///
    /// Best effort: the handshake fails regardless of whether the rejection
    /// reaches the wire, and delivery is never waited on.
    async fn send_rejection(&self, version: &VersionMessage, reason: &'static str) {
        if version.version < BIP61_VERSION || self.settings.protocol_maximum < BIP61_VERSION {
            return;
        }
        let rejection = Reject {
            message: "version".into(),
            ccode: RejectReason::Obsolete,
            reason: reason.into(),
            hash: sha256d::Hash::all_zeros(),
        };
        let _ = self.channel.send(NetworkMessage::Reject(rejection)).await;
    }

    /// Build this node's version message.
    fn version_factory(&self) -> VersionMessage {
        // The peer's services cannot be reflected back, so zero them.
        let receiver = self
            .channel
            .authority()
            .to_network_address(ServiceFlags::NONE);
        let sender = self
            .settings
            .self_authority
            .to_network_address(self.settings.services);

        VersionMessage {
            version: self.settings.protocol_maximum,
            services: self.settings.services,
            timestamp: unix_timestamp() as i64,
            receiver,
            sender,
            nonce: self.channel.nonce(),
            user_agent: self.settings.effective_user_agent(),
            start_height: cmp::min(self.height, i32::MAX as u32) as i32,
            relay: self.settings.relay && self.settings.protocol_maximum >= BIP61_VERSION,
        }
    }
}
