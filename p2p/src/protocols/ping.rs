//! The ping/pong heartbeat.

use super::{subscribe, BIP31_VERSION};
use bitcoin::p2p::message::NetworkMessage;
use bitcoin_network_channel::{generate_nonce, Channel, Error};
use log::debug;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

/// Keeps a channel alive with periodic pings and polices the replies.
///
/// For peers negotiated at BIP 31 (60001) or later, every ping carries a
/// fresh nonce and the matching pong must arrive before the next heartbeat;
/// a mismatched nonce stops the channel with [`Error::BadStream`], a missing
/// pong with [`Error::ChannelTimeout`]. The protocol also answers the peer's
/// pings with pongs. Below BIP 31 pings are fire-and-forget.
pub struct PingProtocol {
    channel: Arc<Channel>,
    heartbeat: Duration,
}

impl PingProtocol {
    /// Attach to `channel` with the given heartbeat period.
    pub fn new(channel: Arc<Channel>, heartbeat: Duration) -> Self {
        PingProtocol { channel, heartbeat }
    }

    /// Spawn the heartbeat task. It winds down when the channel stops.
    ///
    /// Subscriptions are registered before this returns, so no frame that
    /// arrives afterwards can be missed.
    pub fn start(self) -> JoinHandle<()> {
        let pongs = subscribe(&self.channel, "pong");
        let pings = subscribe(&self.channel, "ping");
        tokio::spawn(self.run(pongs, pings))
    }

    async fn run(
        self,
        mut pongs: mpsc::UnboundedReceiver<Result<NetworkMessage, Error>>,
        mut pings: mpsc::UnboundedReceiver<Result<NetworkMessage, Error>>,
    ) {
        // The negotiated version is fixed by the time protocols attach.
        let nonced = self.channel.negotiated_version() >= BIP31_VERSION;

        let mut outstanding: Option<u64> = None;
        let mut ticker = interval_at(Instant::now() + self.heartbeat, self.heartbeat);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if outstanding.is_some() {
                        debug!(
                            "no pong from {} within the heartbeat",
                            self.channel.authority()
                        );
                        self.channel.stop(Error::ChannelTimeout);
                        break;
                    }
                    // A busy channel proves itself; only probe idle ones.
                    if self.channel.idle() < self.heartbeat {
                        continue;
                    }
                    let nonce = if nonced { generate_nonce() } else { 0 };
                    if nonced {
                        outstanding = Some(nonce);
                    }
                    if self.channel.send(NetworkMessage::Ping(nonce)).await.is_err() {
                        break;
                    }
                }
                delivery = pongs.recv() => match delivery {
                    Some(Ok(NetworkMessage::Pong(nonce))) => {
                        if !nonced {
                            continue;
                        }
                        match outstanding.take() {
                            Some(expected) if expected == nonce => {}
                            Some(_) => {
                                debug!(
                                    "mismatched pong nonce from {}",
                                    self.channel.authority()
                                );
                                self.channel.stop(Error::BadStream);
                                break;
                            }
                            // Replies the application solicited itself pass through.
                            None => {}
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
                delivery = pings.recv() => match delivery {
                    Some(Ok(NetworkMessage::Ping(nonce))) => {
                        if nonced
                            && self.channel.send(NetworkMessage::Pong(nonce)).await.is_err()
                        {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
            }
        }
    }
}
