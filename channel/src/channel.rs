//! Live peer channels.

use crate::authority::Authority;
use crate::error::Error;
use crate::socket::{LockedSocket, Socket, SocketReader};
use crate::subscriber::{MessageHandler, MessageSubscriber};
use crate::transport::TransportReader;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::{Magic, ServiceFlags};
use log::debug;
use std::process;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::watch;
use tokio::time::Instant;

/// Generate a 64-bit nonce.
///
/// Mixes the wall clock with the process id, then folds in a process-wide
/// sequence so no two calls in one process ever collide. Not
/// cryptographically secure, which the p2p protocol's loop detection does
/// not require.
pub fn generate_nonce() -> u64 {
    static SEED: OnceLock<u64> = OnceLock::new();
    static SEQUENCE: AtomicU64 = AtomicU64::new(0);

    let seed = *SEED.get_or_init(|| {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time is before the unix epoch")
            .as_nanos() as u64;
        now ^ (process::id() as u64).rotate_left(32)
    });

    seed ^ SEQUENCE.fetch_add(1, Ordering::Relaxed).rotate_left(17)
}

/// Service state a peer advertised during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerServices {
    /// Known services with specific flags.
    Known(ServiceFlags),
    /// Nothing advertised yet.
    Unknown,
}

/// Protocol version a peer advertised during the handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerVersion {
    /// Known protocol version.
    Known(u32),
    /// Nothing advertised yet.
    Unknown,
}

/// What the remote peer has told us about itself.
#[derive(Debug, Clone)]
pub struct PeerDetails {
    /// Advertised service flags.
    pub services: PeerServices,
    /// Advertised protocol version.
    pub version: PeerVersion,
    /// Advertised user agent.
    pub user_agent: Option<String>,
}

impl PeerDetails {
    fn unknown() -> Self {
        PeerDetails {
            services: PeerServices::Unknown,
            version: PeerVersion::Unknown,
            user_agent: None,
        }
    }

    /// Whether the peer advertises every flag in `services`.
    pub fn has_services(&self, services: ServiceFlags) -> bool {
        match self.services {
            PeerServices::Known(flags) => flags.has(services),
            PeerServices::Unknown => false,
        }
    }
}

/// Per-channel limits and identity.
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Wire magic stamped on and required of every frame.
    pub magic: Magic,
    /// Initial negotiated version, until the handshake raises it.
    pub protocol_minimum: u32,
    /// Stop the channel when no frame arrives for this long.
    pub inactivity: Duration,
    /// Stop the channel when it outlives this deadline without traffic.
    pub expiration: Duration,
}

/// One live peer connection.
///
/// A channel owns the framed I/O for a single remote peer: a reader task
/// that decodes frames and fans them out through the [`MessageSubscriber`],
/// a [`LockedSocket`] serializing writes, the channel nonce used for
/// connection-loop detection, and the negotiated protocol version.
///
/// All subscriber callbacks for one channel run on its reader task, so no
/// two callbacks of the same channel execute concurrently. Channels from
/// different peers run in parallel.
///
/// Stopping is idempotent: the first [`stop`](Channel::stop) wins, later
/// calls are no-ops, and every subscriber observes the stop code exactly
/// once.
pub struct Channel {
    nonce: u64,
    authority: Authority,
    options: ChannelOptions,
    negotiated: AtomicU32,
    peer: Mutex<PeerDetails>,
    subscriber: MessageSubscriber,
    socket: LockedSocket,
    reader: Mutex<Option<TransportReader<SocketReader>>>,
    started: AtomicBool,
    stop_tx: watch::Sender<Option<Error>>,
    last_activity: Mutex<Instant>,
}

impl Channel {
    /// Build a channel over `socket`.
    ///
    /// The reader task does not run until [`start`](Channel::start); subscribe
    /// handlers first so no early frame is lost.
    pub fn new(socket: Socket, options: ChannelOptions) -> Arc<Self> {
        let (authority, reader, writer) = socket.into_parts();
        let (stop_tx, _) = watch::channel(None);

        Arc::new(Channel {
            nonce: generate_nonce(),
            authority,
            negotiated: AtomicU32::new(options.protocol_minimum),
            peer: Mutex::new(PeerDetails::unknown()),
            subscriber: MessageSubscriber::new(),
            socket: LockedSocket::new(options.magic, writer),
            reader: Mutex::new(Some(TransportReader::new(options.magic, reader))),
            options,
            started: AtomicBool::new(false),
            stop_tx,
            last_activity: Mutex::new(Instant::now()),
        })
    }

    /// The nonce this channel sends in its version message.
    pub fn nonce(&self) -> u64 {
        self.nonce
    }

    /// The remote endpoint.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// The negotiated protocol version; the configured minimum until the
    /// handshake completes.
    pub fn negotiated_version(&self) -> u32 {
        self.negotiated.load(Ordering::Acquire)
    }

    /// Record the negotiated protocol version. Called once by the version
    /// protocol after the handshake.
    pub fn set_negotiated_version(&self, version: u32) {
        self.negotiated.store(version, Ordering::Release);
    }

    /// What the peer advertised about itself.
    pub fn peer_details(&self) -> PeerDetails {
        self.peer.lock().expect("peer lock").clone()
    }

    /// Record what the peer advertised in its version message.
    pub fn set_peer_details(&self, services: ServiceFlags, version: u32, user_agent: String) {
        let mut peer = self.peer.lock().expect("peer lock");
        peer.services = PeerServices::Known(services);
        peer.version = PeerVersion::Known(version);
        peer.user_agent = Some(user_agent);
    }

    /// Append a handler for `command` frames.
    pub fn subscribe(&self, command: &str, handler: MessageHandler) {
        self.subscriber.subscribe(command, handler);
    }

    /// Spawn the reader task. Idempotent.
    pub fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.stopped() {
            return;
        }
        let channel = self.clone();
        tokio::spawn(async move { channel.read_loop().await });
    }

    /// Frame and send `message`.
    ///
    /// Resolves once the bytes have been submitted to the transport. A write
    /// failure stops the channel with the failure code.
    pub async fn send(&self, message: NetworkMessage) -> Result<(), Error> {
        if self.stopped() {
            return Err(Error::ChannelStopped);
        }
        match self.socket.send(message).await {
            Ok(()) => Ok(()),
            Err(code) => {
                self.stop(code.clone());
                Err(code)
            }
        }
    }

    /// Stop the channel with `code`.
    ///
    /// Idempotent. The first call cancels the timers and notifies every
    /// subscriber with `code`; later calls do nothing. The reader task closes
    /// the transport when it observes the stop.
    pub fn stop(&self, code: Error) {
        let first = self.stop_tx.send_if_modified(|state| {
            if state.is_none() {
                *state = Some(code.clone());
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        debug!("stopping channel to {}: {}", self.authority, code);
        self.subscriber.stop(code);
    }

    /// Whether the channel has stopped.
    pub fn stopped(&self) -> bool {
        self.stop_tx.borrow().is_some()
    }

    /// Wait for the channel to stop and return the stop code.
    pub async fn wait_stop(&self) -> Error {
        let mut rx = self.stop_tx.subscribe();
        loop {
            if let Some(code) = rx.borrow().clone() {
                return code;
            }
            if rx.changed().await.is_err() {
                return Error::ChannelStopped;
            }
        }
    }

    /// How long since the last frame arrived.
    pub fn idle(&self) -> Duration {
        self.last_activity.lock().expect("activity lock").elapsed()
    }

    async fn read_loop(self: Arc<Self>) {
        let mut reader = self
            .reader
            .lock()
            .expect("reader lock")
            .take()
            .expect("reader taken once");
        let mut stop_rx = self.stop_tx.subscribe();

        loop {
            let last = *self.last_activity.lock().expect("activity lock");
            let inactivity_at = last + self.options.inactivity;
            let expiration_at = last + self.options.expiration;

            tokio::select! {
                result = reader.read() => match result {
                    Ok(message) => {
                        *self.last_activity.lock().expect("activity lock") = Instant::now();
                        self.subscriber.notify(message.cmd(), &message);
                    }
                    Err(code) => {
                        self.stop(code);
                        break;
                    }
                },
                _ = tokio::time::sleep_until(inactivity_at) => {
                    debug!("channel to {} idle beyond limit", self.authority);
                    self.stop(Error::ChannelTimeout);
                    break;
                }
                _ = tokio::time::sleep_until(expiration_at) => {
                    debug!("channel to {} expired", self.authority);
                    self.stop(Error::ChannelTimeout);
                    break;
                }
                _ = stop_rx.changed() => break,
            }
        }

        self.socket.close().await;
    }
}

impl std::fmt::Display for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "channel to {} (version {})",
            self.authority,
            self.negotiated_version()
        )
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("authority", &self.authority)
            .field("nonce", &self.nonce)
            .field("stopped", &self.stopped())
            .finish_non_exhaustive()
    }
}
