//! Shared connection-tracking collections.
//!
//! Each collection guards its state with its own lock; operations are atomic
//! and safe to call from any session or protocol task.

use bitcoin_network_channel::{Authority, Channel, Error};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

/// Channels whose handshake has not yet completed, keyed by the nonce each
/// sent in its version message.
///
/// Doubles as the connection-loop oracle: a received version message whose
/// nonce is present here came from this process.
#[derive(Debug, Default)]
pub struct PendingChannels {
    entries: Mutex<HashMap<u64, Authority>>,
}

impl PendingChannels {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a channel through its handshake.
    ///
    /// # Errors
    ///
    /// [`Error::OperationFailed`] when the nonce is already tracked.
    pub fn store(&self, nonce: u64, authority: Authority) -> Result<(), Error> {
        let mut entries = self.entries.lock().expect("pending channels lock");
        if entries.contains_key(&nonce) {
            return Err(Error::OperationFailed);
        }
        entries.insert(nonce, authority);
        Ok(())
    }

    /// Whether a handshake in flight sent `nonce`.
    pub fn contains_nonce(&self, nonce: u64) -> bool {
        self.entries
            .lock()
            .expect("pending channels lock")
            .contains_key(&nonce)
    }

    /// Whether a handshake to `authority` is in flight.
    pub fn contains_authority(&self, authority: &Authority) -> bool {
        self.entries
            .lock()
            .expect("pending channels lock")
            .values()
            .any(|entry| entry == authority)
    }

    /// Stop tracking `nonce`.
    pub fn remove(&self, nonce: u64) {
        self.entries
            .lock()
            .expect("pending channels lock")
            .remove(&nonce);
    }

    /// Number of handshakes in flight.
    pub fn count(&self) -> usize {
        self.entries.lock().expect("pending channels lock").len()
    }
}

/// Endpoints with a connect attempt in flight, used to suppress duplicate
/// simultaneous dials.
#[derive(Debug, Default)]
pub struct PendingSockets {
    entries: Mutex<HashSet<Authority>>,
}

impl PendingSockets {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a connect attempt. Returns `false` when one is already in
    /// flight for `authority`.
    pub fn store(&self, authority: Authority) -> bool {
        self.entries
            .lock()
            .expect("pending sockets lock")
            .insert(authority)
    }

    /// Whether a connect attempt to `authority` is in flight.
    pub fn contains(&self, authority: &Authority) -> bool {
        self.entries
            .lock()
            .expect("pending sockets lock")
            .contains(authority)
    }

    /// Mark the attempt for `authority` as resolved.
    pub fn remove(&self, authority: &Authority) {
        self.entries
            .lock()
            .expect("pending sockets lock")
            .remove(authority);
    }

    /// Number of connect attempts in flight.
    pub fn count(&self) -> usize {
        self.entries.lock().expect("pending sockets lock").len()
    }
}

/// The set of live, handshaked channels.
///
/// Enforces the liveness invariants: no two channels to the same authority
/// and no two channels sharing a nonce.
#[derive(Debug, Default)]
pub struct Connections {
    entries: Mutex<HashMap<u64, Arc<Channel>>>,
}

impl Connections {
    /// Create an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a live channel.
    ///
    /// # Errors
    ///
    /// [`Error::OperationFailed`] when a live channel already exists for the
    /// same authority or nonce.
    pub fn store(&self, channel: Arc<Channel>) -> Result<(), Error> {
        let mut entries = self.entries.lock().expect("connections lock");
        if entries.contains_key(&channel.nonce()) {
            return Err(Error::OperationFailed);
        }
        if entries
            .values()
            .any(|live| live.authority() == channel.authority())
        {
            return Err(Error::OperationFailed);
        }
        entries.insert(channel.nonce(), channel);
        Ok(())
    }

    /// Deregister the channel with `nonce`, returning it if it was live.
    pub fn remove(&self, nonce: u64) -> Option<Arc<Channel>> {
        self.entries.lock().expect("connections lock").remove(&nonce)
    }

    /// Whether a live channel exists for `authority`.
    pub fn exists(&self, authority: &Authority) -> bool {
        self.entries
            .lock()
            .expect("connections lock")
            .values()
            .any(|live| live.authority() == authority)
    }

    /// Whether a live channel exists for the address of `authority`,
    /// regardless of port. Inbound connections arrive from ephemeral ports,
    /// so duplicate suppression goes by address alone.
    pub fn exists_address(&self, authority: &Authority) -> bool {
        self.entries
            .lock()
            .expect("connections lock")
            .values()
            .any(|live| live.authority().ip() == authority.ip())
    }

    /// Number of live channels.
    pub fn count(&self) -> usize {
        self.entries.lock().expect("connections lock").len()
    }

    /// The live channels at this instant.
    pub fn snapshot(&self) -> Vec<Arc<Channel>> {
        self.entries
            .lock()
            .expect("connections lock")
            .values()
            .cloned()
            .collect()
    }

    /// Stop every live channel with `code` and empty the set.
    pub fn stop_all(&self, code: Error) {
        let drained: Vec<Arc<Channel>> = {
            let mut entries = self.entries.lock().expect("connections lock");
            entries.drain().map(|(_, channel)| channel).collect()
        };
        for channel in drained {
            channel.stop(code.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::p2p::Magic;
    use bitcoin_network_channel::{ChannelOptions, Socket};
    use std::time::Duration;

    fn test_channel(authority: &str) -> Arc<Channel> {
        let (near, _far) = tokio::io::duplex(1024);
        let (reader, writer) = tokio::io::split(near);
        let socket = Socket::from_parts(authority.parse().unwrap(), reader, writer);
        Channel::new(
            socket,
            ChannelOptions {
                magic: Magic::BITCOIN,
                protocol_minimum: 31402,
                inactivity: Duration::from_secs(60),
                expiration: Duration::from_secs(120),
            },
        )
    }

    #[test]
    fn test_pending_channels_reject_duplicate_nonce() {
        let pending = PendingChannels::new();
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();

        pending.store(7, authority).unwrap();
        assert_eq!(pending.store(7, authority), Err(Error::OperationFailed));
        assert!(pending.contains_nonce(7));
        assert!(pending.contains_authority(&authority));

        pending.remove(7);
        assert!(!pending.contains_nonce(7));
        assert_eq!(pending.count(), 0);
    }

    #[test]
    fn test_pending_sockets_suppress_duplicates() {
        let pending = PendingSockets::new();
        let authority: Authority = "1.2.3.4:8333".parse().unwrap();

        assert!(pending.store(authority));
        assert!(!pending.store(authority));
        assert!(pending.contains(&authority));

        pending.remove(&authority);
        assert!(pending.store(authority));
    }

    #[tokio::test]
    async fn test_connections_reject_duplicate_authority() {
        let connections = Connections::new();
        let first = test_channel("1.2.3.4:8333");
        let second = test_channel("1.2.3.4:8333");

        connections.store(first).unwrap();
        assert_eq!(connections.store(second), Err(Error::OperationFailed));
        assert_eq!(connections.count(), 1);
    }

    #[tokio::test]
    async fn test_connections_remove_by_nonce() {
        let connections = Connections::new();
        let channel = test_channel("1.2.3.4:8333");
        let nonce = channel.nonce();

        connections.store(channel).unwrap();
        assert!(connections.exists(&"1.2.3.4:8333".parse().unwrap()));

        let removed = connections.remove(nonce).unwrap();
        assert_eq!(removed.nonce(), nonce);
        assert_eq!(connections.count(), 0);
    }

    #[tokio::test]
    async fn test_connections_stop_all_delivers_code() {
        let connections = Connections::new();
        let first = test_channel("1.2.3.4:8333");
        let second = test_channel("4.3.2.1:8333");
        connections.store(first.clone()).unwrap();
        connections.store(second.clone()).unwrap();

        connections.stop_all(Error::ServiceStopped);
        assert_eq!(connections.count(), 0);
        assert_eq!(first.wait_stop().await, Error::ServiceStopped);
        assert_eq!(second.wait_stop().await, Error::ServiceStopped);
    }
}
