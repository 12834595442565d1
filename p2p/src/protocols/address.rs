//! Address gossip.

use super::{subscribe, unix_timestamp};
use crate::hosts::Hosts;
use crate::settings::Settings;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::ServiceFlags;
use bitcoin_network_channel::{Authority, Channel, Error};
use log::debug;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Most entries an `addr` message may carry, sent or received.
///
/// Larger unsolicited bursts are dropped whole rather than truncated.
pub const MAX_ADDRESS_COUNT: usize = 1000;

/// Feeds the hosts pool from `addr` gossip and answers `getaddr` queries.
///
/// On start the protocol asks the peer for addresses (unless the pool is
/// disabled). Received entries land in the shared [`Hosts`] pool, which
/// enforces its own bound and deduplication.
pub struct AddressProtocol {
    channel: Arc<Channel>,
    hosts: Arc<Hosts>,
    settings: Arc<Settings>,
}

impl AddressProtocol {
    /// Attach to `channel`, gossiping against the shared pool.
    pub fn new(channel: Arc<Channel>, hosts: Arc<Hosts>, settings: Arc<Settings>) -> Self {
        AddressProtocol {
            channel,
            hosts,
            settings,
        }
    }

    /// Spawn the gossip task. It winds down when the channel stops.
    ///
    /// Subscriptions are registered before this returns, so no frame that
    /// arrives afterwards can be missed.
    pub fn start(self) -> JoinHandle<()> {
        let addresses = subscribe(&self.channel, "addr");
        let queries = subscribe(&self.channel, "getaddr");
        tokio::spawn(self.run(addresses, queries))
    }

    async fn run(
        self,
        mut addresses: mpsc::UnboundedReceiver<Result<NetworkMessage, Error>>,
        mut queries: mpsc::UnboundedReceiver<Result<NetworkMessage, Error>>,
    ) {
        if self.settings.host_pool_capacity > 0
            && self.channel.send(NetworkMessage::GetAddr).await.is_err()
        {
            return;
        }

        loop {
            tokio::select! {
                delivery = addresses.recv() => match delivery {
                    Some(Ok(NetworkMessage::Addr(entries))) => self.handle_addresses(entries),
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
                delivery = queries.recv() => match delivery {
                    Some(Ok(NetworkMessage::GetAddr)) => {
                        if self.handle_query().await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(_)) => {}
                    Some(Err(_)) | None => break,
                },
            }
        }
    }

    fn handle_addresses(&self, entries: Vec<(u32, bitcoin::p2p::Address)>) {
        if entries.len() > MAX_ADDRESS_COUNT {
            debug!(
                "dropping oversized addr ({} entries) from {}",
                entries.len(),
                self.channel.authority()
            );
            return;
        }
        debug!(
            "storing {} addresses from {}",
            entries.len(),
            self.channel.authority()
        );
        self.hosts.store_many(
            entries
                .iter()
                .map(|(_, address)| Authority::from_network_address(address)),
        );
    }

    async fn handle_query(&self) -> Result<(), Error> {
        let sample = self.hosts.snapshot(MAX_ADDRESS_COUNT);
        if sample.is_empty() {
            return Ok(());
        }
        // The pool records endpoints only; advertised services are unknown.
        let timestamp = unix_timestamp() as u32;
        let entries: Vec<(u32, bitcoin::p2p::Address)> = sample
            .iter()
            .map(|authority| (timestamp, authority.to_network_address(ServiceFlags::NONE)))
            .collect();

        debug!(
            "answering getaddr from {} with {} entries",
            self.channel.authority(),
            entries.len()
        );
        self.channel.send(NetworkMessage::Addr(entries)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocols::testing::{channel_pair, test_options};
    use std::path::PathBuf;
    use std::time::Duration;

    fn test_settings() -> Arc<Settings> {
        Arc::new(Settings::default())
    }

    fn scratch_hosts() -> Arc<Hosts> {
        Arc::new(Hosts::new(100, PathBuf::from("unused-hosts.cache")))
    }

    fn addr_entry(last_octet: u8) -> (u32, bitcoin::p2p::Address) {
        let authority: Authority = format!("10.9.9.{last_octet}:8333").parse().unwrap();
        (0, authority.to_network_address(ServiceFlags::NETWORK))
    }

    #[tokio::test]
    async fn test_sends_getaddr_on_start() {
        let (channel, mut remote) = channel_pair(test_options());
        channel.start();
        AddressProtocol::new(channel, scratch_hosts(), test_settings()).start();

        remote
            .expect(|m| matches!(m, NetworkMessage::GetAddr).then_some(()))
            .await;
    }

    #[tokio::test]
    async fn test_disabled_pool_suppresses_getaddr() {
        let (channel, mut remote) = channel_pair(test_options());
        channel.start();

        let mut settings = Settings::default();
        settings.host_pool_capacity = 0;
        AddressProtocol::new(channel.clone(), scratch_hosts(), Arc::new(settings)).start();

        // Nothing should arrive; give the task a moment to prove it.
        channel.send(NetworkMessage::Ping(1)).await.unwrap();
        let first = remote.receive().await.unwrap();
        assert!(matches!(first, NetworkMessage::Ping(1)));
    }

    #[tokio::test]
    async fn test_stores_received_addresses() {
        let (channel, mut remote) = channel_pair(test_options());
        channel.start();
        let hosts = scratch_hosts();
        AddressProtocol::new(channel, hosts.clone(), test_settings()).start();

        remote
            .send(NetworkMessage::Addr(vec![addr_entry(1), addr_entry(2)]))
            .await;

        tokio::time::timeout(Duration::from_secs(1), async {
            while hosts.count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("addresses should reach the pool");
        assert!(hosts.contains(&"10.9.9.1:8333".parse().unwrap()));
    }

    #[tokio::test]
    async fn test_drops_oversized_addr_burst() {
        let (channel, mut remote) = channel_pair(test_options());
        channel.start();
        let hosts = scratch_hosts();
        AddressProtocol::new(channel.clone(), hosts.clone(), test_settings()).start();

        let authority: Authority = "10.9.9.1:8333".parse().unwrap();
        let oversized: Vec<(u32, bitcoin::p2p::Address)> = (0..=MAX_ADDRESS_COUNT)
            .map(|_| (0, authority.to_network_address(ServiceFlags::NONE)))
            .collect();
        remote.send(NetworkMessage::Addr(oversized)).await;

        // A follow-up legitimate burst still lands, the oversized one never does.
        remote.send(NetworkMessage::Addr(vec![addr_entry(2)])).await;
        tokio::time::timeout(Duration::from_secs(1), async {
            while !hosts.contains(&"10.9.9.2:8333".parse().unwrap()) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("follow-up addresses should reach the pool");
        assert!(!hosts.contains(&authority));
    }

    #[tokio::test]
    async fn test_answers_getaddr_with_sample() {
        let (channel, mut remote) = channel_pair(test_options());
        channel.start();
        let hosts = scratch_hosts();
        hosts.store_many((1..=5).map(|i| format!("10.9.9.{i}:8333").parse().unwrap()));
        AddressProtocol::new(channel, hosts, test_settings()).start();

        remote.send(NetworkMessage::GetAddr).await;
        let entries = remote
            .expect(|m| match m {
                NetworkMessage::Addr(entries) => Some(entries.clone()),
                _ => None,
            })
            .await;
        assert_eq!(entries.len(), 5);
        assert!(entries
            .iter()
            .all(|(_, address)| address.services == ServiceFlags::NONE));
    }
}
