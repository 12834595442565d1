//! The seeding session.

use super::Session;
use crate::protocols::AddressProtocol;
use bitcoin::p2p::ServiceFlags;
use bitcoin_network_channel::{Authority, Error};
use log::{debug, info, warn};
use tokio::task::JoinSet;

/// Fills an empty hosts pool from the configured seed endpoints.
///
/// Each seed is contacted concurrently: handshake, ask for addresses, collect
/// replies for the germination window, stop the channel. Seed channels are
/// never registered among the live connections. The session succeeds when
/// the pool ends non-empty.
pub(crate) struct SeedSession {
    session: Session,
}

impl SeedSession {
    pub fn new(session: Session) -> Self {
        SeedSession { session }
    }

    /// Run the seeding campaign to completion.
    ///
    /// Completes immediately when seeding has nothing to do: no outbound
    /// slots to feed, a disabled pool, or a pool already at capacity.
    pub async fn start(&self) -> Result<(), Error> {
        let settings = &self.session.settings;
        if settings.outbound_connections == 0 || settings.host_pool_capacity == 0 {
            debug!("seeding skipped, no outbound connections to feed");
            return Ok(());
        }
        if self.session.hosts.count() >= settings.host_pool_capacity {
            debug!("seeding skipped, hosts pool already full");
            return Ok(());
        }
        if settings.seeds.is_empty() && self.session.hosts.count() == 0 {
            warn!("hosts pool is empty and no seeds are configured");
            return Err(Error::SeedingUnsuccessful);
        }

        let mut campaign = JoinSet::new();
        for seed in settings.seeds.clone() {
            let session = self.session.clone();
            campaign.spawn(async move { contact(session, seed).await });
        }
        while campaign.join_next().await.is_some() {}

        let count = self.session.hosts.count();
        if count == 0 {
            warn!("seeding discovered no addresses");
            return Err(Error::SeedingUnsuccessful);
        }
        info!("seeding finished with {count} hosts");
        Ok(())
    }
}

/// Contact one seed and germinate until the window closes.
async fn contact(session: Session, seed: Authority) {
    let channel = match session.connect_channel(&seed).await {
        Ok(channel) => channel,
        Err(code) => {
            debug!("seed {seed} unreachable: {code}");
            return;
        }
    };

    // A seed only has to gossip addresses, so no services are required.
    if let Err(code) = session
        .handshake_with(&channel, session.settings.protocol_minimum, ServiceFlags::NONE)
        .await
    {
        debug!("seed {seed} handshake failed: {code}");
        return;
    }

    AddressProtocol::new(
        channel.clone(),
        session.hosts.clone(),
        session.settings.clone(),
    )
    .start();

    tokio::select! {
        _ = tokio::time::sleep(session.settings.channel_germination) => {
            debug!("seed {seed} germination window closed");
        }
        code = channel.wait_stop() => {
            debug!("seed {seed} dropped early: {code}");
        }
        _ = session.stop.wait() => {}
    }
    channel.stop(Error::ServiceStopped);
}
