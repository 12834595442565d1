//! The inbound-connection session.

use super::Session;
use bitcoin_network_channel::{Acceptor, Error};
use log::{debug, info};
use std::net::SocketAddr;

/// Accepts connections from remote peers.
///
/// Oversubscribed accepts, blacklisted addresses, and remotes that already
/// have a live channel are dropped before any handshake work.
pub(crate) struct InboundSession {
    session: Session,
}

impl InboundSession {
    pub fn new(session: Session) -> Self {
        InboundSession { session }
    }

    /// Bind the listener and spawn the accept loop.
    ///
    /// Returns the bound address, or `None` when inbound connections are
    /// disabled. A bind failure (typically [`Error::AddressInUse`]) aborts
    /// the start.
    pub async fn start(&self) -> Result<Option<SocketAddr>, Error> {
        if self.session.settings.inbound_connections == 0 {
            debug!("inbound session disabled");
            return Ok(None);
        }

        let acceptor = Acceptor::bind(
            self.session.settings.bind_address(),
            self.session.settings.channel_options(),
            self.session.stop.clone(),
        )
        .await?;
        let bound = acceptor.local_addr()?;
        info!("accepting inbound connections on {bound}");

        let session = self.session.clone();
        tokio::spawn(async move { accept_loop(session, acceptor).await });
        Ok(Some(bound))
    }
}

/// Accept until the session stops. The listener is released on exit.
async fn accept_loop(session: Session, acceptor: Acceptor) {
    loop {
        let channel = match acceptor.accept().await {
            Ok(channel) => channel,
            Err(Error::ServiceStopped) => break,
            Err(code) => {
                debug!("accept failed: {code}");
                continue;
            }
        };

        let authority = *channel.authority();
        let limit = session.settings.inbound_connections as usize;

        if session.settings.is_blacklisted(&authority) {
            debug!("dropping blacklisted inbound {authority}");
            channel.stop(Error::AcceptFailed);
            continue;
        }
        if session.connections.count() >= limit {
            debug!("dropping oversubscribed inbound {authority}");
            channel.stop(Error::AcceptFailed);
            continue;
        }
        if session.connections.exists_address(&authority)
            || session.pending_channels.contains_authority(&authority)
        {
            debug!("dropping duplicate inbound {authority}");
            channel.stop(Error::AcceptFailed);
            continue;
        }

        let session = session.clone();
        tokio::spawn(async move {
            if let Err(code) = session.handshake(&channel).await {
                debug!("inbound handshake with {authority} failed: {code}");
                return;
            }
            if session.register(&channel).is_ok() {
                debug!("inbound connection from {authority} established");
            }
        });
    }
}
