//! The outbound-connection session.

use super::Session;
use bitcoin_network_channel::{Authority, Channel, Error};
use log::debug;
use std::sync::Arc;
use tokio::task::JoinSet;

/// Keeps a fixed number of outbound connection slots filled from the hosts
/// pool.
///
/// Each slot loops: draw candidate endpoints, race a batch of simultaneous
/// connect attempts, keep the first channel whose handshake completes, and
/// go around again when that channel dies.
pub(crate) struct OutboundSession {
    session: Session,
}

impl OutboundSession {
    pub fn new(session: Session) -> Self {
        OutboundSession { session }
    }

    /// Spawn one task per configured outbound slot.
    pub fn start(&self) {
        let slots = self.session.settings.outbound_connections;
        if slots == 0 {
            debug!("outbound session disabled");
            return;
        }
        for slot in 0..slots {
            let session = self.session.clone();
            tokio::spawn(async move { run_slot(session, slot).await });
        }
    }
}

/// Keep one outbound slot filled until the session stops.
async fn run_slot(session: Session, slot: u32) {
    while !session.stop.fired() {
        let candidates = draw_candidates(&session);
        if candidates.is_empty() {
            if !session.pause(session.settings.channel_poll).await {
                break;
            }
            continue;
        }

        match connect_batch(&session, candidates).await {
            Ok(channel) => {
                if session.register(&channel).is_err() {
                    continue;
                }
                debug!("outbound slot {slot} connected to {}", channel.authority());
                tokio::select! {
                    code = channel.wait_stop() => {
                        debug!("outbound slot {slot} lost {}: {code}", channel.authority());
                    }
                    _ = session.stop.wait() => {
                        channel.stop(Error::ServiceStopped);
                        break;
                    }
                }
            }
            Err(Error::ServiceStopped) => break,
            Err(_) => {
                if !session.pause(session.settings.channel_poll).await {
                    break;
                }
            }
        }
    }
}

/// Draw up to a batch of distinct, eligible endpoints from the hosts pool.
fn draw_candidates(session: &Session) -> Vec<Authority> {
    let batch = session.settings.connect_batch_size.max(1) as usize;
    let mut candidates: Vec<Authority> = Vec::with_capacity(batch);

    // The pool hands out pseudo-random entries; a bounded number of draws
    // keeps the loop finite when most of the pool is ineligible.
    for _ in 0..batch * 8 {
        if candidates.len() == batch {
            break;
        }
        let authority = match session.hosts.fetch() {
            Ok(authority) => authority,
            Err(_) => break,
        };
        if candidates.contains(&authority) {
            continue;
        }
        if session.settings.is_self(&authority)
            || session.settings.is_blacklisted(&authority)
            || session.pending_sockets.contains(&authority)
            || session.pending_channels.contains_authority(&authority)
            || session.connections.exists(&authority)
        {
            continue;
        }
        candidates.push(authority);
    }
    candidates
}

/// Race connect attempts; the first completed handshake wins and the losers
/// are stopped.
async fn connect_batch(
    session: &Session,
    candidates: Vec<Authority>,
) -> Result<Arc<Channel>, Error> {
    let mut race: JoinSet<Result<Arc<Channel>, Error>> = JoinSet::new();
    for authority in candidates {
        let session = session.clone();
        race.spawn(async move { session.establish(&authority).await });
    }

    let mut winner: Option<Arc<Channel>> = None;
    while let Some(joined) = race.join_next().await {
        match joined {
            Ok(Ok(channel)) => {
                winner = Some(channel);
                break;
            }
            Ok(Err(_)) | Err(_) => continue,
        }
    }

    // Losers still dialing are aborted; the drop guards stop any channel a
    // loser already produced. A loser that finished its handshake first is
    // stopped here.
    race.abort_all();
    while let Some(joined) = race.join_next().await {
        if let Ok(Ok(channel)) = joined {
            channel.stop(Error::ServiceStopped);
        }
    }

    match winner {
        Some(channel) => Ok(channel),
        None if session.stop.fired() => Err(Error::ServiceStopped),
        None => Err(Error::OperationFailed),
    }
}
