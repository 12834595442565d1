//! The manual-connection session.

use super::Session;
use bitcoin_network_channel::{Authority, Error};
use log::{debug, info, warn};

/// Maintains a connection to each explicitly configured endpoint.
///
/// One supervisor task per endpoint: connect, attach protocols, and when the
/// channel stops reconnect after the connect timeout, until the session
/// stops or the attempt limit is reached (zero retries forever).
pub(crate) struct ManualSession {
    session: Session,
}

impl ManualSession {
    pub fn new(session: Session) -> Self {
        ManualSession { session }
    }

    /// Spawn a supervisor for every configured endpoint.
    pub fn start(&self) {
        for peer in self.session.settings.peers.clone() {
            self.connect(peer);
        }
    }

    /// Spawn a supervisor for `authority`.
    pub fn connect(&self, authority: Authority) {
        let session = self.session.clone();
        tokio::spawn(async move { supervise(session, authority).await });
    }
}

/// Keep one endpoint connected until the session stops.
async fn supervise(session: Session, authority: Authority) {
    let limit = session.settings.manual_attempt_limit;
    let mut attempts = 0u32;

    while !session.stop.fired() {
        match session.establish(&authority).await {
            Ok(channel) => {
                attempts = 0;
                if session.register(&channel).is_ok() {
                    info!("manual connection to {authority} established");
                    tokio::select! {
                        code = channel.wait_stop() => {
                            debug!("manual connection to {authority} dropped: {code}");
                        }
                        _ = session.stop.wait() => {
                            channel.stop(Error::ServiceStopped);
                            break;
                        }
                    }
                }
            }
            Err(Error::ServiceStopped) => break,
            Err(code) => {
                attempts += 1;
                debug!("manual connection to {authority} failed: {code}");
                if limit > 0 && attempts >= limit {
                    warn!("giving up on manual endpoint {authority} after {attempts} attempts");
                    break;
                }
            }
        }

        if !session.pause(session.settings.connect_timeout).await {
            break;
        }
    }
}
