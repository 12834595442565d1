//! Outbound channel factory.

use crate::authority::Authority;
use crate::channel::{Channel, ChannelOptions};
use crate::error::Error;
use crate::socket::Socket;
use crate::stop::StopToken;
use log::debug;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

/// Produces channels from connect primitives.
///
/// Each connect attempt is bounded by the configured timeout and observes the
/// stop token: once the token fires, pending attempts resolve with
/// [`Error::ServiceStopped`].
#[derive(Debug, Clone)]
pub struct Connector {
    options: ChannelOptions,
    connect_timeout: Duration,
    stop: StopToken,
}

impl Connector {
    /// Create a connector producing channels with `options`.
    pub fn new(options: ChannelOptions, connect_timeout: Duration, stop: StopToken) -> Self {
        Connector {
            options,
            connect_timeout,
            stop,
        }
    }

    /// Open a connection to `authority` and wrap it in a channel.
    ///
    /// The returned channel's reader task is not yet running; subscribe
    /// handlers and call [`Channel::start`].
    ///
    /// # Errors
    ///
    /// * [`Error::ResolveFailed`] - the authority has no connectable port.
    /// * [`Error::ChannelTimeout`] - the attempt outlived the connect timeout.
    /// * [`Error::ServiceStopped`] - the stop token fired first.
    /// * [`Error::NetworkUnreachable`] / [`Error::ChannelTransport`] - the
    ///   connect primitive failed.
    pub async fn connect(&self, authority: &Authority) -> Result<Arc<Channel>, Error> {
        if self.stop.fired() {
            return Err(Error::ServiceStopped);
        }
        if authority.port() == 0 {
            return Err(Error::ResolveFailed);
        }

        let address = authority.to_socket_addr();
        let stream = tokio::select! {
            attempt = timeout(self.connect_timeout, TcpStream::connect(address)) => {
                match attempt {
                    Ok(Ok(stream)) => stream,
                    Ok(Err(e)) => {
                        debug!("connect to {authority} failed: {e}");
                        return Err(map_connect_error(e));
                    }
                    Err(_) => {
                        debug!("connect to {authority} timed out");
                        return Err(Error::ChannelTimeout);
                    }
                }
            }
            _ = self.stop.wait() => return Err(Error::ServiceStopped),
        };

        let socket = Socket::new(stream, *authority)?;
        Ok(Channel::new(socket, self.options.clone()))
    }
}

fn map_connect_error(err: io::Error) -> Error {
    match err.kind() {
        io::ErrorKind::NetworkUnreachable | io::ErrorKind::HostUnreachable => {
            Error::NetworkUnreachable
        }
        io::ErrorKind::TimedOut => Error::ChannelTimeout,
        kind => Error::ChannelTransport(kind),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stop::StopSignal;
    use bitcoin::p2p::Magic;

    fn test_options() -> ChannelOptions {
        ChannelOptions {
            magic: Magic::BITCOIN,
            protocol_minimum: 31402,
            inactivity: Duration::from_secs(60),
            expiration: Duration::from_secs(120),
        }
    }

    #[tokio::test]
    async fn test_connect_to_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let authority = Authority::from(listener.local_addr().unwrap());

        let signal = StopSignal::new();
        let connector = Connector::new(test_options(), Duration::from_secs(5), signal.token());

        let accept = tokio::spawn(async move { listener.accept().await });
        let channel = connector.connect(&authority).await.unwrap();
        assert_eq!(channel.authority(), &authority);
        accept.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_connect_requires_a_port() {
        let signal = StopSignal::new();
        let connector = Connector::new(test_options(), Duration::from_secs(5), signal.token());
        let authority: Authority = "1.2.3.4".parse().unwrap();

        assert_eq!(
            connector.connect(&authority).await.err(),
            Some(Error::ResolveFailed)
        );
    }

    #[tokio::test]
    async fn test_connect_observes_stop() {
        let signal = StopSignal::new();
        let connector = Connector::new(test_options(), Duration::from_secs(5), signal.token());
        signal.fire();

        let authority: Authority = "1.2.3.4:8333".parse().unwrap();
        assert_eq!(
            connector.connect(&authority).await.err(),
            Some(Error::ServiceStopped)
        );
    }
}
