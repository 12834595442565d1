//! Inbound channel factory.

use crate::authority::Authority;
use crate::channel::{Channel, ChannelOptions};
use crate::error::Error;
use crate::socket::Socket;
use crate::stop::StopToken;
use log::debug;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

/// Produces channels from a bound listener.
///
/// The listener is released when the acceptor drops. Pending accepts resolve
/// with [`Error::ServiceStopped`] once the stop token fires.
#[derive(Debug)]
pub struct Acceptor {
    listener: TcpListener,
    options: ChannelOptions,
    stop: StopToken,
}

impl Acceptor {
    /// Bind a listener on `address`.
    ///
    /// # Errors
    ///
    /// * [`Error::AddressInUse`] - another process owns the address.
    /// * [`Error::ChannelTransport`] - any other bind failure.
    pub async fn bind(
        address: SocketAddr,
        options: ChannelOptions,
        stop: StopToken,
    ) -> Result<Self, Error> {
        let listener = TcpListener::bind(address).await.map_err(Error::from)?;
        Ok(Acceptor {
            listener,
            options,
            stop,
        })
    }

    /// The address the listener is bound to; reports the ephemeral port when
    /// the caller bound port zero.
    pub fn local_addr(&self) -> Result<SocketAddr, Error> {
        self.listener.local_addr().map_err(Error::from)
    }

    /// Wait for the next incoming connection and wrap it in a channel.
    ///
    /// The returned channel's reader task is not yet running; subscribe
    /// handlers and call [`Channel::start`].
    pub async fn accept(&self) -> Result<Arc<Channel>, Error> {
        tokio::select! {
            incoming = self.listener.accept() => {
                let (stream, address) = incoming.map_err(|e: io::Error| {
                    debug!("accept failed: {e}");
                    Error::AcceptFailed
                })?;
                let socket = Socket::new(stream, Authority::from(address))?;
                Ok(Channel::new(socket, self.options.clone()))
            }
            _ = self.stop.wait() => Err(Error::ServiceStopped),
        }
    }
}
