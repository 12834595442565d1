//! Owning transport sockets and write serialization.

use crate::authority::Authority;
use crate::error::Error;
use crate::transport::TransportWriter;
use bitcoin::p2p::message::NetworkMessage;
use bitcoin::p2p::Magic;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

/// The reading half of a socket, type-erased so tests can substitute
/// in-memory streams for TCP.
pub type SocketReader = Box<dyn AsyncRead + Send + Unpin>;
/// The writing half of a socket.
pub type SocketWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// An owning wrapper over a transport connection.
///
/// Carries the remote authority alongside the split read and write halves.
/// Produced by the acceptor and connector, consumed by
/// [`Channel::new`](crate::Channel::new).
pub struct Socket {
    authority: Authority,
    reader: SocketReader,
    writer: SocketWriter,
}

impl Socket {
    /// Wrap an established TCP stream.
    ///
    /// Disables Nagle's algorithm: the protocol exchanges many small messages
    /// where latency matters more than bandwidth.
    pub fn new(stream: TcpStream, authority: Authority) -> Result<Self, Error> {
        stream.set_nodelay(true).map_err(Error::from)?;
        let (reader, writer) = stream.into_split();
        Ok(Socket {
            authority,
            reader: Box::new(reader),
            writer: Box::new(writer),
        })
    }

    /// Assemble a socket from arbitrary halves.
    pub fn from_parts(
        authority: Authority,
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
    ) -> Self {
        Socket {
            authority,
            reader: Box::new(reader),
            writer: Box::new(writer),
        }
    }

    /// The remote endpoint.
    pub fn authority(&self) -> &Authority {
        &self.authority
    }

    /// Split into the remote endpoint and the raw halves.
    pub fn into_parts(self) -> (Authority, SocketReader, SocketWriter) {
        (self.authority, self.reader, self.writer)
    }
}

impl std::fmt::Debug for Socket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Socket")
            .field("authority", &self.authority)
            .finish_non_exhaustive()
    }
}

/// A framed writer behind a mutex.
///
/// Many protocols share one channel; the lock makes each frame atomic on the
/// wire even when sends race across tasks.
pub struct LockedSocket {
    writer: Mutex<TransportWriter<SocketWriter>>,
}

impl LockedSocket {
    /// Wrap a writing half with the framing for `magic`.
    pub fn new(magic: Magic, writer: SocketWriter) -> Self {
        LockedSocket {
            writer: Mutex::new(TransportWriter::new(magic, writer)),
        }
    }

    /// Acquire the write lock, frame `message`, and submit it.
    ///
    /// The future resolves once the bytes have been handed to the transport.
    pub async fn send(&self, message: NetworkMessage) -> Result<(), Error> {
        self.writer.lock().await.write(message).await
    }

    /// Shut down the writing half, signalling end of stream to the peer.
    pub async fn close(&self) {
        self.writer.lock().await.shutdown().await;
    }
}

impl std::fmt::Debug for LockedSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockedSocket").finish_non_exhaustive()
    }
}
