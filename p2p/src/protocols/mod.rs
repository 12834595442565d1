//! Per-channel protocol state machines.
//!
//! Each protocol attaches to one [`Channel`]: it subscribes to the commands
//! it handles, bridges deliveries into its own task, and winds down when the
//! channel stops. The session layer decides which protocols a channel gets
//! and in which order; the version handshake always runs first.

mod address;
mod ping;
mod version;

pub use address::AddressProtocol;
pub use ping::PingProtocol;
pub use version::VersionProtocol;

use bitcoin::p2p::message::NetworkMessage;
use bitcoin_network_channel::{Channel, Error};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::mpsc;

/// Lowest protocol version this implementation speaks.
pub const PROTOCOL_VERSION_FLOOR: u32 = 31402;
/// Highest protocol version this implementation speaks.
pub const PROTOCOL_VERSION_CEILING: u32 = 70015;
/// First protocol version carrying ping nonces and pong replies (BIP 31).
pub const BIP31_VERSION: u32 = 60001;
/// First protocol version understanding reject messages (BIP 61).
pub const BIP61_VERSION: u32 = 70002;

/// Wall-clock seconds since the epoch, unsigned.
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system time is before the unix epoch")
        .as_secs()
}

/// Bridge a channel subscription into a stream.
///
/// The returned receiver yields each delivery for `command` and finally the
/// channel's stop code. Dropping the receiver unsubscribes on the next
/// delivery.
pub(crate) fn subscribe(
    channel: &Channel,
    command: &str,
) -> mpsc::UnboundedReceiver<Result<NetworkMessage, Error>> {
    let (tx, rx) = mpsc::unbounded_channel();
    channel.subscribe(
        command,
        Box::new(move |event| {
            let owned = match event {
                Ok(message) => Ok(message.clone()),
                Err(code) => Err(code),
            };
            tx.send(owned).is_ok()
        }),
    );
    rx
}

#[cfg(test)]
pub(crate) mod testing {
    //! Shared scaffolding for protocol tests: a channel whose remote side is
    //! a scripted transport over an in-memory duplex stream.

    use bitcoin::p2p::message::NetworkMessage;
    use bitcoin::p2p::Magic;
    use bitcoin_network_channel::{
        Authority, Channel, ChannelOptions, Error, Socket, TransportReader, TransportWriter,
    };
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::{ReadHalf, WriteHalf};

    /// The scripted remote end of a test channel.
    pub struct RemotePeer {
        pub reader: TransportReader<ReadHalf<tokio::io::DuplexStream>>,
        pub writer: TransportWriter<WriteHalf<tokio::io::DuplexStream>>,
    }

    impl RemotePeer {
        pub async fn send(&mut self, message: NetworkMessage) {
            self.writer.write(message).await.expect("remote write");
        }

        pub async fn receive(&mut self) -> Result<NetworkMessage, Error> {
            self.reader.read().await
        }

        /// Read frames until one matches `accept`, failing the test if the
        /// stream ends first.
        pub async fn expect<T>(&mut self, accept: impl Fn(&NetworkMessage) -> Option<T>) -> T {
            loop {
                let message = self.receive().await.expect("remote read");
                if let Some(found) = accept(&message) {
                    return found;
                }
            }
        }
    }

    pub fn test_authority() -> Authority {
        "10.1.1.1:8333".parse().unwrap()
    }

    /// A channel wired to a scripted remote peer over an in-memory stream.
    pub fn channel_pair(options: ChannelOptions) -> (Arc<Channel>, RemotePeer) {
        let magic = options.magic;
        let (near, far) = tokio::io::duplex(256 * 1024);
        let (near_read, near_write) = tokio::io::split(near);
        let (far_read, far_write) = tokio::io::split(far);

        let socket = Socket::from_parts(test_authority(), near_read, near_write);
        let channel = Channel::new(socket, options);
        let remote = RemotePeer {
            reader: TransportReader::new(magic, far_read),
            writer: TransportWriter::new(magic, far_write),
        };
        (channel, remote)
    }

    pub fn test_options() -> ChannelOptions {
        ChannelOptions {
            magic: Magic::BITCOIN,
            protocol_minimum: 31402,
            inactivity: Duration::from_secs(60),
            expiration: Duration::from_secs(120),
        }
    }
}
