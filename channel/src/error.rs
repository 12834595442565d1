//! Error codes shared across the network stack.

use std::error;
use std::fmt;
use std::io;

/// Errors produced by channels, sessions, and the collections they share.
///
/// A single code travels through every layer: a failed read stops its channel
/// and the same code is fanned out to each of the channel's subscribers, so
/// the type stays cheap to clone and compare.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// The owning service received its stop signal before the operation completed.
    ServiceStopped,
    /// A local operation failed for a reason the caller cannot retry around.
    OperationFailed,
    /// The endpoint could not be resolved to a connectable address.
    ResolveFailed,
    /// The network path to the endpoint is unreachable.
    NetworkUnreachable,
    /// The listen address is already bound by another process.
    AddressInUse,
    /// An incoming connection was rejected or the accept primitive failed.
    AcceptFailed,
    /// The byte stream violated the wire protocol (bad checksum or malformed payload).
    BadStream,
    /// A frame arrived carrying a foreign network magic.
    BadMagic,
    /// A frame declared a payload larger than the protocol ceiling.
    Oversize,
    /// A channel deadline (handshake, inactivity, expiration, or heartbeat) elapsed.
    ChannelTimeout,
    /// The channel was stopped before or during the operation.
    ChannelStopped,
    /// The channel's transport failed with the contained I/O error kind.
    ChannelTransport(io::ErrorKind),
    /// The requested entry does not exist.
    NotFound,
    /// A file system operation failed with the contained I/O error kind.
    FileSystem(io::ErrorKind),
    /// Seeding finished without discovering any peer addresses.
    SeedingUnsuccessful,
    /// The text does not parse as a peer endpoint.
    InvalidAuthority,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::ServiceStopped => write!(f, "service stopped"),
            Error::OperationFailed => write!(f, "operation failed"),
            Error::ResolveFailed => write!(f, "failed to resolve endpoint"),
            Error::NetworkUnreachable => write!(f, "network unreachable"),
            Error::AddressInUse => write!(f, "address already in use"),
            Error::AcceptFailed => write!(f, "incoming connection rejected"),
            Error::BadStream => write!(f, "malformed message stream"),
            Error::BadMagic => write!(f, "frame carries foreign network magic"),
            Error::Oversize => write!(f, "frame payload exceeds protocol ceiling"),
            Error::ChannelTimeout => write!(f, "channel deadline elapsed"),
            Error::ChannelStopped => write!(f, "channel stopped"),
            Error::ChannelTransport(kind) => write!(f, "channel transport failed: {kind}"),
            Error::NotFound => write!(f, "entry not found"),
            Error::FileSystem(kind) => write!(f, "file system operation failed: {kind}"),
            Error::SeedingUnsuccessful => write!(f, "seeding discovered no peer addresses"),
            Error::InvalidAuthority => write!(f, "invalid peer endpoint"),
        }
    }
}

impl error::Error for Error {}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::AddrInUse => Error::AddressInUse,
            io::ErrorKind::NetworkUnreachable => Error::NetworkUnreachable,
            io::ErrorKind::TimedOut => Error::ChannelTimeout,
            kind => Error::ChannelTransport(kind),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_io_error_mapping() {
        let in_use = io::Error::new(io::ErrorKind::AddrInUse, "bound");
        assert_eq!(Error::from(in_use), Error::AddressInUse);

        let timed_out = io::Error::new(io::ErrorKind::TimedOut, "slow");
        assert_eq!(Error::from(timed_out), Error::ChannelTimeout);

        let refused = io::Error::new(io::ErrorKind::ConnectionRefused, "closed");
        assert_eq!(
            Error::from(refused),
            Error::ChannelTransport(io::ErrorKind::ConnectionRefused)
        );
    }

    #[test]
    fn test_display_is_stable() {
        assert_eq!(Error::ChannelStopped.to_string(), "channel stopped");
        assert_eq!(
            Error::ChannelTransport(io::ErrorKind::BrokenPipe).to_string(),
            "channel transport failed: broken pipe"
        );
    }
}
