//! Framed message transport.
//!
//! Implements the plaintext bitcoin wire framing: a 24-byte header (magic,
//! null-padded command, payload length, checksum) followed by the payload.
//! Serialization of the payload itself is delegated to [`bitcoin`]'s
//! consensus codec.

use crate::error::Error;
use bitcoin::consensus::encode;
use bitcoin::p2p::message::{NetworkMessage, RawNetworkMessage};
use bitcoin::p2p::Magic;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Size of a bitcoin message header in bytes.
const HEADER_SIZE: usize = 24;
/// Offset in the header where the payload length is stored.
const PAYLOAD_LENGTH_OFFSET: usize = 16;

/// Hard cap on a frame's declared payload length.
///
/// Matches Bitcoin Core's protocol message ceiling. A frame declaring more is
/// rejected before any payload allocation takes place.
pub const MAX_PAYLOAD_SIZE: usize = 4 * 1024 * 1024;

/// State machine for [`TransportReader::read`].
///
/// Progress is tracked across interruptions so the read method is safe to use
/// inside `tokio::select!`: a cancelled read resumes exactly where it left
/// off without losing partially read bytes.
#[derive(Debug)]
enum ReceiveState {
    /// Reading the 24-byte message header.
    ReadingHeader {
        header: [u8; HEADER_SIZE],
        bytes_read: usize,
    },
    /// Reading the message payload into a buffer that already holds the header.
    ReadingPayload { buffer: Vec<u8>, bytes_read: usize },
}

impl ReceiveState {
    fn reading_header() -> Self {
        ReceiveState::ReadingHeader {
            header: [0u8; HEADER_SIZE],
            bytes_read: 0,
        }
    }

    fn reading_payload(header: [u8; HEADER_SIZE], payload_len: usize) -> Self {
        let mut buffer = Vec::with_capacity(HEADER_SIZE + payload_len);
        buffer.extend_from_slice(&header);
        buffer.resize(HEADER_SIZE + payload_len, 0);

        ReceiveState::ReadingPayload {
            buffer,
            bytes_read: HEADER_SIZE,
        }
    }
}

/// The reading half of a framed transport.
#[derive(Debug)]
pub struct TransportReader<R> {
    magic: Magic,
    state: ReceiveState,
    reader: R,
}

impl<R> TransportReader<R>
where
    R: AsyncRead + Unpin + Send,
{
    /// Create a reader expecting frames stamped with `magic`.
    pub fn new(magic: Magic, reader: R) -> Self {
        Self {
            magic,
            state: ReceiveState::reading_header(),
            reader,
        }
    }

    /// Read the next message frame.
    ///
    /// Cancellation safe: partially read frames resume on the next call.
    ///
    /// # Errors
    ///
    /// * [`Error::BadMagic`] - the frame is stamped with a foreign magic.
    /// * [`Error::Oversize`] - the declared payload exceeds [`MAX_PAYLOAD_SIZE`].
    /// * [`Error::BadStream`] - the payload fails checksum or deserialization.
    /// * [`Error::ChannelTransport`] - the underlying reader failed.
    pub async fn read(&mut self) -> Result<NetworkMessage, Error> {
        loop {
            match &mut self.state {
                ReceiveState::ReadingHeader { header, bytes_read } => {
                    while *bytes_read < HEADER_SIZE {
                        let n = self
                            .reader
                            .read(&mut header[*bytes_read..])
                            .await
                            .map_err(|e| Error::ChannelTransport(e.kind()))?;
                        if n == 0 {
                            return Err(Error::ChannelTransport(
                                std::io::ErrorKind::UnexpectedEof,
                            ));
                        }
                        *bytes_read += n;
                    }

                    if header[..4] != self.magic.to_bytes() {
                        return Err(Error::BadMagic);
                    }

                    let payload_len = u32::from_le_bytes([
                        header[PAYLOAD_LENGTH_OFFSET],
                        header[PAYLOAD_LENGTH_OFFSET + 1],
                        header[PAYLOAD_LENGTH_OFFSET + 2],
                        header[PAYLOAD_LENGTH_OFFSET + 3],
                    ]) as usize;

                    if payload_len > MAX_PAYLOAD_SIZE {
                        return Err(Error::Oversize);
                    }

                    self.state = ReceiveState::reading_payload(*header, payload_len);
                }

                ReceiveState::ReadingPayload { buffer, bytes_read } => {
                    while *bytes_read < buffer.len() {
                        let n = self
                            .reader
                            .read(&mut buffer[*bytes_read..])
                            .await
                            .map_err(|e| Error::ChannelTransport(e.kind()))?;
                        if n == 0 {
                            return Err(Error::ChannelTransport(
                                std::io::ErrorKind::UnexpectedEof,
                            ));
                        }
                        *bytes_read += n;
                    }

                    // Checksum validation happens inside the consensus decode.
                    let raw: RawNetworkMessage =
                        encode::deserialize(buffer).map_err(|_| Error::BadStream)?;

                    self.state = ReceiveState::reading_header();
                    return Ok(raw.payload().clone());
                }
            }
        }
    }
}

/// The writing half of a framed transport.
#[derive(Debug)]
pub struct TransportWriter<W> {
    magic: Magic,
    writer: W,
}

impl<W> TransportWriter<W>
where
    W: AsyncWrite + Unpin + Send,
{
    /// Create a writer stamping frames with `magic`.
    pub fn new(magic: Magic, writer: W) -> Self {
        Self { magic, writer }
    }

    /// Frame and write a message, flushing the underlying writer.
    pub async fn write(&mut self, message: NetworkMessage) -> Result<(), Error> {
        let raw = RawNetworkMessage::new(self.magic, message);
        let data = encode::serialize(&raw);

        self.writer
            .write_all(&data)
            .await
            .map_err(|e| Error::ChannelTransport(e.kind()))?;
        self.writer
            .flush()
            .await
            .map_err(|e| Error::ChannelTransport(e.kind()))?;
        Ok(())
    }

    /// Shut down the underlying writer, signalling end of stream to the peer.
    pub async fn shutdown(&mut self) {
        let _ = self.writer.shutdown().await;
    }
}
