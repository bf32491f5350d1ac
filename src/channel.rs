//! Length-prefixed framing over one byte stream.
//!
//! ## Wire Format
//!
//! ```text
//! +--------+----------------------+------------------+
//! | opcode |  length (u32, BE)    |  payload bytes   |
//! | 1 byte |  4 bytes             |  length bytes    |
//! +--------+----------------------+------------------+
//! ```
//!
//! There is no magic number, version or checksum. Writers are serialized by a
//! write lock held for the whole header + payload, so frames from concurrent
//! senders never interleave. Readers are serialized the same way even though
//! only one receive loop exists. Every read and write races the channel's
//! cancellation token and fails with [`LinkError::Cancelled`] when it fires.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::protocol::Message;
use crate::{LinkError, Result};

/// Size of the opcode + length header.
pub const HEADER_LEN: usize = 5;

/// Channel over the two halves of a TCP socket.
pub type TcpChannel = FramedChannel<OwnedReadHalf, OwnedWriteHalf>;

/// Encode a frame header.
pub fn encode_header(opcode: u8, len: u32) -> [u8; HEADER_LEN] {
    let len = len.to_be_bytes();
    [opcode, len[0], len[1], len[2], len[3]]
}

/// Decode a frame header into `(opcode, payload length)`.
pub fn decode_header(header: &[u8; HEADER_LEN]) -> (u8, u32) {
    (header[0], u32::from_be_bytes([header[1], header[2], header[3], header[4]]))
}

/// Message framing over a split reader/writer pair.
pub struct FramedChannel<R, W> {
    reader: Mutex<R>,
    writer: Mutex<W>,
    cancel: CancellationToken,
    max_payload_len: usize,
}

impl TcpChannel {
    /// Wrap a connected socket.
    pub fn from_tcp(stream: TcpStream, cancel: CancellationToken, max_payload_len: u32) -> Self {
        // Small control frames; don't let Nagle hold them back.
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Failed to disable Nagle on studio socket: {}", e);
        }
        let (reader, writer) = stream.into_split();
        Self::new(reader, writer, cancel, max_payload_len)
    }
}

impl<R, W> FramedChannel<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W, cancel: CancellationToken, max_payload_len: u32) -> Self {
        Self {
            reader: Mutex::new(reader),
            writer: Mutex::new(writer),
            cancel,
            max_payload_len: max_payload_len as usize,
        }
    }

    /// The token that aborts this channel's I/O.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Write one frame.
    pub async fn send(&self, opcode: u8, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| LinkError::PayloadTooLarge { len: payload.len(), max: u32::MAX as usize })?;
        let header = encode_header(opcode, len);

        let mut writer = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(LinkError::Cancelled),
            guard = self.writer.lock() => guard,
        };

        let write = async {
            writer.write_all(&header).await?;
            writer.write_all(payload).await?;
            writer.flush().await
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(LinkError::Cancelled),
            result = write => {
                result.map_err(|e| LinkError::transport("send", e))?;
                trace!("Sent frame: opcode={}, len={}", opcode, len);
                Ok(())
            }
        }
    }

    /// Send a [`Message`].
    pub async fn send_message(&self, message: &Message) -> Result<()> {
        self.send(message.opcode, &message.payload).await
    }

    /// Read one complete frame.
    ///
    /// Returns [`LinkError::ConnectionClosed`] if the stream ends anywhere
    /// inside a frame; a truncated message is never returned.
    pub async fn receive(&self) -> Result<Message> {
        let mut reader = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => return Err(LinkError::Cancelled),
            guard = self.reader.lock() => guard,
        };

        let mut header = [0u8; HEADER_LEN];
        read_exact(&mut *reader, &mut header, &self.cancel).await?;
        let (opcode, len) = decode_header(&header);

        let len = len as usize;
        if len > self.max_payload_len {
            return Err(LinkError::PayloadTooLarge { len, max: self.max_payload_len });
        }

        let mut payload = vec![0u8; len];
        read_exact(&mut *reader, &mut payload, &self.cancel).await?;

        trace!("Received frame: opcode={}, len={}", opcode, len);
        Ok(Message { opcode, payload })
    }
}

/// Fill `buf` completely; a zero-byte read before that is a premature close.
async fn read_exact<R>(reader: &mut R, buf: &mut [u8], cancel: &CancellationToken) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut filled = 0;
    while filled < buf.len() {
        let read = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(LinkError::Cancelled),
            read = reader.read(&mut buf[filled..]) => read,
        };

        match read {
            Ok(0) => {
                return Err(LinkError::ConnectionClosed { expected: buf.len(), received: filled });
            }
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(LinkError::transport("receive", e)),
        }
    }
    Ok(())
}
