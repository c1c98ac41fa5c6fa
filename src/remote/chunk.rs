//! Chunk streams: bounded, ordered byte chunks closed by an explicit end marker.

use bytes::Bytes;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;
use crate::protocol::{Message, MessageKind, MAX_FRAME_SIZE};
use crate::transport::MsgChannel;

/// Default chunk size for environment archives, source and objects.
pub const DEFAULT_CHUNK_SIZE: usize = 100_000;

/// Largest chunk whose file-chunk frame still fits under [`MAX_FRAME_SIZE`].
pub const MAX_CHUNK_SIZE: usize = MAX_FRAME_SIZE - 4096;

#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("reading stream input: {0}")]
    Read(#[source] std::io::Error),

    #[error("writing stream output: {0}")]
    Write(#[source] std::io::Error),

    #[error(transparent)]
    Transport(#[from] ProtocolError),

    #[error("expected file chunk or end, got {}", .0.map_or("nothing", MessageKind::name))]
    Unexpected(Option<MessageKind>),
}

/// Staging buffer owned by a single attempt.
#[derive(Debug)]
pub struct ChunkBuffer {
    buf: Vec<u8>,
}

impl Default for ChunkBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkBuffer {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            buf: vec![0; chunk_size.clamp(1, MAX_CHUNK_SIZE)],
        }
    }

    /// Forward everything `reader` yields to `channel` as file chunks.
    ///
    /// Reads accumulate until the buffer is full; a zero-byte read flushes the
    /// pending partial chunk and ends the loop. No end marker is sent, so the
    /// caller decides when the stream is complete. Returns the bytes forwarded.
    pub async fn send_from<R, C>(&mut self, reader: &mut R, channel: &mut C) -> Result<u64, ChunkError>
    where
        R: AsyncRead + Unpin + ?Sized,
        C: MsgChannel + ?Sized,
    {
        let mut offset = 0;
        let mut total = 0u64;

        loop {
            let n = reader
                .read(&mut self.buf[offset..])
                .await
                .map_err(ChunkError::Read)?;
            offset += n;

            if n == 0 || offset == self.buf.len() {
                if offset > 0 {
                    let chunk = Message::FileChunk(Bytes::copy_from_slice(&self.buf[..offset]));
                    if let Err(e) = channel.send(&chunk).await {
                        tracing::info!(offset, total, error = %e, "Write of chunk failed");
                        return Err(e.into());
                    }
                    total += offset as u64;
                    offset = 0;
                }
                if n == 0 {
                    return Ok(total);
                }
            }
        }
    }
}

/// Send a complete chunk stream: every byte of `reader` followed by the end marker.
pub async fn send_stream<R, C>(
    buffer: &mut ChunkBuffer,
    reader: &mut R,
    channel: &mut C,
) -> Result<u64, ChunkError>
where
    R: AsyncRead + Unpin + ?Sized,
    C: MsgChannel + ?Sized,
{
    let total = buffer.send_from(reader, channel).await?;
    channel.send(&Message::End).await?;
    Ok(total)
}

/// Receive a chunk stream into `writer` until the end marker.
///
/// Anything other than a file chunk or the end marker, including a closed
/// channel, is reported as [`ChunkError::Unexpected`].
pub async fn receive_stream<C, W>(channel: &mut C, writer: &mut W) -> Result<u64, ChunkError>
where
    C: MsgChannel + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut total = 0u64;
    loop {
        match channel.receive().await? {
            Some(Message::FileChunk(data)) => {
                writer.write_all(&data).await.map_err(ChunkError::Write)?;
                total += data.len() as u64;
            }
            Some(Message::End) => return Ok(total),
            other => return Err(ChunkError::Unexpected(other.map(|m| m.kind()))),
        }
    }
}
