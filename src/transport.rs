//! Bidirectional message channels to the scheduler and to workers.

use async_trait::async_trait;
use futures::SinkExt;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream};
use tokio::net::TcpStream;
use tokio_stream::StreamExt;
use tokio_util::codec::Framed;

use crate::error::ProtocolError;
use crate::protocol::{Message, MessageCodec, PROTOCOL_VERSION};

/// A message channel as consumed by the build orchestration.
///
/// `receive` yields `Ok(None)` once the peer has closed the channel.
#[async_trait]
pub trait MsgChannel: Send {
    async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError>;

    async fn receive(&mut self) -> Result<Option<Message>, ProtocolError>;

    /// Protocol version usable on this channel (the lower of both ends, once known).
    fn protocol_version(&self) -> u16;
}

/// [`MsgChannel`] over any byte stream using [`MessageCodec`] framing.
#[derive(Debug)]
pub struct FramedChannel<S> {
    inner: Framed<S, MessageCodec>,
}

impl<S> FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    pub fn new(stream: S) -> Self {
        Self::with_protocol_version(stream, PROTOCOL_VERSION)
    }

    pub fn with_protocol_version(stream: S, version: u16) -> Self {
        Self {
            inner: Framed::new(stream, MessageCodec::new(version)),
        }
    }

    pub fn into_inner(self) -> S {
        self.inner.into_inner()
    }
}

#[async_trait]
impl<S> MsgChannel for FramedChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, msg: &Message) -> Result<(), ProtocolError> {
        self.inner.send(msg).await
    }

    async fn receive(&mut self) -> Result<Option<Message>, ProtocolError> {
        self.inner.next().await.transpose()
    }

    fn protocol_version(&self) -> u16 {
        let codec = self.inner.codec();
        match codec.peer_version() {
            Some(peer) => peer.min(codec.version()),
            None => codec.version(),
        }
    }
}

/// Channel to a compile worker, owned by exactly one attempt.
pub type WorkerConnection = FramedChannel<TcpStream>;

/// Open a framed channel to `host:port`.
pub async fn connect_tcp(host: &str, port: u16) -> Result<WorkerConnection, ProtocolError> {
    let stream = TcpStream::connect((host, port)).await?;
    stream.set_nodelay(true)?;
    tracing::debug!(host, port, "Connected");
    Ok(FramedChannel::new(stream))
}

/// Two connected in-memory channels, mostly useful for tests and local loops.
pub fn duplex_pair(buffer: usize) -> (FramedChannel<DuplexStream>, FramedChannel<DuplexStream>) {
    let (a, b) = tokio::io::duplex(buffer);
    (FramedChannel::new(a), FramedChannel::new(b))
}
