//! Frame-level transport over any ordered, reliable byte stream.

use crate::core::codec::FrameCodec;
use crate::core::packet::Frame;
use crate::error::{ProtocolError, Result};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;
use tracing::{debug, instrument};

/// Byte streams the runtime can drive
pub trait ByteStream: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> ByteStream for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

pub type FrameWriter<T> = SplitSink<Framed<T, FrameCodec>, Frame>;
pub type FrameReader<T> = SplitStream<Framed<T, FrameCodec>>;

pub struct FramedTransport<T> {
    framed: Framed<T, FrameCodec>,
    peer: String,
    connected: bool,
}

impl<T> std::fmt::Debug for FramedTransport<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramedTransport")
            .field("peer", &self.peer)
            .field("connected", &self.connected)
            .finish()
    }
}

impl<T: ByteStream> FramedTransport<T> {
    /// Wrap an already connected stream
    pub fn new(io: T, max_body: usize, peer: impl Into<String>) -> Self {
        Self {
            framed: Framed::new(io, FrameCodec::new(max_body)),
            peer: peer.into(),
            connected: true,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub async fn send(&mut self, frame: Frame) -> Result<()> {
        if !self.connected {
            return Err(ProtocolError::ConnectionClosed);
        }
        if let Err(e) = self.framed.send(frame).await {
            if e.is_fatal() {
                self.connected = false;
            }
            return Err(e);
        }
        Ok(())
    }

    /// Next frame; `None` once the peer closed the stream
    pub async fn receive(&mut self) -> Result<Option<Frame>> {
        if !self.connected {
            return Ok(None);
        }
        match self.framed.next().await {
            Some(Ok(frame)) => Ok(Some(frame)),
            Some(Err(e)) => {
                self.connected = false;
                Err(e)
            }
            None => {
                debug!(peer = %self.peer, "peer closed stream");
                self.connected = false;
                Ok(None)
            }
        }
    }

    #[instrument(skip(self), fields(peer = %self.peer))]
    pub async fn close(&mut self) -> Result<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        self.framed.close().await
    }

    /// Separate halves for concurrent reading and writing
    pub fn split(self) -> (FrameWriter<T>, FrameReader<T>) {
        self.framed.split()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::core::packet::{PacketFlags, PacketKind};
    use bytes::Bytes;

    #[tokio::test]
    async fn test_frames_cross_duplex() {
        let (a, b) = tokio::io::duplex(1024);
        let mut left = FramedTransport::new(a, 4096, "left");
        let mut right = FramedTransport::new(b, 4096, "right");

        let frame = Frame::new(PacketKind::KeepAlive, PacketFlags::NONE, Bytes::from_static(b"ping")).unwrap();
        left.send(frame.clone()).await.unwrap();
        assert_eq!(right.receive().await.unwrap(), Some(frame));

        left.close().await.unwrap();
        assert!(!left.is_connected());
        drop(left);
        assert_eq!(right.receive().await.unwrap(), None);
        assert!(!right.is_connected());
    }
}
