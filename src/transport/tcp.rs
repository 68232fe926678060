use crate::error::{ProtocolError, Result};
use crate::transport::framed::FramedTransport;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tracing::{info, instrument};

/// Connect with a deadline and wrap the socket in a frame transport
#[instrument(skip(max_body))]
pub async fn connect(
    addr: &str,
    timeout: Duration,
    max_body: usize,
) -> Result<FramedTransport<TcpStream>> {
    let stream = match tokio::time::timeout(timeout, TcpStream::connect(addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(ProtocolError::Io(e)),
        Err(_) => return Err(ProtocolError::Timeout),
    };
    stream.set_nodelay(true)?;
    let peer = stream.peer_addr()?;
    info!(%peer, "connected");
    Ok(FramedTransport::new(stream, max_body, peer.to_string()))
}

pub async fn bind(addr: &str) -> Result<TcpListener> {
    let listener = TcpListener::bind(addr).await?;
    info!(address = %listener.local_addr()?, "listening");
    Ok(listener)
}

/// Accept one socket as a frame transport
pub async fn accept(
    listener: &TcpListener,
    max_body: usize,
) -> Result<(FramedTransport<TcpStream>, SocketAddr)> {
    let (stream, peer) = listener.accept().await?;
    stream.set_nodelay(true)?;
    Ok((FramedTransport::new(stream, max_body, peer.to_string()), peer))
}
