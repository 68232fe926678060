use crate::transport::framed::FramedTransport;
use tokio::io::DuplexStream;

const DUPLEX_BUFFER: usize = 256 * 1024;

/// Two connected in-process transports
pub fn pair(max_body: usize) -> (FramedTransport<DuplexStream>, FramedTransport<DuplexStream>) {
    let (a, b) = tokio::io::duplex(DUPLEX_BUFFER);
    (
        FramedTransport::new(a, max_body, "memory:a"),
        FramedTransport::new(b, max_body, "memory:b"),
    )
}
