//! Byte-stream transports.
//!
//! The runtime needs nothing more than an ordered, reliable stream with
//! connect, send, receive and close. [`FramedTransport`] provides that over
//! TCP sockets, in-memory duplex pipes or any other `AsyncRead + AsyncWrite`.

pub mod framed;
pub mod memory;
pub mod tcp;

pub use framed::{ByteStream, FrameReader, FrameWriter, FramedTransport};
