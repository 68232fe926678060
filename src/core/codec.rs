//! Tokio codec that cuts a byte stream into [`Frame`]s.
//!
//! Decoding inspects only the six-byte header to learn how many bytes to wait
//! for; oversized or malformed headers fail before the body is buffered.

use crate::config::MAX_PAYLOAD_SIZE;
use crate::core::packet::{Frame, PacketHeader, HEADER_LEN};
use crate::error::ProtocolError;
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

#[derive(Debug, Clone, Copy)]
pub struct FrameCodec {
    max_body: usize,
}

impl FrameCodec {
    pub fn new(max_body: usize) -> Self {
        Self { max_body }
    }

    pub fn max_body(&self) -> usize {
        self.max_body
    }
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PAYLOAD_SIZE)
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, ProtocolError> {
        let header = match PacketHeader::peek(src, self.max_body)? {
            Some(header) => header,
            None => return Ok(None),
        };

        let total = header.total_len();
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let body = src.split_to(header.size as usize).freeze();
        Ok(Some(Frame { header, body }))
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = ProtocolError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        if frame.body.len() > self.max_body {
            return Err(ProtocolError::OversizedPacket(frame.body.len()));
        }
        frame.header.flags.validate()?;
        if frame.header.size as usize != frame.body.len() {
            return Err(ProtocolError::Framing(format!(
                "header declares {} bytes but body has {}",
                frame.header.size,
                frame.body.len()
            )));
        }
        dst.reserve(frame.header.total_len());
        frame.header.write(dst);
        dst.extend_from_slice(&frame.body);
        Ok(())
    }
}
