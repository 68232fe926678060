//! Per-stream state: capabilities, bounded receive buffer and outgoing
//! chunks waiting for credit.

use crate::config::OverflowPolicy;
use crate::error::{ProtocolError, Result};
use bytes::{Buf, Bytes, BytesMut};
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// What the accepting side allows on a stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamCapabilities {
    pub can_read: bool,
    pub can_write: bool,
    pub can_seek: bool,
}

impl Default for StreamCapabilities {
    fn default() -> Self {
        Self {
            can_read: true,
            can_write: true,
            can_seek: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamState {
    /// Open sent, waiting for Accept or Reject
    Opening,
    Open,
}

/// Random-access data served to `DataRequest`s
pub trait StreamSource: Send + Sync {
    fn len(&self) -> u64;

    fn read_at(&self, offset: u64, length: usize) -> Result<Bytes>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl StreamSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn read_at(&self, offset: u64, length: usize) -> Result<Bytes> {
        let start = usize::try_from(offset)
            .ok()
            .filter(|s| *s <= Bytes::len(self))
            .ok_or_else(|| {
                ProtocolError::StreamError(format!("offset {offset} beyond end of source"))
            })?;
        let end = start.saturating_add(length).min(Bytes::len(self));
        Ok(self.slice(start..end))
    }
}

/// Split `data` into pieces of at most `chunk_size` bytes, in order
pub fn chunk_data(data: &Bytes, chunk_size: usize) -> Vec<Bytes> {
    let chunk_size = chunk_size.max(1);
    let mut chunks = Vec::with_capacity(data.len() / chunk_size + 1);
    let mut offset = 0;
    while offset < data.len() {
        let end = (offset + chunk_size).min(data.len());
        chunks.push(data.slice(offset..end));
        offset = end;
    }
    chunks
}

/// Bounded buffer of received bytes
#[derive(Debug)]
pub struct ReceiveBuffer {
    data: BytesMut,
    capacity: usize,
    policy: OverflowPolicy,
    evicted: u64,
}

impl ReceiveBuffer {
    pub fn new(capacity: usize, policy: OverflowPolicy) -> Self {
        Self {
            data: BytesMut::with_capacity(capacity.min(64 * 1024)),
            capacity,
            policy,
            evicted: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes dropped under `EvictOldest`
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn push(&mut self, incoming: &[u8]) -> Result<()> {
        let total = self.data.len() + incoming.len();
        if total <= self.capacity {
            self.data.extend_from_slice(incoming);
            return Ok(());
        }
        match self.policy {
            OverflowPolicy::Credit => Err(ProtocolError::StreamError(format!(
                "peer overran receive window ({total} > {})",
                self.capacity
            ))),
            OverflowPolicy::EvictOldest => {
                let overflow = total - self.capacity;
                if incoming.len() >= self.capacity {
                    self.evicted += (self.data.len() + incoming.len() - self.capacity) as u64;
                    self.data.clear();
                    self.data
                        .extend_from_slice(&incoming[incoming.len() - self.capacity..]);
                } else {
                    self.data.advance(overflow);
                    self.evicted += overflow as u64;
                    self.data.extend_from_slice(incoming);
                }
                Ok(())
            }
        }
    }

    /// Take up to `max` buffered bytes
    pub fn take(&mut self, max: usize) -> Bytes {
        let n = max.min(self.data.len());
        self.data.split_to(n).freeze()
    }
}

/// One stream as seen from this side
pub struct StreamChannel {
    pub id: u16,
    pub handler: String,
    pub state: StreamState,
    /// Whether this side sent the Open
    pub local_opened: bool,
    pub capabilities: StreamCapabilities,
    /// Whether the peer grants credit
    pub peer_uses_credit: bool,
    pub receive: ReceiveBuffer,
    /// Bytes the peer still accepts before the next WindowUpdate
    pub send_credit: u64,
    pub pending: VecDeque<(u64, Bytes)>,
    pub write_offset: u64,
    pub source: Option<Arc<dyn StreamSource>>,
}

impl fmt::Debug for StreamChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamChannel")
            .field("id", &self.id)
            .field("handler", &self.handler)
            .field("state", &self.state)
            .field("capabilities", &self.capabilities)
            .field("buffered", &self.receive.len())
            .field("send_credit", &self.send_credit)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl StreamChannel {
    pub fn new(
        id: u16,
        handler: impl Into<String>,
        local_opened: bool,
        capacity: usize,
        policy: OverflowPolicy,
    ) -> Self {
        Self {
            id,
            handler: handler.into(),
            state: StreamState::Opening,
            local_opened,
            capabilities: StreamCapabilities::default(),
            peer_uses_credit: false,
            receive: ReceiveBuffer::new(capacity, policy),
            send_credit: 0,
            pending: VecDeque::new(),
            write_offset: 0,
            source: None,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state == StreamState::Open
    }

    /// Pop the next piece allowed by the current credit
    pub fn next_sendable(&mut self) -> Option<(u64, Bytes)> {
        if !self.is_open() {
            return None;
        }
        if !self.peer_uses_credit {
            return self.pending.pop_front();
        }
        let allowed = usize::try_from(self.send_credit).unwrap_or(usize::MAX);
        if allowed == 0 {
            return None;
        }
        let (offset, chunk) = self.pending.pop_front()?;
        if chunk.len() <= allowed {
            self.send_credit -= chunk.len() as u64;
            return Some((offset, chunk));
        }
        let head = chunk.slice(..allowed);
        let tail = chunk.slice(allowed..);
        self.pending.push_front((offset + allowed as u64, tail));
        self.send_credit = 0;
        Some((offset, head))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_chunks_concatenate_to_input() {
        let data = Bytes::from((0..1000u32).map(|i| i as u8).collect::<Vec<u8>>());
        let chunks = chunk_data(&data, 300);
        assert_eq!(chunks.len(), 4);
        assert!(chunks.iter().all(|c| c.len() <= 300));
        let joined: Vec<u8> = chunks.iter().flat_map(|c| c.iter().copied()).collect();
        assert_eq!(joined, data.to_vec());
        assert!(chunk_data(&Bytes::new(), 300).is_empty());
    }

    #[test]
    fn test_credit_overrun_is_error() {
        let mut buffer = ReceiveBuffer::new(8, OverflowPolicy::Credit);
        buffer.push(b"12345").unwrap();
        assert!(buffer.push(b"6789").is_err());
        assert_eq!(buffer.take(3).as_ref(), b"123");
        buffer.push(b"6789").unwrap();
        assert_eq!(buffer.take(100).as_ref(), b"456789");
    }

    #[test]
    fn test_evict_oldest_keeps_newest() {
        let mut buffer = ReceiveBuffer::new(6, OverflowPolicy::EvictOldest);
        buffer.push(b"abcd").unwrap();
        buffer.push(b"efgh").unwrap();
        assert_eq!(buffer.evicted(), 2);
        assert_eq!(buffer.take(10).as_ref(), b"cdefgh");

        buffer.push(b"0123456789").unwrap();
        assert_eq!(buffer.take(10).as_ref(), b"456789");
    }

    #[test]
    fn test_sendable_respects_credit() {
        let mut channel = StreamChannel::new(1, "files", true, 64, OverflowPolicy::Credit);
        channel.state = StreamState::Open;
        channel.peer_uses_credit = true;
        channel.send_credit = 5;
        channel.pending.push_back((0, Bytes::from_static(b"hello world")));

        let (offset, first) = channel.next_sendable().unwrap();
        assert_eq!((offset, first.as_ref()), (0, &b"hello"[..]));
        assert!(channel.next_sendable().is_none());

        channel.send_credit = 100;
        let (offset, rest) = channel.next_sendable().unwrap();
        assert_eq!((offset, rest.as_ref()), (5, &b" world"[..]));
    }

    #[test]
    fn test_bytes_source_bounds() {
        let source = Bytes::from_static(b"0123456789");
        assert_eq!(source.read_at(8, 10).unwrap().as_ref(), b"89");
        assert!(source.read_at(11, 1).is_err());
    }
}
