//! Stream multiplexer for one connection.
//!
//! The mux is sans-IO: callers feed it incoming [`StreamMessage`]s and local
//! operations, and drain the messages it wants sent with [`StreamMux::drain`].
//! The runtime owns one mux per connection behind the connection's lock.

use crate::config::{OverflowPolicy, StreamConfig};
use crate::core::buffer::{ByteReader, ByteWriter};
use crate::error::{ProtocolError, Result};
use crate::protocol::message::WireMessage;
use crate::protocol::session::Side;
use crate::stream::channel::{
    chunk_data, StreamCapabilities, StreamChannel, StreamSource, StreamState,
};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, warn};

/// `DataSend` flag: the request could not be served
pub const DATA_ERROR: u8 = 0x01;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamMessage {
    Open {
        stream_id: u16,
        handler: String,
        /// Opener's receive capacity
        capacity: u32,
        /// Whether the opener returns credit with `WindowUpdate`
        credit: bool,
        metadata: Bytes,
    },
    Accept {
        stream_id: u16,
        capabilities: StreamCapabilities,
        capacity: u32,
        credit: bool,
    },
    Reject {
        stream_id: u16,
        reason: String,
    },
    DataSend {
        stream_id: u16,
        offset: u64,
        flags: u8,
        data: Bytes,
    },
    DataRequest {
        stream_id: u16,
        offset: u64,
        length: u32,
    },
    WindowUpdate {
        stream_id: u16,
        credit: u32,
    },
    Close {
        stream_id: u16,
        reason: String,
    },
}

impl StreamMessage {
    pub fn stream_id(&self) -> u16 {
        match self {
            StreamMessage::Open { stream_id, .. }
            | StreamMessage::Accept { stream_id, .. }
            | StreamMessage::Reject { stream_id, .. }
            | StreamMessage::DataSend { stream_id, .. }
            | StreamMessage::DataRequest { stream_id, .. }
            | StreamMessage::WindowUpdate { stream_id, .. }
            | StreamMessage::Close { stream_id, .. } => *stream_id,
        }
    }
}

impl WireMessage for StreamMessage {
    fn encode(&self, w: &mut ByteWriter) -> Result<()> {
        match self {
            StreamMessage::Open {
                stream_id,
                handler,
                capacity,
                credit,
                metadata,
            } => {
                w.write_u8(0);
                w.write_u16(*stream_id);
                w.write_string(handler)?;
                w.write_u32(*capacity);
                w.write_bool(*credit);
                w.write_blob(metadata)?;
            }
            StreamMessage::Accept {
                stream_id,
                capabilities,
                capacity,
                credit,
            } => {
                w.write_u8(1);
                w.write_u16(*stream_id);
                w.write_bool(capabilities.can_read);
                w.write_bool(capabilities.can_write);
                w.write_bool(capabilities.can_seek);
                w.write_u32(*capacity);
                w.write_bool(*credit);
            }
            StreamMessage::Reject { stream_id, reason } => {
                w.write_u8(2);
                w.write_u16(*stream_id);
                w.write_string(reason)?;
            }
            StreamMessage::DataSend {
                stream_id,
                offset,
                flags,
                data,
            } => {
                w.write_u8(3);
                w.write_u16(*stream_id);
                w.write_u64(*offset);
                w.write_u8(*flags);
                w.write_blob(data)?;
            }
            StreamMessage::DataRequest {
                stream_id,
                offset,
                length,
            } => {
                w.write_u8(4);
                w.write_u16(*stream_id);
                w.write_u64(*offset);
                w.write_u32(*length);
            }
            StreamMessage::WindowUpdate { stream_id, credit } => {
                w.write_u8(5);
                w.write_u16(*stream_id);
                w.write_u32(*credit);
            }
            StreamMessage::Close { stream_id, reason } => {
                w.write_u8(6);
                w.write_u16(*stream_id);
                w.write_string(reason)?;
            }
        }
        Ok(())
    }

    fn decode(r: &mut ByteReader<'_>) -> Result<Self> {
        let op = r.read_u8()?;
        let stream_id = r.read_u16()?;
        Ok(match op {
            0 => StreamMessage::Open {
                stream_id,
                handler: r.read_string()?,
                capacity: r.read_u32()?,
                credit: r.read_bool()?,
                metadata: Bytes::copy_from_slice(r.read_blob()?),
            },
            1 => StreamMessage::Accept {
                stream_id,
                capabilities: StreamCapabilities {
                    can_read: r.read_bool()?,
                    can_write: r.read_bool()?,
                    can_seek: r.read_bool()?,
                },
                capacity: r.read_u32()?,
                credit: r.read_bool()?,
            },
            2 => StreamMessage::Reject {
                stream_id,
                reason: r.read_string()?,
            },
            3 => StreamMessage::DataSend {
                stream_id,
                offset: r.read_u64()?,
                flags: r.read_u8()?,
                data: Bytes::copy_from_slice(r.read_blob()?),
            },
            4 => StreamMessage::DataRequest {
                stream_id,
                offset: r.read_u64()?,
                length: r.read_u32()?,
            },
            5 => StreamMessage::WindowUpdate {
                stream_id,
                credit: r.read_u32()?,
            },
            6 => StreamMessage::Close {
                stream_id,
                reason: r.read_string()?,
            },
            other => {
                return Err(ProtocolError::Deserialization(format!(
                    "unknown stream operation {other}"
                )))
            }
        })
    }
}

/// An incoming Open as presented to a handler
#[derive(Debug, Clone)]
pub struct StreamOpen {
    pub stream_id: u16,
    pub handler: String,
    pub metadata: Bytes,
}

/// A handler's answer to an incoming Open
pub enum StreamDecision {
    Accept {
        capabilities: StreamCapabilities,
        /// Receive capacity; the configured default when `None`
        capacity: Option<u32>,
        source: Option<Arc<dyn StreamSource>>,
    },
    Reject(String),
}

impl StreamDecision {
    pub fn accept() -> Self {
        StreamDecision::Accept {
            capabilities: StreamCapabilities::default(),
            capacity: None,
            source: None,
        }
    }

    /// Accept and serve `DataRequest`s from `source`
    pub fn serve(source: Arc<dyn StreamSource>) -> Self {
        StreamDecision::Accept {
            capabilities: StreamCapabilities {
                can_read: true,
                can_write: false,
                can_seek: true,
            },
            capacity: None,
            source: Some(source),
        }
    }
}

impl fmt::Debug for StreamDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StreamDecision::Accept {
                capabilities,
                capacity,
                source,
            } => f
                .debug_struct("Accept")
                .field("capabilities", capabilities)
                .field("capacity", capacity)
                .field("source", &source.is_some())
                .finish(),
            StreamDecision::Reject(reason) => f.debug_tuple("Reject").field(reason).finish(),
        }
    }
}

pub type StreamHandler = Arc<dyn Fn(&StreamOpen) -> StreamDecision + Send + Sync>;

/// Named handlers consulted for incoming Opens
#[derive(Default, Clone)]
pub struct StreamHandlers {
    handlers: HashMap<String, StreamHandler>,
}

impl fmt::Debug for StreamHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.handlers.keys()).finish()
    }
}

impl StreamHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(&StreamOpen) -> StreamDecision + Send + Sync + 'static,
    {
        let name = name.into();
        if self.handlers.contains_key(&name) {
            return Err(ProtocolError::ConfigError(format!(
                "stream handler '{name}' registered twice"
            )));
        }
        self.handlers.insert(name, Arc::new(handler));
        Ok(())
    }

    fn decide(&self, open: &StreamOpen) -> StreamDecision {
        match self.handlers.get(&open.handler) {
            Some(handler) => handler(open),
            None => StreamDecision::Reject(format!("no stream handler '{}'", open.handler)),
        }
    }
}

/// Something the application should hear about
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// The peer opened a stream and a handler accepted it
    Opened {
        stream_id: u16,
        handler: String,
        metadata: Bytes,
    },
    Accepted {
        stream_id: u16,
        capabilities: StreamCapabilities,
    },
    Rejected { stream_id: u16, reason: String },
    /// Bytes are waiting in the receive buffer
    Data { stream_id: u16, offset: u64, length: usize },
    RequestFailed { stream_id: u16, offset: u64 },
    Closed { stream_id: u16, reason: String },
}

pub struct StreamMux {
    side: Side,
    next_id: u16,
    chunk_size: usize,
    default_capacity: usize,
    policy: OverflowPolicy,
    channels: HashMap<u16, StreamChannel>,
    outbox: Vec<StreamMessage>,
}

impl fmt::Debug for StreamMux {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StreamMux")
            .field("side", &self.side)
            .field("channels", &self.channels.len())
            .field("outbox", &self.outbox.len())
            .finish()
    }
}

impl StreamMux {
    pub fn new(side: Side, config: &StreamConfig) -> Self {
        Self {
            side,
            next_id: match side {
                Side::Client => 1,
                Side::Server => 2,
            },
            chunk_size: config.chunk_size.max(1),
            default_capacity: config.default_capacity.max(1),
            policy: config.overflow_policy,
            channels: HashMap::new(),
            outbox: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    pub fn channel(&self, stream_id: u16) -> Option<&StreamChannel> {
        self.channels.get(&stream_id)
    }

    fn uses_credit(&self) -> bool {
        self.policy == OverflowPolicy::Credit
    }

    fn allocate_id(&mut self) -> Result<u16> {
        // Half of the id space belongs to each side
        for _ in 0..(u16::MAX / 2) {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(2);
            if self.next_id == 0 {
                self.next_id = 2;
            }
            if id != 0 && !self.channels.contains_key(&id) {
                return Ok(id);
            }
        }
        Err(ProtocolError::StreamError("no free stream ids".into()))
    }

    fn channel_mut(&mut self, stream_id: u16) -> Result<&mut StreamChannel> {
        self.channels
            .get_mut(&stream_id)
            .ok_or_else(|| ProtocolError::StreamError(format!("unknown stream {stream_id}")))
    }

    /// Ask the peer to open a stream handled by `handler`
    pub fn open(
        &mut self,
        handler: impl Into<String>,
        capacity: Option<u32>,
        metadata: Bytes,
    ) -> Result<u16> {
        let handler = handler.into();
        let id = self.allocate_id()?;
        let capacity = capacity.map(|c| c as usize).unwrap_or(self.default_capacity).max(1);
        let channel = StreamChannel::new(id, handler.clone(), true, capacity, self.policy);
        self.channels.insert(id, channel);
        self.outbox.push(StreamMessage::Open {
            stream_id: id,
            handler,
            capacity: u32::try_from(capacity).unwrap_or(u32::MAX),
            credit: self.uses_credit(),
            metadata,
        });
        debug!(stream_id = id, "stream open requested");
        Ok(id)
    }

    /// Queue `data` for sending in chunks; sent as credit allows
    pub fn write(&mut self, stream_id: u16, data: Bytes) -> Result<()> {
        let chunk_size = self.chunk_size;
        let channel = self.channel_mut(stream_id)?;
        // Capabilities are granted by the accepting side to the opener
        let allowed = if channel.local_opened {
            channel.capabilities.can_write
        } else {
            channel.capabilities.can_read
        };
        if channel.is_open() && !allowed {
            return Err(ProtocolError::PermissionDenied(format!(
                "stream {stream_id} is not writable from this side"
            )));
        }
        for chunk in chunk_data(&data, chunk_size) {
            let offset = channel.write_offset;
            channel.write_offset += chunk.len() as u64;
            channel.pending.push_back((offset, chunk));
        }
        self.flush(stream_id);
        Ok(())
    }

    /// Take up to `max` received bytes, returning credit to the peer
    pub fn read(&mut self, stream_id: u16, max: usize) -> Result<Bytes> {
        let credit = self.uses_credit();
        let channel = self.channel_mut(stream_id)?;
        let data = channel.receive.take(max);
        if credit && !data.is_empty() {
            self.outbox.push(StreamMessage::WindowUpdate {
                stream_id,
                credit: u32::try_from(data.len()).unwrap_or(u32::MAX),
            });
        }
        Ok(data)
    }

    /// Bytes waiting to be read
    pub fn buffered(&self, stream_id: u16) -> usize {
        self.channels
            .get(&stream_id)
            .map(|c| c.receive.len())
            .unwrap_or(0)
    }

    /// Pull-read from a seekable peer
    pub fn request(&mut self, stream_id: u16, offset: u64, length: u32) -> Result<()> {
        let channel = self.channel_mut(stream_id)?;
        if !channel.is_open() {
            return Err(ProtocolError::StreamError(format!(
                "stream {stream_id} is not open"
            )));
        }
        self.outbox.push(StreamMessage::DataRequest {
            stream_id,
            offset,
            length,
        });
        Ok(())
    }

    pub fn close(&mut self, stream_id: u16, reason: impl Into<String>) -> Result<()> {
        if self.channels.remove(&stream_id).is_none() {
            return Err(ProtocolError::StreamError(format!("unknown stream {stream_id}")));
        }
        self.outbox.push(StreamMessage::Close {
            stream_id,
            reason: reason.into(),
        });
        Ok(())
    }

    /// Drop every stream without notifying the peer; for disconnects
    pub fn close_all(&mut self, reason: &str) -> Vec<StreamEvent> {
        self.outbox.clear();
        self.channels
            .drain()
            .map(|(stream_id, _)| StreamEvent::Closed {
                stream_id,
                reason: reason.to_string(),
            })
            .collect()
    }

    pub fn drain(&mut self) -> Vec<StreamMessage> {
        std::mem::take(&mut self.outbox)
    }

    fn flush(&mut self, stream_id: u16) {
        if let Some(channel) = self.channels.get_mut(&stream_id) {
            while let Some((offset, data)) = channel.next_sendable() {
                self.outbox.push(StreamMessage::DataSend {
                    stream_id,
                    offset,
                    flags: 0,
                    data,
                });
            }
        }
    }

    fn fail_stream(&mut self, stream_id: u16, reason: String) -> StreamEvent {
        warn!(stream_id, %reason, "closing stream");
        self.channels.remove(&stream_id);
        self.outbox.push(StreamMessage::Close {
            stream_id,
            reason: reason.clone(),
        });
        StreamEvent::Closed { stream_id, reason }
    }

    /// Apply one incoming message
    pub fn handle(
        &mut self,
        message: StreamMessage,
        handlers: &StreamHandlers,
    ) -> Result<Option<StreamEvent>> {
        match message {
            StreamMessage::Open {
                stream_id,
                handler,
                capacity,
                credit,
                metadata,
            } => {
                let expected_parity = match self.side {
                    Side::Client => 0,
                    Side::Server => 1,
                };
                if stream_id % 2 != expected_parity || self.channels.contains_key(&stream_id) {
                    self.outbox.push(StreamMessage::Reject {
                        stream_id,
                        reason: format!("stream id {stream_id} is not available"),
                    });
                    return Ok(None);
                }
                let open = StreamOpen {
                    stream_id,
                    handler: handler.clone(),
                    metadata: metadata.clone(),
                };
                match handlers.decide(&open) {
                    StreamDecision::Reject(reason) => {
                        debug!(stream_id, %reason, "stream rejected");
                        self.outbox.push(StreamMessage::Reject { stream_id, reason });
                        Ok(None)
                    }
                    StreamDecision::Accept {
                        capabilities,
                        capacity: own_capacity,
                        source,
                    } => {
                        let own_capacity = own_capacity
                            .map(|c| c as usize)
                            .unwrap_or(self.default_capacity)
                            .max(1);
                        let mut channel = StreamChannel::new(
                            stream_id,
                            handler.clone(),
                            false,
                            own_capacity,
                            self.policy,
                        );
                        channel.state = StreamState::Open;
                        channel.capabilities = capabilities;
                        channel.peer_uses_credit = credit;
                        channel.send_credit = u64::from(capacity);
                        channel.source = source;
                        self.channels.insert(stream_id, channel);
                        self.outbox.push(StreamMessage::Accept {
                            stream_id,
                            capabilities,
                            capacity: u32::try_from(own_capacity).unwrap_or(u32::MAX),
                            credit: self.uses_credit(),
                        });
                        Ok(Some(StreamEvent::Opened {
                            stream_id,
                            handler,
                            metadata,
                        }))
                    }
                }
            }
            StreamMessage::Accept {
                stream_id,
                capabilities,
                capacity,
                credit,
            } => {
                let channel = self.channel_mut(stream_id)?;
                if channel.state != StreamState::Opening || !channel.local_opened {
                    return Err(ProtocolError::StreamError(format!(
                        "unexpected accept for stream {stream_id}"
                    )));
                }
                channel.state = StreamState::Open;
                channel.capabilities = capabilities;
                channel.peer_uses_credit = credit;
                channel.send_credit = u64::from(capacity);
                self.flush(stream_id);
                Ok(Some(StreamEvent::Accepted {
                    stream_id,
                    capabilities,
                }))
            }
            StreamMessage::Reject { stream_id, reason } => {
                if self
                    .channels
                    .get(&stream_id)
                    .is_some_and(|c| c.local_opened && c.state == StreamState::Opening)
                {
                    self.channels.remove(&stream_id);
                    Ok(Some(StreamEvent::Rejected { stream_id, reason }))
                } else {
                    Ok(None)
                }
            }
            StreamMessage::DataSend {
                stream_id,
                offset,
                flags,
                data,
            } => {
                let channel = self.channel_mut(stream_id)?;
                if !channel.is_open() {
                    return Err(ProtocolError::StreamError(format!(
                        "data on unopened stream {stream_id}"
                    )));
                }
                if flags & DATA_ERROR != 0 {
                    return Ok(Some(StreamEvent::RequestFailed { stream_id, offset }));
                }
                let length = data.len();
                if let Err(e) = channel.receive.push(&data) {
                    return Ok(Some(self.fail_stream(stream_id, e.to_string())));
                }
                Ok(Some(StreamEvent::Data {
                    stream_id,
                    offset,
                    length,
                }))
            }
            StreamMessage::DataRequest {
                stream_id,
                offset,
                length,
            } => {
                let chunk_size = self.chunk_size;
                let channel = self.channel_mut(stream_id)?;
                let served = match (&channel.source, channel.capabilities.can_seek) {
                    (Some(source), true) => source.read_at(offset, length as usize).ok(),
                    _ => None,
                };
                match served {
                    Some(data) => {
                        let mut at = offset;
                        for chunk in chunk_data(&data, chunk_size) {
                            let len = chunk.len() as u64;
                            channel.pending.push_back((at, chunk));
                            at += len;
                        }
                        self.flush(stream_id);
                    }
                    None => self.outbox.push(StreamMessage::DataSend {
                        stream_id,
                        offset,
                        flags: DATA_ERROR,
                        data: Bytes::new(),
                    }),
                }
                Ok(None)
            }
            StreamMessage::WindowUpdate { stream_id, credit } => {
                let channel = self.channel_mut(stream_id)?;
                channel.send_credit = channel.send_credit.saturating_add(u64::from(credit));
                self.flush(stream_id);
                Ok(None)
            }
            StreamMessage::Close { stream_id, reason } => Ok(self
                .channels
                .remove(&stream_id)
                .map(|_| StreamEvent::Closed { stream_id, reason })),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn config(chunk_size: usize, capacity: usize, policy: OverflowPolicy) -> StreamConfig {
        StreamConfig {
            chunk_size,
            default_capacity: capacity,
            overflow_policy: policy,
        }
    }

    fn handlers() -> StreamHandlers {
        let mut handlers = StreamHandlers::new();
        handlers
            .register("upload", |_| StreamDecision::accept())
            .unwrap();
        handlers
            .register("asset", |_| {
                StreamDecision::serve(Arc::new(Bytes::from_static(b"0123456789abcdef")))
            })
            .unwrap();
        handlers
    }

    /// Deliver everything each side has queued until both are quiet
    fn pump(a: &mut StreamMux, b: &mut StreamMux) -> (Vec<StreamEvent>, Vec<StreamEvent>) {
        let handlers = handlers();
        let (mut events_a, mut events_b) = (Vec::new(), Vec::new());
        loop {
            let from_a = a.drain();
            let from_b = b.drain();
            if from_a.is_empty() && from_b.is_empty() {
                return (events_a, events_b);
            }
            for m in from_a {
                events_b.extend(b.handle(m, &handlers).unwrap());
            }
            for m in from_b {
                events_a.extend(a.handle(m, &handlers).unwrap());
            }
        }
    }

    #[test]
    fn test_ids_follow_side_parity() {
        let cfg = config(16, 64, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        assert_eq!(client.open("upload", None, Bytes::new()).unwrap(), 1);
        assert_eq!(client.open("upload", None, Bytes::new()).unwrap(), 3);
        assert_eq!(server.open("upload", None, Bytes::new()).unwrap(), 2);
    }

    #[test]
    fn test_open_accept_and_chunked_write() {
        let cfg = config(4, 64, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("upload", None, Bytes::from_static(b"meta")).unwrap();
        client.write(id, Bytes::from_static(b"hello stream")).unwrap();

        let (client_events, server_events) = pump(&mut client, &mut server);
        assert!(matches!(client_events[0], StreamEvent::Accepted { stream_id, .. } if stream_id == id));
        assert!(matches!(&server_events[0], StreamEvent::Opened { handler, .. } if handler == "upload"));
        let data_events = server_events
            .iter()
            .filter(|e| matches!(e, StreamEvent::Data { .. }))
            .count();
        assert_eq!(data_events, 3);
        assert_eq!(server.read(id, 100).unwrap().as_ref(), b"hello stream");
    }

    #[test]
    fn test_credit_limits_in_flight_bytes() {
        let cfg = config(4, 8, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("upload", None, Bytes::new()).unwrap();
        client.write(id, Bytes::from(vec![7u8; 20])).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(server.buffered(id), 8);

        let mut received = Vec::new();
        while received.len() < 20 {
            received.extend_from_slice(&server.read(id, 3).unwrap());
            pump(&mut client, &mut server);
        }
        assert_eq!(received, vec![7u8; 20]);
    }

    #[test]
    fn test_evict_oldest_policy() {
        let cfg = config(4, 8, OverflowPolicy::EvictOldest);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("upload", None, Bytes::new()).unwrap();
        pump(&mut client, &mut server);
        client.write(id, Bytes::from_static(b"0123456789ab")).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(server.read(id, 100).unwrap().as_ref(), b"456789ab");
    }

    #[test]
    fn test_unknown_handler_rejected() {
        let cfg = config(4, 8, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("missing", None, Bytes::new()).unwrap();
        let (events, _) = pump(&mut client, &mut server);
        assert!(matches!(&events[0], StreamEvent::Rejected { stream_id, .. } if *stream_id == id));
        assert!(client.is_empty());
        assert!(server.is_empty());
    }

    #[test]
    fn test_seekable_request() {
        let cfg = config(4, 64, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("asset", None, Bytes::new()).unwrap();
        pump(&mut client, &mut server);
        assert!(client.channel(id).unwrap().capabilities.can_seek);

        client.request(id, 10, 6).unwrap();
        pump(&mut client, &mut server);
        assert_eq!(client.read(id, 100).unwrap().as_ref(), b"abcdef");
    }

    #[test]
    fn test_request_on_non_seekable_fails() {
        let cfg = config(4, 64, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("upload", None, Bytes::new()).unwrap();
        pump(&mut client, &mut server);
        client.request(id, 0, 4).unwrap();
        let (events, _) = pump(&mut client, &mut server);
        assert!(matches!(events[0], StreamEvent::RequestFailed { offset: 0, .. }));
    }

    #[test]
    fn test_close_from_either_side() {
        let cfg = config(4, 64, OverflowPolicy::Credit);
        let mut client = StreamMux::new(Side::Client, &cfg);
        let mut server = StreamMux::new(Side::Server, &cfg);
        let id = client.open("upload", None, Bytes::new()).unwrap();
        pump(&mut client, &mut server);
        server.close(id, "done").unwrap();
        let (events, _) = pump(&mut client, &mut server);
        assert!(matches!(&events[0], StreamEvent::Closed { reason, .. } if reason == "done"));
        assert!(client.is_empty());
    }

    #[test]
    fn test_wire_layout() {
        let msg = StreamMessage::DataSend {
            stream_id: 3,
            offset: 9,
            flags: 0,
            data: Bytes::from_static(b"xy"),
        };
        let mut w = ByteWriter::new();
        msg.encode(&mut w).unwrap();
        let bytes = w.into_bytes();
        assert_eq!(
            bytes.as_ref(),
            &[3, 0, 3, 0, 0, 0, 0, 0, 0, 0, 9, 0, 0, 0, 0, 2, b'x', b'y']
        );
        let mut r = ByteReader::new(&bytes);
        assert_eq!(StreamMessage::decode(&mut r).unwrap(), msg);
    }
}
