//! The shared runtime context.
//!
//! A [`Runtime`] owns every registry a process needs (packets, methods,
//! object types, type wrappers, stream handlers), the object arena, the
//! pending-call table and the live connections. Server and client are thin
//! wrappers around one runtime plus a scheduler.
//!
//! Lock order: scheduler slots, then a connection's stream mux, then a
//! connection's session. Registry locks are never held while a session is
//! locked, and no session lock is held while another connection is touched.

use crate::config::NetworkConfig;
use crate::core::packet::Frame;
use crate::core::serialization::{ReferenceResolver, TypeWrapperRegistry, ValueCodec};
use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::protocol::auth::{AuthenticationProvider, NoAuthentication};
use crate::protocol::dispatcher::{CustomPacket, PacketRegistry};
use crate::protocol::message::{CustomPayload, Message};
use crate::protocol::session::{ConnectionState, Session, SessionEvent, SessionSettings, Side};
use crate::replication::object::ObjectTypeRegistry;
use crate::replication::registry::ObjectRegistry;
use crate::replication::spawn::{SpawnAuthority, SpawnQueue};
use crate::rpc::invoke::{handle_call, CallEnv, RpcCall, RpcResult, RpcTarget};
use crate::rpc::method::MethodRegistry;
use crate::rpc::pending::{PendingCall, PendingCalls, Resolution};
use crate::stream::mux::{StreamEvent, StreamHandlers, StreamMessage, StreamMux};
use crate::utils::locks;
use crate::utils::metrics::Metrics;
use crate::{ConnectionId, NetworkId, SERVER_ID};
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot, watch, Notify};
use tracing::{debug, info, warn};

const EVENT_CAPACITY: usize = 1024;

/// Everything the application registers before connections reach `Ready`
#[derive(Clone)]
pub struct Registries {
    pub packets: Arc<PacketRegistry>,
    pub methods: Arc<MethodRegistry>,
    pub object_types: Arc<ObjectTypeRegistry>,
    pub wrappers: Arc<TypeWrapperRegistry>,
    pub streams: Arc<StreamHandlers>,
    pub authenticator: Arc<dyn AuthenticationProvider>,
}

impl fmt::Debug for Registries {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registries")
            .field("packets", &self.packets.len())
            .field("methods", &self.methods.len())
            .field("object_types", &self.object_types.len())
            .field("streams", &self.streams)
            .finish_non_exhaustive()
    }
}

pub struct RegistryBuilder {
    packets: PacketRegistry,
    methods: MethodRegistry,
    object_types: ObjectTypeRegistry,
    wrappers: TypeWrapperRegistry,
    streams: StreamHandlers,
    authenticator: Arc<dyn AuthenticationProvider>,
}

impl Default for RegistryBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self {
            packets: PacketRegistry::new(),
            methods: MethodRegistry::new(),
            object_types: ObjectTypeRegistry::new(),
            wrappers: TypeWrapperRegistry::new(),
            streams: StreamHandlers::new(),
            authenticator: Arc::new(NoAuthentication),
        }
    }

    /// Register a custom packet type
    pub fn packet<P: CustomPacket>(mut self) -> Result<Self> {
        self.packets.register::<P>()?;
        Ok(self)
    }

    pub fn packets(&mut self) -> &mut PacketRegistry {
        &mut self.packets
    }

    pub fn methods(&mut self) -> &mut MethodRegistry {
        &mut self.methods
    }

    pub fn object_types(&mut self) -> &mut ObjectTypeRegistry {
        &mut self.object_types
    }

    pub fn wrappers(&mut self) -> &mut TypeWrapperRegistry {
        &mut self.wrappers
    }

    pub fn streams(&mut self) -> &mut StreamHandlers {
        &mut self.streams
    }

    pub fn authenticator(mut self, provider: impl AuthenticationProvider) -> Self {
        self.authenticator = Arc::new(provider);
        self
    }

    pub fn build(self) -> Registries {
        Registries {
            packets: Arc::new(self.packets),
            methods: Arc::new(self.methods),
            object_types: Arc::new(self.object_types),
            wrappers: Arc::new(self.wrappers),
            streams: Arc::new(self.streams),
            authenticator: self.authenticator,
        }
    }
}

/// Notifications for the application
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeEvent {
    Connected(ConnectionId),
    Disconnected {
        connection: ConnectionId,
        reason: String,
    },
    ObjectSpawned(NetworkId),
    ObjectDestroyed(NetworkId),
    ObjectModified(NetworkId),
    SyncVarChanged {
        network_id: NetworkId,
        name: String,
        value: Value,
    },
    /// A spawn, destroy or modify this side asked for was refused
    RequestRejected {
        network_id: NetworkId,
        reason: String,
    },
    Stream {
        connection: ConnectionId,
        event: StreamEvent,
    },
    CustomPacket {
        connection: ConnectionId,
        id: u16,
    },
}

/// One live connection as seen by the runtime
pub struct Connection {
    /// The peer's id: the client id on a server, [`SERVER_ID`] on a client
    remote: ConnectionId,
    peer: String,
    session: Mutex<Session>,
    pub(crate) streams: Mutex<StreamMux>,
    outbound: Mutex<Option<mpsc::UnboundedSender<Frame>>>,
    waker: RwLock<Arc<Notify>>,
    status: watch::Sender<ConnectionState>,
    established: AtomicBool,
    detached: AtomicBool,
    metrics: Arc<Metrics>,
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.remote)
            .field("peer", &self.peer)
            .field("state", &*self.status.borrow())
            .finish()
    }
}

impl Connection {
    pub(crate) fn new(
        session: Session,
        streams: StreamMux,
        outbound: mpsc::UnboundedSender<Frame>,
        waker: Arc<Notify>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let (status, _) = watch::channel(session.state().clone());
        Self {
            remote: session.remote_id(),
            peer: session.peer().to_string(),
            session: Mutex::new(session),
            streams: Mutex::new(streams),
            outbound: Mutex::new(Some(outbound)),
            waker: RwLock::new(waker),
            status,
            established: AtomicBool::new(false),
            detached: AtomicBool::new(false),
            metrics,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.remote
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn state(&self) -> ConnectionState {
        self.status.borrow().clone()
    }

    pub fn is_connected(&self) -> bool {
        *self.status.borrow() == ConnectionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        matches!(*self.status.borrow(), ConnectionState::Disconnected(_))
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.status.subscribe()
    }

    pub fn rtt(&self) -> Option<std::time::Duration> {
        locks::lock(&self.session).ok().and_then(|s| s.rtt())
    }

    /// Run `f` on the session, then ship queued frames and publish the state.
    /// Session events are returned even when `f` fails.
    pub(crate) fn session_op<T>(
        &self,
        f: impl FnOnce(&mut Session) -> Result<T>,
    ) -> (Result<T>, Vec<SessionEvent>) {
        let (result, frames, events, state) = match locks::lock(&self.session) {
            Ok(mut session) => {
                let result = f(&mut session);
                (
                    result,
                    session.drain_frames(),
                    session.take_events(),
                    session.state().clone(),
                )
            }
            Err(e) => return (Err(e), Vec::new()),
        };
        self.push_frames(frames);
        self.status.send_if_modified(|current| {
            if *current != state {
                *current = state;
                true
            } else {
                false
            }
        });
        (result, events)
    }

    fn push_frames(&self, frames: Vec<Frame>) {
        if frames.is_empty() {
            return;
        }
        let Ok(outbound) = locks::lock(&self.outbound) else {
            return;
        };
        if let Some(sender) = outbound.as_ref() {
            for frame in frames {
                self.metrics.message_sent(frame.body.len() as u64);
                if sender.send(frame).is_err() {
                    debug!(connection_id = self.remote, "writer gone, dropping frame");
                    break;
                }
            }
        }
    }

    /// Stop accepting frames; the writer drains what is queued and closes
    pub(crate) fn shutdown_outbound(&self) {
        if let Ok(mut outbound) = locks::lock(&self.outbound) {
            outbound.take();
        }
    }

    pub(crate) fn wake(&self) {
        if let Ok(waker) = locks::read(&self.waker) {
            waker.notify_one();
        }
    }

    pub(crate) fn set_waker(&self, waker: Arc<Notify>) {
        if let Ok(mut current) = locks::write(&self.waker) {
            *current = waker;
        }
    }
}

#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeInner>,
}

pub(crate) struct RuntimeInner {
    pub(crate) side: Side,
    pub(crate) config: NetworkConfig,
    pub(crate) registries: Registries,
    pub(crate) settings: Arc<SessionSettings>,
    pub(crate) codec: ValueCodec,
    pub(crate) objects: ObjectRegistry,
    pub(crate) pending: Arc<PendingCalls>,
    pub(crate) authority: Mutex<SpawnAuthority>,
    pub(crate) spawn_queue: Mutex<SpawnQueue>,
    pub(crate) spawn_waiters: Mutex<HashMap<u32, oneshot::Sender<Result<NetworkId>>>>,
    pub(crate) next_request: AtomicU32,
    next_client_id: AtomicU32,
    local_id: AtomicU32,
    connections: RwLock<HashMap<ConnectionId, Arc<Connection>>>,
    events: broadcast::Sender<RuntimeEvent>,
    pub(crate) metrics: Arc<Metrics>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("side", &self.inner.side)
            .field("local_id", &self.local_id())
            .field("connections", &self.connection_count())
            .field("objects", &self.inner.objects.len())
            .finish()
    }
}

impl Runtime {
    pub fn new(side: Side, config: NetworkConfig, registries: Registries) -> Result<Self> {
        config.validate_strict()?;
        let settings = Arc::new(SessionSettings::from_config(
            side,
            &config,
            Arc::clone(&registries.authenticator),
            Arc::clone(&registries.packets),
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(RuntimeInner {
                side,
                codec: ValueCodec::new(Arc::clone(&registries.wrappers)),
                config,
                registries,
                settings,
                objects: ObjectRegistry::new(),
                pending: PendingCalls::new(),
                authority: Mutex::new(SpawnAuthority::new()),
                spawn_queue: Mutex::new(SpawnQueue::new()),
                spawn_waiters: Mutex::new(HashMap::new()),
                next_request: AtomicU32::new(1),
                next_client_id: AtomicU32::new(1),
                local_id: AtomicU32::new(match side {
                    Side::Server => SERVER_ID,
                    Side::Client => crate::protocol::message::UNASSIGNED_ID,
                }),
                connections: RwLock::new(HashMap::new()),
                events,
                metrics: Arc::new(Metrics::new()),
            }),
        })
    }

    pub fn side(&self) -> Side {
        self.inner.side
    }

    pub fn config(&self) -> &NetworkConfig {
        &self.inner.config
    }

    pub fn registries(&self) -> &Registries {
        &self.inner.registries
    }

    pub fn metrics(&self) -> &Metrics {
        &self.inner.metrics
    }

    pub(crate) fn metrics_handle(&self) -> Arc<Metrics> {
        Arc::clone(&self.inner.metrics)
    }

    pub fn codec(&self) -> &ValueCodec {
        &self.inner.codec
    }

    pub fn objects(&self) -> &ObjectRegistry {
        &self.inner.objects
    }

    /// This side's connection id; `SERVER_ID` on a server
    pub fn local_id(&self) -> ConnectionId {
        self.inner.local_id.load(Ordering::Acquire)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<RuntimeEvent> {
        self.inner.events.subscribe()
    }

    pub(crate) fn settings(&self) -> Arc<SessionSettings> {
        Arc::clone(&self.inner.settings)
    }

    pub(crate) fn emit(&self, event: RuntimeEvent) {
        // No subscribers is fine
        let _ = self.inner.events.send(event);
    }

    pub(crate) fn allocate_client_id(&self) -> ConnectionId {
        self.inner.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub fn connection_count(&self) -> usize {
        locks::read(&self.inner.connections)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        locks::read(&self.inner.connections)
            .map(|c| {
                let mut ids: Vec<_> = c.keys().copied().collect();
                ids.sort_unstable();
                ids
            })
            .unwrap_or_default()
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connection(id).ok().map(|c| c.state())
    }

    pub(crate) fn connection(&self, id: ConnectionId) -> Result<Arc<Connection>> {
        locks::read(&self.inner.connections)?
            .get(&id)
            .cloned()
            .ok_or(ProtocolError::NotConnected(id))
    }

    /// Every connection that finished the handshake
    pub(crate) fn connected_peers(&self) -> Vec<Arc<Connection>> {
        locks::read(&self.inner.connections)
            .map(|c| c.values().filter(|c| c.is_connected()).cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn register_connection(&self, connection: Arc<Connection>) -> Result<()> {
        let mut connections = locks::write(&self.inner.connections)?;
        if connections.contains_key(&connection.id()) {
            return Err(ProtocolError::HandshakeError(format!(
                "connection id {} already in use",
                connection.id()
            )));
        }
        self.inner.metrics.connection_established();
        connections.insert(connection.id(), connection);
        Ok(())
    }

    pub(crate) fn send_to(&self, connection: &Arc<Connection>, message: Message) -> Result<()> {
        let (result, events) = connection.session_op(|s| s.send(message));
        self.session_events(connection, events);
        result
    }

    /// Feed one received frame through the session and dispatch its message
    pub(crate) fn handle_frame(&self, connection: &Arc<Connection>, frame: Frame) {
        self.inner.metrics.message_received(frame.body.len() as u64);
        let now = Instant::now();
        let (result, events) = connection.session_op(|s| s.receive(frame, now));
        self.session_events(connection, events);
        match result {
            Ok(Some(envelope)) => {
                if let Err(e) = self.dispatch(connection, envelope.message) {
                    self.message_failed(connection, e);
                }
            }
            Ok(None) => {}
            Err(e) => self.message_failed(connection, e),
        }
    }

    /// Timeouts and keep-alives
    pub(crate) fn tick_connection(&self, connection: &Arc<Connection>, now: Instant) {
        let (result, events) = connection.session_op(|s| s.tick(now));
        self.session_events(connection, events);
        if let Err(e) = result {
            self.message_failed(connection, e);
        }
    }

    /// The transport ended underneath the session
    pub(crate) fn connection_lost(&self, connection: &Arc<Connection>, reason: String) {
        let (_, events) = connection.session_op(|s| {
            s.terminate(reason);
            Ok(())
        });
        self.session_events(connection, events);
        self.detach(connection, "transport closed");
    }

    /// Close one connection with a notice to the peer
    pub fn disconnect(&self, id: ConnectionId, reason: &str) -> Result<()> {
        let connection = self.connection(id)?;
        let (_, events) = connection.session_op(|s| {
            s.close(reason);
            Ok(())
        });
        self.session_events(&connection, events);
        Ok(())
    }

    /// Signal readiness when `auto_ready` is off
    pub fn set_ready(&self, id: ConnectionId) -> Result<()> {
        let connection = self.connection(id)?;
        let (result, events) = connection.session_op(|s| s.set_ready());
        self.session_events(&connection, events);
        result
    }

    fn message_failed(&self, connection: &Arc<Connection>, error: ProtocolError) {
        self.inner.metrics.protocol_error();
        if error.is_fatal() {
            warn!(connection_id = connection.id(), error = %error, "closing connection");
            let (_, events) = connection.session_op(|s| {
                s.close(error.to_string());
                Ok(())
            });
            self.session_events(connection, events);
        } else {
            warn!(connection_id = connection.id(), error = %error, "dropping message");
        }
    }

    fn session_events(&self, connection: &Arc<Connection>, events: Vec<SessionEvent>) {
        for event in events {
            match event {
                SessionEvent::IdAssigned(id) => {
                    self.inner.local_id.store(id, Ordering::Release);
                }
                SessionEvent::Authenticated => {
                    debug!(connection_id = connection.id(), "authenticated");
                }
                SessionEvent::Connected => {
                    connection.established.store(true, Ordering::Release);
                    self.inner.metrics.handshake_success();
                    info!(connection_id = connection.id(), peer = %connection.peer(), "connected");
                    if self.inner.side == Side::Server
                        && self.inner.config.replication.snapshot_on_connect
                    {
                        if let Err(e) = self.send_snapshot(connection) {
                            warn!(connection_id = connection.id(), error = %e, "object snapshot failed");
                        }
                    }
                    self.emit(RuntimeEvent::Connected(connection.id()));
                }
                SessionEvent::Disconnected(reason) => {
                    self.detach(connection, &reason);
                }
            }
        }
    }

    /// Release everything tied to a closed connection. Idempotent.
    pub(crate) fn detach(&self, connection: &Arc<Connection>, reason: &str) {
        if connection.detached.swap(true, Ordering::AcqRel) {
            return;
        }
        connection.shutdown_outbound();
        let id = connection.id();
        if let Ok(mut connections) = locks::write(&self.inner.connections) {
            connections.remove(&id);
        }
        self.inner.metrics.connection_closed();
        if !connection.established.load(Ordering::Acquire) {
            self.inner.metrics.handshake_failed();
        }

        self.inner.registries.authenticator.forget(id);
        match self.inner.pending.fail_connection(id) {
            Ok(n) if n > 0 => debug!(connection_id = id, calls = n, "failed pending calls"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "could not fail pending calls"),
        }

        let closed_streams = locks::lock(&connection.streams)
            .map(|mut mux| mux.close_all(reason))
            .unwrap_or_default();
        for event in closed_streams {
            self.emit(RuntimeEvent::Stream {
                connection: id,
                event,
            });
        }

        match self.inner.side {
            Side::Server => self.owner_left(id),
            Side::Client => self.fail_spawn_waiters(),
        }

        info!(connection_id = id, %reason, "connection detached");
        self.emit(RuntimeEvent::Disconnected {
            connection: id,
            reason: reason.to_string(),
        });
        connection.wake();
    }

    fn dispatch(&self, connection: &Arc<Connection>, message: Message) -> Result<()> {
        match message {
            Message::RpcCall(call) => self.on_rpc_call(connection, call),
            Message::RpcResult(result) => self.on_rpc_result(connection, result),
            Message::ObjectManagement(management) => {
                self.on_object_management(connection, management)
            }
            Message::SyncVarUpdate(update) => self.on_sync_var_update(connection, update),
            Message::Stream(message) => self.on_stream_message(connection, message),
            Message::Custom(custom) => self.on_custom(connection, custom),
            other => Err(ProtocolError::UnexpectedMessage(format!(
                "{:?} after handshake",
                other.kind()
            ))),
        }
    }

    // RPC

    /// Call `method` on `target` through `connection` and wait for a result
    pub fn invoke(
        &self,
        connection: ConnectionId,
        target: RpcTarget,
        method: &str,
        args: Vec<Value>,
    ) -> Result<PendingCall> {
        let conn = self.connection(connection)?;
        let pending = self.inner.pending.register(conn.id())?;
        let call = self.build_call(target, method, pending.id(), args)?;
        if let Err(e) = self.send_to(&conn, Message::RpcCall(call)) {
            self.inner.pending.cancel(pending.id())?;
            return Err(e);
        }
        self.inner.metrics.rpc_call();
        Ok(pending)
    }

    /// Fire-and-forget call; the peer sends no result
    pub fn invoke_ignore(
        &self,
        connection: ConnectionId,
        target: RpcTarget,
        method: &str,
        args: Vec<Value>,
    ) -> Result<()> {
        let conn = self.connection(connection)?;
        let mut call = self.build_call(target, method, 0, args)?;
        call.ignore_result = true;
        self.send_to(&conn, Message::RpcCall(call))?;
        self.inner.metrics.rpc_call();
        Ok(())
    }

    fn build_call(
        &self,
        target: RpcTarget,
        method: &str,
        callback_id: u32,
        args: Vec<Value>,
    ) -> Result<RpcCall> {
        if let RpcTarget::Object(id) = target {
            self.inner.objects.get_active(id)?;
        }
        let args = args
            .iter()
            .map(|a| self.inner.codec.serialize(a))
            .collect::<Result<Vec<_>>>()?;
        Ok(RpcCall {
            target,
            method: method.to_string(),
            callback_id,
            ignore_result: false,
            args,
        })
    }

    fn on_rpc_call(&self, connection: &Arc<Connection>, call: RpcCall) -> Result<()> {
        let env = CallEnv {
            methods: &self.inner.registries.methods,
            objects: &self.inner.objects,
            codec: &self.inner.codec,
            resolver: self,
            local: self.inner.side,
        };
        if let Some(result) = handle_call(&env, connection.id(), &call) {
            if !result.success {
                self.inner.metrics.rpc_failure();
            }
            self.send_to(connection, Message::RpcResult(result))?;
        }
        Ok(())
    }

    fn on_rpc_result(&self, connection: &Arc<Connection>, result: RpcResult) -> Result<()> {
        let callback_id = result.callback_id;
        let outcome = result.into_outcome(&self.inner.codec, self);
        match self.inner.pending.complete(connection.id(), callback_id, outcome)? {
            Resolution::Delivered => {}
            Resolution::Discarded | Resolution::Unknown => {
                self.inner.metrics.rpc_result_discarded();
                debug!(
                    callback_id,
                    connection_id = connection.id(),
                    "result without a waiting call dropped"
                );
            }
        }
        Ok(())
    }

    // Custom packets

    pub fn send_custom<P: CustomPacket>(&self, connection: ConnectionId, packet: &P) -> Result<()> {
        let conn = self.connection(connection)?;
        let payload = self.inner.registries.packets.encode(packet)?;
        self.send_to(&conn, Message::Custom(payload))
    }

    /// Send to every connected peer; returns how many received it
    pub fn broadcast_custom<P: CustomPacket>(&self, packet: &P) -> Result<usize> {
        let payload = self.inner.registries.packets.encode(packet)?;
        let mut sent = 0;
        for conn in self.connected_peers() {
            match self.send_to(&conn, Message::Custom(payload.clone())) {
                Ok(()) => sent += 1,
                Err(e) => debug!(connection_id = conn.id(), error = %e, "broadcast skipped"),
            }
        }
        Ok(sent)
    }

    fn on_custom(&self, connection: &Arc<Connection>, custom: CustomPayload) -> Result<()> {
        let id = custom.id;
        if !self
            .inner
            .registries
            .packets
            .dispatch(connection.id(), &custom)?
        {
            debug!(connection_id = connection.id(), packet_id = id, "no handler for custom packet");
        }
        self.emit(RuntimeEvent::CustomPacket {
            connection: connection.id(),
            id,
        });
        Ok(())
    }

    // Streams

    fn with_streams<T>(
        &self,
        connection: ConnectionId,
        f: impl FnOnce(&mut StreamMux) -> Result<T>,
    ) -> Result<T> {
        let conn = self.connection(connection)?;
        if !conn.is_connected() {
            return Err(ProtocolError::NotConnected(connection));
        }
        let mut mux = locks::lock(&conn.streams)?;
        let value = f(&mut mux)?;
        self.send_stream_messages(&conn, mux.drain())?;
        Ok(value)
    }

    fn send_stream_messages(
        &self,
        connection: &Arc<Connection>,
        messages: Vec<StreamMessage>,
    ) -> Result<()> {
        for message in messages {
            if let StreamMessage::DataSend { data, .. } = &message {
                self.inner.metrics.stream_sent(data.len() as u64);
            }
            self.send_to(connection, Message::Stream(message))?;
        }
        Ok(())
    }

    /// Ask the peer to open a stream handled by its `handler`
    pub fn open_stream(
        &self,
        connection: ConnectionId,
        handler: &str,
        capacity: Option<u32>,
        metadata: Bytes,
    ) -> Result<u16> {
        self.with_streams(connection, |mux| mux.open(handler, capacity, metadata))
    }

    pub fn write_stream(&self, connection: ConnectionId, stream_id: u16, data: Bytes) -> Result<()> {
        self.with_streams(connection, |mux| mux.write(stream_id, data))
    }

    pub fn read_stream(&self, connection: ConnectionId, stream_id: u16, max: usize) -> Result<Bytes> {
        self.with_streams(connection, |mux| mux.read(stream_id, max))
    }

    pub fn request_stream(
        &self,
        connection: ConnectionId,
        stream_id: u16,
        offset: u64,
        length: u32,
    ) -> Result<()> {
        self.with_streams(connection, |mux| mux.request(stream_id, offset, length))
    }

    pub fn close_stream(&self, connection: ConnectionId, stream_id: u16, reason: &str) -> Result<()> {
        self.with_streams(connection, |mux| mux.close(stream_id, reason))
    }

    fn on_stream_message(&self, connection: &Arc<Connection>, message: StreamMessage) -> Result<()> {
        if let StreamMessage::DataSend { data, .. } = &message {
            self.inner.metrics.stream_received(data.len() as u64);
        }
        let event = {
            let mut mux = locks::lock(&connection.streams)?;
            let event = mux.handle(message, &self.inner.registries.streams);
            self.send_stream_messages(connection, mux.drain())?;
            event?
        };
        if let Some(event) = event {
            self.emit(RuntimeEvent::Stream {
                connection: connection.id(),
                event,
            });
        }
        Ok(())
    }
}

impl ReferenceResolver for Runtime {
    fn has_object(&self, id: NetworkId) -> bool {
        self.inner.objects.contains(id)
    }

    fn has_connection(&self, id: ConnectionId) -> bool {
        match self.inner.side {
            Side::Server => {
                id == SERVER_ID
                    || locks::read(&self.inner.connections)
                        .map(|c| c.contains_key(&id))
                        .unwrap_or(false)
            }
            // Clients only learn peer ids from the server
            Side::Client => true,
        }
    }
}
