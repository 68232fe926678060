//! Per-connection handshake and liveness state machine.
//!
//! A [`Session`] does no I/O. Incoming [`Frame`]s are fed to
//! [`Session::receive`], which advances the handshake and hands back
//! application envelopes once the connection is `Connected`. Anything the
//! session wants to send is queued and collected with
//! [`Session::drain_frames`]; lifecycle changes are collected with
//! [`Session::take_events`].
//!
//! ```text
//! Connecting ─▶ HandshakeData ─▶ [EncryptionUpgrade] ─▶ Authenticating ─▶ Ready ─▶ Connected
//!      └──────────────┴────────────────┴────────────────────┴──────────┴──────────┴─▶ Disconnected(reason)
//! ```

use crate::config::{EncryptionPolicy, NetworkConfig};
use crate::core::packet::{Frame, PacketFlags, PacketKind};
use crate::error::{constants, ProtocolError, Result};
use crate::protocol::auth::{AuthDecision, AuthenticationProvider};
use crate::protocol::dispatcher::PacketRegistry;
use crate::protocol::handshake::{self, ClientUpgrade, ServerUpgrade};
use crate::protocol::message::{
    AuthMessage, ClientHello, Envelope, Message, PacketMeta, ServerHello, StateNotice,
    UpgradeMessage, UNASSIGNED_ID,
};
use crate::protocol::wire::WireFormat;
use crate::utils::crypto::Crypto;
use crate::utils::locks;
use crate::utils::replay_cache::ReplayCache;
use crate::utils::time::send_timestamp;
use crate::{ConnectionId, SERVER_ID};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Which end of the connection this process is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Side {
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    HandshakeData,
    EncryptionUpgrade,
    Authenticating,
    /// Authenticated; readiness exchange in progress
    Ready,
    /// Both sides ready; application traffic flows
    Connected,
    Disconnected(String),
}

impl ConnectionState {
    fn in_handshake(&self) -> bool {
        matches!(
            self,
            ConnectionState::Connecting
                | ConnectionState::HandshakeData
                | ConnectionState::EncryptionUpgrade
                | ConnectionState::Authenticating
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Connecting => f.write_str("connecting"),
            ConnectionState::HandshakeData => f.write_str("handshake"),
            ConnectionState::EncryptionUpgrade => f.write_str("encryption upgrade"),
            ConnectionState::Authenticating => f.write_str("authenticating"),
            ConnectionState::Ready => f.write_str("ready"),
            ConnectionState::Connected => f.write_str("connected"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected ({reason})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// Client only: the server assigned our id
    IdAssigned(ConnectionId),
    Authenticated,
    Connected,
    Disconnected(String),
}

/// Settings shared by every session of one runtime
pub struct SessionSettings {
    pub side: Side,
    pub protocol_name: String,
    pub protocol_version: u32,
    pub encryption: EncryptionPolicy,
    pub authenticator: Arc<dyn AuthenticationProvider>,
    pub packets: Arc<PacketRegistry>,
    pub wire: WireFormat,
    pub auto_ready: bool,
    pub handshake_timeout: Duration,
    pub keepalive_interval: Duration,
    pub keepalive_timeout: Duration,
    pub upgrade_max_age: Duration,
    pub replay_cache: Arc<Mutex<ReplayCache>>,
}

impl fmt::Debug for SessionSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionSettings")
            .field("side", &self.side)
            .field("protocol_name", &self.protocol_name)
            .field("protocol_version", &self.protocol_version)
            .field("encryption", &self.encryption)
            .finish_non_exhaustive()
    }
}

impl SessionSettings {
    pub fn from_config(
        side: Side,
        config: &NetworkConfig,
        authenticator: Arc<dyn AuthenticationProvider>,
        packets: Arc<PacketRegistry>,
    ) -> Self {
        let encryption = match side {
            Side::Client => config.client.encryption,
            Side::Server => config.server.encryption,
        };
        Self {
            side,
            protocol_name: config.protocol.name.clone(),
            protocol_version: config.protocol.version,
            encryption,
            authenticator,
            packets,
            wire: WireFormat::from_config(&config.transport),
            auto_ready: config.protocol.auto_ready,
            handshake_timeout: config.protocol.handshake_timeout,
            keepalive_interval: config.protocol.keepalive_interval,
            keepalive_timeout: config.protocol.keepalive_timeout,
            upgrade_max_age: config.protocol.upgrade_max_age,
            replay_cache: Arc::new(Mutex::new(ReplayCache::new())),
        }
    }
}

pub struct Session {
    settings: Arc<SessionSettings>,
    state: ConnectionState,
    local_id: ConnectionId,
    remote_id: ConnectionId,
    peer: String,

    cipher: Option<Crypto>,
    require_encrypted: bool,
    client_upgrade: Option<ClientUpgrade>,
    server_upgrade: Option<ServerUpgrade>,

    auth_client_initiates: bool,
    authenticated: bool,
    local_ready: bool,
    remote_ready: bool,

    outbound: VecDeque<Frame>,
    events: Vec<SessionEvent>,

    started_at: Instant,
    last_received: Instant,
    last_ping: Option<Instant>,
    rtt: Option<Duration>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("side", &self.settings.side)
            .field("state", &self.state)
            .field("local_id", &self.local_id)
            .field("remote_id", &self.remote_id)
            .field("peer", &self.peer)
            .field("encrypted", &self.cipher.is_some())
            .finish_non_exhaustive()
    }
}

impl Session {
    fn new(
        settings: Arc<SessionSettings>,
        local_id: ConnectionId,
        remote_id: ConnectionId,
        peer: String,
        now: Instant,
    ) -> Self {
        Self {
            settings,
            state: ConnectionState::Connecting,
            local_id,
            remote_id,
            peer,
            cipher: None,
            require_encrypted: false,
            client_upgrade: None,
            server_upgrade: None,
            auth_client_initiates: false,
            authenticated: false,
            local_ready: false,
            remote_ready: false,
            outbound: VecDeque::new(),
            events: Vec::new(),
            started_at: now,
            last_received: now,
            last_ping: None,
            rtt: None,
        }
    }

    /// Session for the connecting side; call [`Session::start`] next
    pub fn client(settings: Arc<SessionSettings>, peer: impl Into<String>, now: Instant) -> Self {
        Self::new(settings, UNASSIGNED_ID, SERVER_ID, peer.into(), now)
    }

    /// Session for an accepted connection that will be assigned `client_id`
    pub fn server(
        settings: Arc<SessionSettings>,
        client_id: ConnectionId,
        peer: impl Into<String>,
        now: Instant,
    ) -> Self {
        Self::new(settings, SERVER_ID, client_id, peer.into(), now)
    }

    /// Seal a one-off refusal for a connection that never gets a session
    pub fn rejecting_frame(settings: &SessionSettings, reason: &str) -> Result<Frame> {
        let envelope = Envelope {
            meta: PacketMeta {
                destination: UNASSIGNED_ID,
                source: SERVER_ID,
                sent_at: send_timestamp(),
            },
            message: Message::ServerHello(ServerHello::rejected(reason)),
        };
        settings.wire.seal(&envelope, PacketFlags::NONE, None)
    }

    pub fn side(&self) -> Side {
        self.settings.side
    }

    pub fn state(&self) -> &ConnectionState {
        &self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn is_disconnected(&self) -> bool {
        matches!(self.state, ConnectionState::Disconnected(_))
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated
    }

    pub fn is_encrypted(&self) -> bool {
        self.cipher.is_some()
    }

    pub fn local_id(&self) -> ConnectionId {
        self.local_id
    }

    pub fn remote_id(&self) -> ConnectionId {
        self.remote_id
    }

    /// The id of the client end of this connection
    pub fn connection_id(&self) -> ConnectionId {
        match self.settings.side {
            Side::Client => self.local_id,
            Side::Server => self.remote_id,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn rtt(&self) -> Option<Duration> {
        self.rtt
    }

    pub fn drain_frames(&mut self) -> Vec<Frame> {
        self.outbound.drain(..).collect()
    }

    pub fn has_outbound(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    /// Client: send the protocol hello
    pub fn start(&mut self) -> Result<()> {
        if self.settings.side != Side::Client || self.state != ConnectionState::Connecting {
            return Err(ProtocolError::HandshakeError(
                "only a fresh client session can start".into(),
            ));
        }
        let hello = ClientHello {
            protocol_name: self.settings.protocol_name.clone(),
            protocol_version: self.settings.protocol_version,
            encryption: self.settings.encryption,
        };
        self.send_control(Message::ClientHello(hello), PacketFlags::NONE)?;
        self.state = ConnectionState::HandshakeData;
        debug!(peer = %self.peer, "client hello sent");
        Ok(())
    }

    /// Queue an outgoing message. Application messages need `Connected`.
    pub fn send(&mut self, message: Message) -> Result<()> {
        if self.is_disconnected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        if message.is_application() && !self.is_connected() {
            return Err(ProtocolError::NotConnected(self.remote_id));
        }
        self.send_control(message, PacketFlags::NONE)
    }

    fn send_control(&mut self, message: Message, flags: PacketFlags) -> Result<()> {
        let envelope = Envelope {
            meta: PacketMeta {
                destination: self.remote_id,
                source: self.local_id,
                sent_at: send_timestamp(),
            },
            message,
        };
        let frame = self
            .settings
            .wire
            .seal(&envelope, flags, self.cipher.as_ref())?;
        self.outbound.push_back(frame);
        Ok(())
    }

    /// Signal local readiness. Requires authentication.
    pub fn set_ready(&mut self) -> Result<()> {
        if !self.authenticated {
            return Err(ProtocolError::UnexpectedMessage(
                "readiness before authentication".into(),
            ));
        }
        if self.local_ready {
            return Ok(());
        }
        self.local_ready = true;
        self.send_control(Message::Readiness { ready: true }, PacketFlags::NONE)?;
        self.check_connected();
        Ok(())
    }

    /// Close with a best-effort notice to the peer
    pub fn close(&mut self, reason: impl Into<String>) {
        if self.is_disconnected() {
            return;
        }
        let reason = reason.into();
        if self.state != ConnectionState::Connecting || self.settings.side == Side::Client {
            if let Err(e) = self.send_control(
                Message::ConnectionState(StateNotice::disconnecting(reason.clone())),
                PacketFlags::NONE,
            ) {
                debug!(error = %e, "could not queue disconnect notice");
            }
        }
        self.enter_disconnected(reason);
    }

    /// Mark the session closed without notifying the peer
    pub fn terminate(&mut self, reason: impl Into<String>) {
        if !self.is_disconnected() {
            self.enter_disconnected(reason.into());
        }
    }

    fn enter_disconnected(&mut self, reason: String) {
        info!(peer = %self.peer, connection_id = self.connection_id(), %reason, "session closed");
        self.events.push(SessionEvent::Disconnected(reason.clone()));
        self.state = ConnectionState::Disconnected(reason);
    }

    /// Enforce timeouts and send keep-alive pings
    pub fn tick(&mut self, now: Instant) -> Result<()> {
        if self.is_disconnected() {
            return Ok(());
        }
        if self.state.in_handshake()
            && now.duration_since(self.started_at) > self.settings.handshake_timeout
        {
            return Err(ProtocolError::HandshakeTimeout);
        }
        if now.duration_since(self.last_received) > self.settings.keepalive_timeout {
            return Err(ProtocolError::KeepAliveTimeout);
        }
        if matches!(self.state, ConnectionState::Ready | ConnectionState::Connected) {
            let due = self
                .last_ping
                .map_or(true, |at| now.duration_since(at) >= self.settings.keepalive_interval);
            if due {
                self.send_control(
                    Message::KeepAlive {
                        timestamp: send_timestamp(),
                        reply: false,
                    },
                    PacketFlags::NONE,
                )?;
                self.last_ping = Some(now);
            }
        }
        Ok(())
    }

    /// Feed one frame. Returns the envelope when it carries application data.
    ///
    /// Errors for which [`ProtocolError::is_fatal`] holds mean the caller must
    /// close the session; others only drop this frame.
    pub fn receive(&mut self, frame: Frame, now: Instant) -> Result<Option<Envelope>> {
        if self.is_disconnected() {
            return Err(ProtocolError::ConnectionClosed);
        }
        self.last_received = now;

        let envelope = self
            .settings
            .wire
            .open(&frame, self.cipher.as_ref(), self.require_encrypted)?;

        if frame.flags().contains(PacketFlags::ASYMMETRIC)
            != matches!(
                envelope.message,
                Message::EncryptionUpgrade(UpgradeMessage::KeyExchange { .. })
            )
        {
            return Err(ProtocolError::SecurityError(format!(
                "asymmetric flag misused on {:?}",
                frame.kind()
            )));
        }

        match envelope.message {
            Message::ConnectionState(notice) => {
                self.terminate(format!("closed by peer: {}", notice.reason));
                Ok(None)
            }
            Message::KeepAlive { timestamp, reply } => {
                if reply {
                    let elapsed = send_timestamp().saturating_sub(timestamp).max(0);
                    self.rtt = Some(Duration::from_millis(elapsed as u64));
                } else {
                    self.send_control(
                        Message::KeepAlive {
                            timestamp,
                            reply: true,
                        },
                        PacketFlags::NONE,
                    )?;
                }
                Ok(None)
            }
            Message::ClientHello(hello) => self.on_client_hello(hello).map(|()| None),
            Message::ServerHello(hello) => self.on_server_hello(hello).map(|()| None),
            Message::PacketMapping(mapping) => {
                if self.settings.side != Side::Client {
                    return Err(self.unexpected(PacketKind::PacketMapping));
                }
                self.settings.packets.verify_mapping(&mapping)?;
                Ok(None)
            }
            Message::EncryptionUpgrade(step) => self.on_upgrade(step).map(|()| None),
            Message::Authentication(step) => self.on_auth(step).map(|()| None),
            Message::Readiness { ready } => {
                if !self.authenticated {
                    return Err(self.unexpected(PacketKind::Readiness));
                }
                self.remote_ready = ready;
                self.check_connected();
                Ok(None)
            }
            message => {
                if self.is_connected() {
                    Ok(Some(Envelope {
                        meta: envelope.meta,
                        message,
                    }))
                } else {
                    warn!(peer = %self.peer, kind = ?message.kind(), state = %self.state, "dropping early application message");
                    Err(ProtocolError::UnexpectedMessage(format!(
                        "{:?} while {}",
                        message.kind(),
                        self.state
                    )))
                }
            }
        }
    }

    fn unexpected(&self, kind: PacketKind) -> ProtocolError {
        ProtocolError::HandshakeError(format!(
            "{}: {kind:?} while {}",
            constants::ERR_UNEXPECTED_MESSAGE,
            self.state
        ))
    }

    /// Queue a refusal and close
    fn refuse(&mut self, reason: String) -> Result<()> {
        self.send_control(
            Message::ServerHello(ServerHello::rejected(reason.clone())),
            PacketFlags::NONE,
        )?;
        self.enter_disconnected(reason);
        Ok(())
    }

    fn on_client_hello(&mut self, hello: ClientHello) -> Result<()> {
        if self.settings.side != Side::Server || self.state != ConnectionState::Connecting {
            return Err(self.unexpected(PacketKind::ClientHandshake));
        }
        self.state = ConnectionState::HandshakeData;

        if hello.protocol_name != self.settings.protocol_name
            || hello.protocol_version != self.settings.protocol_version
        {
            self.refuse(format!(
                "unsupported protocol {} v{}",
                hello.protocol_name, hello.protocol_version
            ))?;
            return Err(ProtocolError::UnsupportedProtocol {
                name: hello.protocol_name,
                version: hello.protocol_version,
            });
        }

        let upgrade = match EncryptionPolicy::negotiate(hello.encryption, self.settings.encryption) {
            Some(upgrade) => upgrade,
            None => {
                self.refuse(constants::ERR_ENCRYPTION_POLICY_MISMATCH.into())?;
                return Err(ProtocolError::SecurityError(
                    constants::ERR_ENCRYPTION_POLICY_MISMATCH.into(),
                ));
            }
        };

        self.auth_client_initiates = self.settings.authenticator.client_initiates();
        let reply = ServerHello {
            accepted: true,
            reason: String::new(),
            client_id: self.remote_id,
            upgrade,
            auth_client_initiates: self.auth_client_initiates,
            protocol_name: self.settings.protocol_name.clone(),
            protocol_version: self.settings.protocol_version,
        };
        self.send_control(Message::ServerHello(reply), PacketFlags::NONE)?;
        self.send_control(
            Message::PacketMapping(self.settings.packets.mapping()),
            PacketFlags::NONE,
        )?;
        debug!(connection_id = self.remote_id, upgrade, "client hello accepted");

        if upgrade {
            self.state = ConnectionState::EncryptionUpgrade;
            Ok(())
        } else {
            self.enter_auth()
        }
    }

    fn on_server_hello(&mut self, hello: ServerHello) -> Result<()> {
        if self.settings.side != Side::Client || self.state != ConnectionState::HandshakeData {
            return Err(self.unexpected(PacketKind::ServerHandshake));
        }
        if !hello.accepted {
            let reason = format!("rejected by server: {}", hello.reason);
            self.enter_disconnected(reason.clone());
            return Err(ProtocolError::HandshakeError(reason));
        }
        if hello.protocol_name != self.settings.protocol_name
            || hello.protocol_version != self.settings.protocol_version
        {
            return Err(ProtocolError::UnsupportedProtocol {
                name: hello.protocol_name,
                version: hello.protocol_version,
            });
        }
        let acceptable = match self.settings.encryption {
            EncryptionPolicy::Disabled => !hello.upgrade,
            EncryptionPolicy::Required => hello.upgrade,
            EncryptionPolicy::Optional => true,
        };
        if !acceptable {
            return Err(ProtocolError::SecurityError(
                constants::ERR_ENCRYPTION_POLICY_MISMATCH.into(),
            ));
        }

        self.local_id = hello.client_id;
        self.events.push(SessionEvent::IdAssigned(hello.client_id));
        self.auth_client_initiates = hello.auth_client_initiates;
        debug!(connection_id = hello.client_id, upgrade = hello.upgrade, "server hello accepted");

        if hello.upgrade {
            let (state, message) = handshake::client_upgrade_init()?;
            self.client_upgrade = Some(state);
            self.send_control(Message::EncryptionUpgrade(message), PacketFlags::NONE)?;
            self.state = ConnectionState::EncryptionUpgrade;
            Ok(())
        } else {
            self.enter_auth()
        }
    }

    fn on_upgrade(&mut self, step: UpgradeMessage) -> Result<()> {
        if self.state != ConnectionState::EncryptionUpgrade {
            return Err(self.unexpected(PacketKind::EncryptionUpgrade));
        }
        match (self.settings.side, step) {
            (
                Side::Server,
                UpgradeMessage::PublicKey {
                    public,
                    nonce,
                    timestamp,
                },
            ) if self.server_upgrade.is_none() => {
                let (state, key, reply) = {
                    let mut cache = locks::lock(&self.settings.replay_cache)?;
                    handshake::server_upgrade_respond(
                        public,
                        nonce,
                        timestamp,
                        &self.peer,
                        self.settings.upgrade_max_age.as_secs(),
                        &mut cache,
                    )?
                };
                self.send_control(Message::EncryptionUpgrade(reply), PacketFlags::ASYMMETRIC)?;
                self.cipher = Some(Crypto::new(&key));
                self.require_encrypted = true;
                self.server_upgrade = Some(state);
                Ok(())
            }
            (
                Side::Client,
                UpgradeMessage::KeyExchange {
                    public,
                    nonce,
                    nonce_verification,
                    wrapped_key,
                },
            ) => {
                let state = self.client_upgrade.take().ok_or_else(|| {
                    ProtocolError::HandshakeError(constants::ERR_CLIENT_NONCE_NOT_FOUND.into())
                })?;
                let (key, confirm) = handshake::client_upgrade_accept(
                    state,
                    public,
                    nonce,
                    nonce_verification,
                    &wrapped_key,
                )?;
                self.cipher = Some(Crypto::new(&key));
                self.require_encrypted = true;
                self.send_control(Message::EncryptionUpgrade(confirm), PacketFlags::NONE)?;
                debug!(connection_id = self.local_id, "encryption upgrade complete");
                self.enter_auth()
            }
            (Side::Server, UpgradeMessage::Confirm { nonce_verification }) => {
                let state = self.server_upgrade.take().ok_or_else(|| {
                    ProtocolError::HandshakeError(constants::ERR_SERVER_NONCE_NOT_FOUND.into())
                })?;
                handshake::server_upgrade_finalize(&state, nonce_verification)?;
                debug!(connection_id = self.remote_id, "encryption upgrade complete");
                self.enter_auth()
            }
            _ => Err(self.unexpected(PacketKind::EncryptionUpgrade)),
        }
    }

    fn is_auth_initiator(&self) -> bool {
        self.auth_client_initiates == (self.settings.side == Side::Client)
    }

    fn enter_auth(&mut self) -> Result<()> {
        self.state = ConnectionState::Authenticating;
        if self.is_auth_initiator() {
            let payload = self
                .settings
                .authenticator
                .begin(self.connection_id())?;
            self.send_control(
                Message::Authentication(AuthMessage::Challenge { payload }),
                PacketFlags::NONE,
            )?;
        }
        Ok(())
    }

    fn on_auth(&mut self, step: AuthMessage) -> Result<()> {
        if self.state != ConnectionState::Authenticating {
            return Err(self.unexpected(PacketKind::Authentication));
        }
        let initiator = self.is_auth_initiator();
        let connection = self.connection_id();
        match step {
            AuthMessage::Challenge { payload } if !initiator => {
                let outcome = self
                    .settings
                    .authenticator
                    .authenticate(connection, &payload)?;
                let (approved, message) = match &outcome.decision {
                    AuthDecision::Approved => (true, String::new()),
                    AuthDecision::Rejected(reason) => (false, reason.clone()),
                };
                self.send_control(
                    Message::Authentication(AuthMessage::Response {
                        approved,
                        message: message.clone(),
                        payload: outcome.response,
                    }),
                    PacketFlags::NONE,
                )?;
                if !approved {
                    self.enter_disconnected(message.clone());
                    return Err(ProtocolError::AuthenticationRejected(message));
                }
                Ok(())
            }
            AuthMessage::Response {
                approved,
                message,
                payload,
            } if initiator => {
                let decision = self
                    .settings
                    .authenticator
                    .handle_result(connection, approved, &payload)?;
                match decision {
                    AuthDecision::Approved => {
                        self.send_control(
                            Message::Authentication(AuthMessage::Outcome {
                                approved: true,
                                message: String::new(),
                            }),
                            PacketFlags::NONE,
                        )?;
                        self.on_authenticated()
                    }
                    AuthDecision::Rejected(reason) => {
                        let reason = if approved || message.is_empty() {
                            reason
                        } else {
                            message
                        };
                        self.send_control(
                            Message::Authentication(AuthMessage::Outcome {
                                approved: false,
                                message: reason.clone(),
                            }),
                            PacketFlags::NONE,
                        )?;
                        self.enter_disconnected(reason.clone());
                        Err(ProtocolError::AuthenticationRejected(reason))
                    }
                }
            }
            AuthMessage::Outcome { approved, message } if !initiator => {
                if approved {
                    self.on_authenticated()
                } else {
                    self.enter_disconnected(message.clone());
                    Err(ProtocolError::AuthenticationRejected(message))
                }
            }
            _ => Err(self.unexpected(PacketKind::Authentication)),
        }
    }

    fn on_authenticated(&mut self) -> Result<()> {
        self.authenticated = true;
        self.state = ConnectionState::Ready;
        self.events.push(SessionEvent::Authenticated);
        debug!(connection_id = self.connection_id(), "authenticated");
        if self.settings.auto_ready {
            self.set_ready()?;
        }
        Ok(())
    }

    fn check_connected(&mut self) {
        if self.state == ConnectionState::Ready
            && self.authenticated
            && self.local_ready
            && self.remote_ready
        {
            self.state = ConnectionState::Connected;
            self.events.push(SessionEvent::Connected);
            info!(peer = %self.peer, connection_id = self.connection_id(), encrypted = self.cipher.is_some(), "connection established");
        }
    }
}
