//! # Protocol Layer
//!
//! Typed messages on top of frames, plus everything a connection goes through
//! before application traffic may flow.
//!
//! ## Components
//! - **Message**: the [`Message`](message::Message) union and body layouts
//! - **Wire**: sealing envelopes into frames (compression, encryption)
//! - **Handshake**: x25519 encryption upgrade with replay protection
//! - **Auth**: pluggable challenge/response providers
//! - **Session**: the per-connection state machine
//! - **Dispatcher**: collision-checked custom packet registry

pub mod auth;
pub mod dispatcher;
pub mod handshake;
pub mod message;
pub mod session;
pub mod wire;

pub use auth::{AuthDecision, AuthOutcome, AuthenticationProvider, NoAuthentication, SharedSecretAuthenticator};
pub use dispatcher::{CustomPacket, PacketRegistry};
pub use message::{Envelope, Message, PacketMeta};
pub use session::{ConnectionState, Session, SessionEvent, SessionSettings, Side};
pub use wire::WireFormat;
