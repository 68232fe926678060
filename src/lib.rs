//! # synclink
//!
//! Connection-oriented RPC and network-object replication over any reliable,
//! ordered byte stream.
//!
//! A server and many clients exchange typed messages, call methods on each
//! other and keep replicated "network objects" and their fields consistent
//! under a single-writer ownership model.
//!
//! ## Layers
//! - [`core`]: byte cursors, the self-describing [`Value`](core::value::Value)
//!   codec, packet headers and the frame codec
//! - [`protocol`]: messages, sealing (compression and encryption), the
//!   handshake state machine, authentication and custom packets
//! - [`rpc`]: method registry, call dispatch and pending-call correlation
//! - [`replication`]: network objects, spawn ordering and sync vars
//! - [`stream`]: chunked, flow-controlled byte channels
//! - [`transport`]: framed transports over TCP or in-memory pipes
//! - [`runtime`]: the shared context, connection scheduler, server and client
//!
//! ## Example
//! ```rust,no_run
//! use synclink::config::NetworkConfig;
//! use synclink::runtime::{Client, RegistryBuilder, Server};
//!
//! # async fn demo() -> synclink::error::Result<()> {
//! let registries = RegistryBuilder::new().build();
//! let config = NetworkConfig::default();
//!
//! let server = Server::bind(config.clone(), registries.clone()).await?;
//! let addr = server.local_addr()?;
//! tokio::spawn(server.run());
//!
//! let client = Client::connect_tcp(addr, config, registries).await?;
//! client.wait_connected().await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod core;
pub mod error;
pub mod protocol;
pub mod replication;
pub mod rpc;
pub mod runtime;
pub mod stream;
pub mod transport;
pub mod utils;

pub use crate::core::value::{SerializedData, TypeTag, Value};
pub use crate::error::{ProtocolError, Result};
pub use crate::runtime::{Client, Runtime, RuntimeEvent, Server};

/// Numeric id of a connection as assigned by the server
pub type ConnectionId = u32;

/// Numeric id of a replicated object
pub type NetworkId = u32;

/// The server always identifies itself with this id
pub const SERVER_ID: ConnectionId = 0;
