//! Connecting side: one session to one server.

use crate::config::NetworkConfig;
use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::{ConnectionState, Session, Side};
use crate::replication::spawn::SpawnOptions;
use crate::rpc::invoke::RpcTarget;
use crate::runtime::context::{Connection, Registries, Runtime};
use crate::runtime::scheduler::{Scheduler, SchedulerConfig};
use crate::transport::framed::{ByteStream, FramedTransport};
use crate::transport::tcp;
use crate::utils::timeout::with_timeout_error;
use crate::{ConnectionId, NetworkId, SERVER_ID};
use std::fmt::Display;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

pub struct Client {
    runtime: Runtime,
    scheduler: Arc<Scheduler>,
    connection: Arc<Connection>,
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish()
    }
}

impl Client {
    /// Connect over TCP and start the handshake
    #[instrument(skip(config, registries))]
    pub async fn connect_tcp(
        addr: impl Display + std::fmt::Debug,
        config: NetworkConfig,
        registries: Registries,
    ) -> Result<Self> {
        let transport = tcp::connect(
            &addr.to_string(),
            config.client.connection_timeout,
            config.transport.max_payload_size,
        )
        .await?;
        Self::attach(transport, config, registries)
    }

    /// Start the handshake over an already connected transport
    pub fn attach<T: ByteStream>(
        transport: FramedTransport<T>,
        config: NetworkConfig,
        registries: Registries,
    ) -> Result<Self> {
        let runtime = Runtime::new(Side::Client, config, registries)?;
        let scheduler = Scheduler::start(runtime.clone(), SchedulerConfig::client(runtime.config()));

        let mut session = Session::client(runtime.settings(), transport.peer(), Instant::now());
        session.start()?;
        let connection = match scheduler.attach(transport, session) {
            Ok(connection) => connection,
            Err(e) => {
                let scheduler = Arc::clone(&scheduler);
                tokio::spawn(async move { scheduler.shutdown().await });
                return Err(e);
            }
        };
        debug!(peer = %connection.peer(), "client handshake started");
        Ok(Self {
            runtime,
            scheduler,
            connection,
        })
    }

    /// Resolve once the handshake completes; fails with the reason if the
    /// connection closes first
    pub async fn wait_connected(&self) -> Result<()> {
        let mut status = self.connection.subscribe_state();
        loop {
            let state = status.borrow_and_update().clone();
            match state {
                ConnectionState::Connected => {
                    info!(client_id = self.id(), "client connected");
                    return Ok(());
                }
                ConnectionState::Disconnected(reason) => {
                    return Err(ProtocolError::HandshakeError(reason));
                }
                _ => {}
            }
            if status.changed().await.is_err() {
                return Err(ProtocolError::ConnectionClosed);
            }
        }
    }

    /// [`Client::wait_connected`] bounded by the connect timeout
    pub async fn wait_connected_timeout(&self) -> Result<()> {
        let limit = self.runtime.config().client.connection_timeout;
        with_timeout_error(self.wait_connected(), limit).await
    }

    /// Resolve once the connection is closed, with the reason
    pub async fn wait_disconnected(&self) -> String {
        let mut status = self.connection.subscribe_state();
        loop {
            if let ConnectionState::Disconnected(reason) = status.borrow_and_update().clone() {
                return reason;
            }
            if status.changed().await.is_err() {
                return "connection dropped".into();
            }
        }
    }

    /// The id the server assigned, once known
    pub fn id(&self) -> ConnectionId {
        self.runtime.local_id()
    }

    pub fn state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_connected()
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    /// Call a method on the server's connection handler and wait for the result
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_target(RpcTarget::Connection, method, args).await
    }

    pub async fn call_object(
        &self,
        network_id: NetworkId,
        method: &str,
        args: Vec<Value>,
    ) -> Result<Value> {
        self.call_target(RpcTarget::Object(network_id), method, args)
            .await
    }

    async fn call_target(&self, target: RpcTarget, method: &str, args: Vec<Value>) -> Result<Value> {
        let pending = self.runtime.invoke(SERVER_ID, target, method, args)?;
        pending
            .wait_timeout(self.runtime.config().client.response_timeout)
            .await
    }

    pub async fn spawn(&self, type_name: &str, options: SpawnOptions) -> Result<NetworkId> {
        self.runtime.spawn(type_name, options).await
    }

    pub fn destroy(&self, network_id: NetworkId) -> Result<()> {
        self.runtime.destroy(network_id)
    }

    pub fn set_sync_var(&self, network_id: NetworkId, name: &str, value: Value) -> Result<()> {
        self.runtime.set_sync_var(network_id, name, value)
    }

    pub fn set_ready(&self) -> Result<()> {
        self.runtime.set_ready(SERVER_ID)
    }

    /// Close the connection and stop the worker
    pub async fn disconnect(&self, reason: &str) -> Result<()> {
        match self.runtime.disconnect(SERVER_ID, reason) {
            Ok(()) | Err(ProtocolError::NotConnected(_)) => {}
            Err(e) => return Err(e),
        }
        self.runtime.detach(&self.connection, reason);
        self.scheduler.shutdown().await;
        Ok(())
    }
}
