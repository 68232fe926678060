//! Listening side: accepts transports, assigns client ids and hands the
//! connections to the scheduler.

use crate::config::NetworkConfig;
use crate::error::constants::ERR_SERVER_FULL;
use crate::error::{ProtocolError, Result};
use crate::protocol::session::{Session, Side};
use crate::runtime::context::{Registries, Runtime};
use crate::runtime::scheduler::{Scheduler, SchedulerConfig};
use crate::transport::framed::{ByteStream, FramedTransport};
use crate::transport::tcp;
use crate::ConnectionId;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

const SHUTDOWN_POLL: Duration = Duration::from_millis(50);

pub struct Server {
    runtime: Runtime,
    scheduler: Arc<Scheduler>,
    listener: Option<TcpListener>,
    shutdown_tx: mpsc::Sender<()>,
    shutdown_rx: mpsc::Receiver<()>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("runtime", &self.runtime)
            .field("listening", &self.listener.is_some())
            .finish()
    }
}

impl Server {
    /// A server without a listener; feed it transports with
    /// [`Server::attach_transport`]
    pub fn new(config: NetworkConfig, registries: Registries) -> Result<Self> {
        let runtime = Runtime::new(Side::Server, config, registries)?;
        let scheduler = Scheduler::start(
            runtime.clone(),
            SchedulerConfig::from(&runtime.config().server),
        );
        let (shutdown_tx, shutdown_rx) = mpsc::channel(1);
        Ok(Self {
            runtime,
            scheduler,
            listener: None,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// Bind a TCP listener on `config.server.address`
    pub async fn bind(config: NetworkConfig, registries: Registries) -> Result<Self> {
        let address = config.server.address.clone();
        let mut server = Self::new(config, registries)?;
        server.listener = Some(tcp::bind(&address).await?);
        Ok(server)
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        match &self.listener {
            Some(listener) => Ok(listener.local_addr()?),
            None => Err(ProtocolError::ConfigError("server has no listener".into())),
        }
    }

    pub fn runtime(&self) -> &Runtime {
        &self.runtime
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Sending on the handle stops [`Server::run`]
    pub fn shutdown_handle(&self) -> mpsc::Sender<()> {
        self.shutdown_tx.clone()
    }

    /// Start the handshake on an already connected transport.
    ///
    /// A full server answers with a refusal and closes the transport.
    pub async fn attach_transport<T: ByteStream>(
        &self,
        mut transport: FramedTransport<T>,
    ) -> Result<ConnectionId> {
        let capacity = self.runtime.config().server.capacity();
        if self.runtime.connection_count() >= capacity || !self.scheduler.has_capacity() {
            warn!(peer = %transport.peer(), capacity, "server full, refusing connection");
            self.runtime.metrics().connection_rejected();
            let frame = Session::rejecting_frame(&self.runtime.settings(), ERR_SERVER_FULL)?;
            if let Err(e) = transport.send(frame).await {
                debug!(error = %e, "refusal not delivered");
            }
            transport.close().await?;
            return Err(ProtocolError::Rejected(ERR_SERVER_FULL.into()));
        }

        let client_id = self.runtime.allocate_client_id();
        let session = Session::server(
            self.runtime.settings(),
            client_id,
            transport.peer().to_string(),
            Instant::now(),
        );
        let connection = self.scheduler.attach(transport, session)?;
        info!(connection_id = connection.id(), peer = %connection.peer(), "connection accepted");
        Ok(connection.id())
    }

    /// Accept connections until the shutdown handle fires, then close every
    /// connection and stop the scheduler.
    #[instrument(skip(self))]
    pub async fn run(mut self) -> Result<()> {
        let Some(listener) = self.listener.take() else {
            return Err(ProtocolError::ConfigError("server has no listener".into()));
        };
        let max_body = self.runtime.config().transport.max_payload_size;

        loop {
            tokio::select! {
                _ = self.shutdown_rx.recv() => {
                    info!("shutting down server");
                    break;
                }
                accepted = tcp::accept(&listener, max_body) => {
                    match accepted {
                        Ok((transport, peer)) => {
                            if let Err(e) = self.attach_transport(transport).await {
                                debug!(%peer, error = %e, "connection not attached");
                            }
                        }
                        Err(e) => error!(error = %e, "accept failed"),
                    }
                }
            }
        }

        drop(listener);
        self.shutdown().await;
        Ok(())
    }

    /// Like [`Server::run`], stopping on Ctrl+C
    pub async fn run_until_signal(self) -> Result<()> {
        let handle = self.shutdown_handle();
        tokio::spawn(async move {
            if let Ok(()) = tokio::signal::ctrl_c().await {
                info!("received Ctrl+C, shutting down");
                let _ = handle.send(()).await;
            }
        });
        self.run().await
    }

    /// Disconnect everyone, wait up to `shutdown_timeout` for the sessions to
    /// close, then stop the workers.
    pub async fn shutdown(&self) {
        for id in self.runtime.connection_ids() {
            if let Err(e) = self.runtime.disconnect(id, "server shutting down") {
                debug!(connection_id = id, error = %e, "disconnect during shutdown");
            }
        }

        let deadline = tokio::time::Instant::now() + self.runtime.config().server.shutdown_timeout;
        while self.runtime.connection_count() > 0 {
            if tokio::time::Instant::now() >= deadline {
                warn!(remaining = self.runtime.connection_count(), "shutdown timeout reached, forcing exit");
                break;
            }
            tokio::time::sleep(SHUTDOWN_POLL).await;
        }
        self.scheduler.shutdown().await;
        self.runtime.metrics().log_metrics();
    }
}
