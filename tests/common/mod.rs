//! Shared helpers: in-memory server/client pairs and polling.

#![allow(dead_code, clippy::unwrap_used, clippy::expect_used)]

use std::time::Duration;
use synclink::config::NetworkConfig;
use synclink::protocol::session::ConnectionState;
use synclink::runtime::{Client, Registries, RuntimeEvent, Server};
use synclink::transport::memory;
use synclink::ConnectionId;
use tokio::sync::broadcast;

pub const WAIT: Duration = Duration::from_secs(5);

/// Small worker pool, short ticks
pub fn test_config() -> NetworkConfig {
    NetworkConfig::default_with_overrides(|c| {
        c.server.workers = 2;
        c.server.connections_per_worker = 8;
        c.server.tick_interval = Duration::from_millis(20);
        c.server.shutdown_timeout = Duration::from_secs(2);
        c.client.response_timeout = Duration::from_secs(5);
    })
}

/// Attach a fresh client to `server` over an in-memory pipe and wait until
/// both ends are connected. Returns the client and its id on the server.
pub async fn connect(
    server: &Server,
    config: &NetworkConfig,
    registries: Registries,
) -> (Client, ConnectionId) {
    let (server_end, client_end) = memory::pair(config.transport.max_payload_size);
    let id = server.attach_transport(server_end).await.expect("server attach");
    let client = Client::attach(client_end, config.clone(), registries).expect("client attach");
    client.wait_connected_timeout().await.expect("client connected");
    let runtime = server.runtime().clone();
    eventually(|| runtime.connection_state(id) == Some(ConnectionState::Connected)).await;
    (client, id)
}

/// Poll `check` until it holds or the wait expires
pub async fn eventually<F: Fn() -> bool>(check: F) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "condition not reached within {WAIT:?}"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Next event matching `pick`, skipping others
pub async fn next_event<T>(
    events: &mut broadcast::Receiver<RuntimeEvent>,
    mut pick: impl FnMut(RuntimeEvent) -> Option<T>,
) -> T {
    tokio::time::timeout(WAIT, async {
        loop {
            match events.recv().await {
                Ok(event) => {
                    if let Some(found) = pick(event) {
                        return found;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("event not received in time")
}
