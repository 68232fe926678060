//! Async timeout wrappers and default durations.

use crate::error::{ProtocolError, Result};
use std::future::Future;
use std::time::Duration;

/// Default timeout for connects and request/response waits
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(5);

/// Interval between keep-alive pings
pub const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(5);

/// Silence after which a connection is considered dead
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(20);

/// Maximum time a connection may spend before reaching `Connected`
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Grace period for server shutdown
pub const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

/// Await `future`, mapping an elapsed deadline to `ProtocolError::Timeout`.
pub async fn with_timeout<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = T>,
{
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| ProtocolError::Timeout)
}

/// Like [`with_timeout`] for futures that already return a protocol `Result`.
pub async fn with_timeout_error<F, T>(future: F, duration: Duration) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    with_timeout(future, duration).await?
}
