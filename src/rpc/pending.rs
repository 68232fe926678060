//! Correlation of outgoing calls with their results.
//!
//! Callback ids are a local monotonic counter (0 is never issued). Every
//! registered call is consumed exactly once: by its result, by an explicit
//! cancel, or by its connection closing. Results for cancelled ids are
//! discarded silently. A result only matches a call when it arrives on the
//! connection the call was sent on.

use crate::core::value::Value;
use crate::error::{ProtocolError, Result};
use crate::utils::locks;
use crate::ConnectionId;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

/// Cancelled ids remembered for discarding late results
const CANCELLED_MEMORY: usize = 4096;

/// What happened to an incoming result
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Delivered,
    /// The caller cancelled; the result was dropped
    Discarded,
    /// No call with this id was ever issued or it was already consumed
    Unknown,
}

struct Waiter {
    connection: ConnectionId,
    sender: oneshot::Sender<Result<Value>>,
}

#[derive(Default)]
struct Inner {
    next_id: u32,
    waiting: HashMap<u32, Waiter>,
    cancelled: HashMap<u32, ConnectionId>,
    cancelled_order: VecDeque<u32>,
}

impl Inner {
    fn allocate(&mut self) -> u32 {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0
                && !self.waiting.contains_key(&self.next_id)
                && !self.cancelled.contains_key(&self.next_id)
            {
                return self.next_id;
            }
        }
    }

    fn remember_cancelled(&mut self, id: u32, connection: ConnectionId) {
        if self.cancelled.insert(id, connection).is_none() {
            self.cancelled_order.push_back(id);
        }
        while self.cancelled_order.len() > CANCELLED_MEMORY {
            if let Some(old) = self.cancelled_order.pop_front() {
                self.cancelled.remove(&old);
            }
        }
    }
}

/// Table of calls awaiting a result
#[derive(Default)]
pub struct PendingCalls {
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for PendingCalls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCalls").finish_non_exhaustive()
    }
}

impl PendingCalls {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Issue a callback id for a call sent on `connection`
    pub fn register(self: &Arc<Self>, connection: ConnectionId) -> Result<PendingCall> {
        let (sender, receiver) = oneshot::channel();
        let mut inner = locks::lock(&self.inner)?;
        let id = inner.allocate();
        inner.waiting.insert(id, Waiter { connection, sender });
        trace!(callback_id = id, connection_id = connection, "call registered");
        Ok(PendingCall {
            id,
            connection,
            receiver,
            calls: Arc::clone(self),
        })
    }

    /// Hand a result that arrived on `source` to its caller
    pub fn complete(
        &self,
        source: ConnectionId,
        id: u32,
        outcome: Result<Value>,
    ) -> Result<Resolution> {
        let mut inner = locks::lock(&self.inner)?;
        match inner.waiting.get(&id).map(|w| w.connection) {
            Some(expected) if expected == source => {
                if let Some(waiter) = inner.waiting.remove(&id) {
                    // The receiver may have been dropped without cancelling;
                    // that is still a delivery from the table's point of view.
                    let _ = waiter.sender.send(outcome);
                }
                return Ok(Resolution::Delivered);
            }
            Some(expected) => {
                warn!(
                    callback_id = id,
                    expected,
                    connection_id = source,
                    "result from a connection the call was not sent to"
                );
                return Ok(Resolution::Unknown);
            }
            None => {}
        }
        if inner.cancelled.get(&id) == Some(&source) {
            inner.cancelled.remove(&id);
            debug!(callback_id = id, "discarding result of cancelled call");
            return Ok(Resolution::Discarded);
        }
        Ok(Resolution::Unknown)
    }

    /// Suppress delivery of the result for `id`
    pub fn cancel(&self, id: u32) -> Result<bool> {
        let mut inner = locks::lock(&self.inner)?;
        match inner.waiting.remove(&id) {
            Some(waiter) => {
                let connection = waiter.connection;
                let _ = waiter.sender.send(Err(ProtocolError::CallCancelled(id)));
                inner.remember_cancelled(id, connection);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Fail every call issued on `connection`
    pub fn fail_connection(&self, connection: ConnectionId) -> Result<usize> {
        let mut inner = locks::lock(&self.inner)?;
        let ids: Vec<u32> = inner
            .waiting
            .iter()
            .filter(|(_, w)| w.connection == connection)
            .map(|(id, _)| *id)
            .collect();
        for id in &ids {
            if let Some(waiter) = inner.waiting.remove(id) {
                let _ = waiter.sender.send(Err(ProtocolError::ConnectionClosed));
            }
        }
        Ok(ids.len())
    }

    pub fn len(&self) -> usize {
        locks::lock(&self.inner).map(|i| i.waiting.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle to one outstanding call
#[derive(Debug)]
pub struct PendingCall {
    id: u32,
    connection: ConnectionId,
    receiver: oneshot::Receiver<Result<Value>>,
    calls: Arc<PendingCalls>,
}

impl PendingCall {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    /// Wait for the result
    pub async fn wait(self) -> Result<Value> {
        let id = self.id;
        match self.receiver.await {
            Ok(outcome) => outcome,
            Err(_) => Err(ProtocolError::CallCancelled(id)),
        }
    }

    /// Wait at most `limit`; on expiry the call is cancelled
    pub async fn wait_timeout(self, limit: Duration) -> Result<Value> {
        let id = self.id;
        let calls = Arc::clone(&self.calls);
        match tokio::time::timeout(limit, self.receiver).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(ProtocolError::CallCancelled(id)),
            Err(_) => {
                calls.cancel(id)?;
                Err(ProtocolError::Timeout)
            }
        }
    }

    /// Drop interest in the result
    pub fn cancel(self) -> Result<()> {
        self.calls.cancel(self.id).map(|_| ())
    }

    /// Run `continuation` with the result on the Tokio runtime
    pub fn then<F>(self, continuation: F) -> tokio::task::JoinHandle<()>
    where
        F: FnOnce(Result<Value>) + Send + 'static,
    {
        tokio::spawn(async move { continuation(self.wait().await) })
    }
}
