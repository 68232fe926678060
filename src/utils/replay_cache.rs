//! Replay cache for the encryption upgrade.
//!
//! Every `PublicKey` upgrade message carries a fresh 16-byte nonce and a
//! millisecond timestamp. The server records each `(peer, nonce)` pair for a
//! bounded time window and refuses to process the same pair twice, so a
//! captured upgrade request cannot be replayed against a new connection.

use crate::error::{constants, ProtocolError, Result};
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Identity of a recorded upgrade request
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    /// Remote endpoint the request arrived from
    pub peer: String,
    /// Nonce chosen by the peer
    pub nonce: [u8; 16],
}

#[derive(Debug, Clone, Copy)]
struct Seen {
    recorded_at: Instant,
    timestamp: u64,
}

/// TTL-bounded set of seen upgrade nonces with FIFO eviction
#[derive(Debug)]
pub struct ReplayCache {
    seen: HashMap<CacheKey, Seen>,
    order: VecDeque<CacheKey>,
    ttl: Duration,
    capacity: usize,
}

impl ReplayCache {
    /// Five minute window, ten thousand entries
    pub fn new() -> Self {
        Self::with_settings(Duration::from_secs(300), 10_000)
    }

    pub fn with_settings(ttl: Duration, capacity: usize) -> Self {
        Self {
            seen: HashMap::new(),
            order: VecDeque::new(),
            ttl,
            capacity: capacity.max(1),
        }
    }

    /// Record `(peer, nonce)` and fail if it was already recorded inside the
    /// window. A nonce repeated with a different timestamp is still a replay:
    /// nonces are single use.
    pub fn check_and_record(&mut self, peer: &str, nonce: &[u8; 16], timestamp: u64) -> Result<()> {
        self.expire();

        let key = CacheKey {
            peer: peer.to_owned(),
            nonce: *nonce,
        };

        if let Some(previous) = self.seen.get(&key) {
            warn!(
                peer,
                timestamp,
                previous_timestamp = previous.timestamp,
                "Upgrade nonce reused"
            );
            return Err(ProtocolError::SecurityError(constants::ERR_REPLAY_ATTACK.into()));
        }

        while self.seen.len() >= self.capacity {
            match self.order.pop_front() {
                Some(oldest) => {
                    self.seen.remove(&oldest);
                }
                None => break,
            }
        }

        self.seen.insert(
            key.clone(),
            Seen {
                recorded_at: Instant::now(),
                timestamp,
            },
        );
        self.order.push_back(key);
        Ok(())
    }

    fn expire(&mut self) {
        let now = Instant::now();
        let mut expired = 0usize;
        // Entries are recorded in order, so expiry only ever trims the front
        while let Some(front) = self.order.front() {
            let stale = match self.seen.get(front) {
                Some(seen) => now.duration_since(seen.recorded_at) >= self.ttl,
                None => true,
            };
            if !stale {
                break;
            }
            if let Some(key) = self.order.pop_front() {
                self.seen.remove(&key);
                expired += 1;
            }
        }
        if expired > 0 {
            debug!(expired, "Expired replay cache entries");
        }
    }

    pub fn len(&self) -> usize {
        self.seen.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    pub fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new()
    }
}
