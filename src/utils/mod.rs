//! # Utility Modules
//!
//! Supporting utilities for cryptography, compression, logging, timing and
//! locking.
//!
//! ## Components
//! - **Crypto**: XChaCha20-Poly1305 AEAD encryption for upgraded connections
//! - **Compression**: LZ4 and Zstd with size limits and entropy-aware thresholds
//! - **Logging**: `tracing-subscriber` setup from [`LoggingConfig`](crate::config::LoggingConfig)
//! - **Time**: Wall-clock timestamps for keep-alives and replay protection
//! - **Timeout**: Async timeout wrappers
//! - **Replay Cache**: TTL-based nonce deduplication for the encryption upgrade
//! - **Metrics**: Per-runtime atomic counters
//! - **Locks**: Poison-aware lock helpers

pub mod compression;
pub mod crypto;
pub mod locks;
pub mod logging;
pub mod metrics;
pub mod replay_cache;
pub mod time;
pub mod timeout;

pub use replay_cache::{CacheKey, ReplayCache};
