//! The async runtime that drives sessions over real transports.
//!
//! [`Runtime`] holds registries and shared state, [`Scheduler`] spreads
//! connections over a fixed worker pool, and [`Server`] / [`Client`] are the
//! entry points applications use.

pub mod client;
pub mod context;
pub mod objects;
pub mod scheduler;
pub mod server;

pub use client::Client;
pub use context::{Connection, RegistryBuilder, Registries, Runtime, RuntimeEvent};
pub use scheduler::{Scheduler, SchedulerConfig};
pub use server::Server;
