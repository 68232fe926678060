//! Multiplexed byte streams carried inside a connection.

pub mod channel;
pub mod mux;

pub use channel::{chunk_data, StreamCapabilities, StreamSource, StreamState};
pub use mux::{
    StreamDecision, StreamEvent, StreamHandlers, StreamMessage, StreamMux, StreamOpen,
    DATA_ERROR,
};
