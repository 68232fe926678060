//! # Core Protocol Components
//!
//! Byte cursors, the self-describing value codec and packet framing.
//!
//! ## Components
//! - **Buffer**: big-endian [`ByteWriter`](buffer::ByteWriter) and [`ByteReader`](buffer::ByteReader)
//! - **Value**: the closed [`Value`](value::Value) union and its tagged wire form
//! - **Serialization**: conversions, `ByteSerializable`, type wrappers and reference checks
//! - **Packet**: header, kinds and flags
//! - **Codec**: Tokio codec splitting a byte stream into frames
//!
//! ## Wire Format
//! ```text
//! [Size(4)] [Kind(1)] [Flags(1)] [Body(Size)]
//! ```
//!
//! ## Security
//! - Maximum body size is checked from the header before buffering
//! - Flags with both encryption bits are rejected on encode and decode
//! - Every read is bounds checked; trailing bytes are an error

pub mod buffer;
pub mod codec;
pub mod packet;
pub mod serialization;
pub mod value;
