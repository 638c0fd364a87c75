//! Wire format for tcpwire connections.
//!
//! # Architecture
//!
//! - **frame**: `[u32 big-endian length][payload]` framing over any byte stream
//! - **codec**: structured value serialization for frame payloads

pub mod codec;
pub mod frame;
