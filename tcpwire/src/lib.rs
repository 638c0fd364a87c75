//! tcpwire: length-prefixed request/response messaging over TCP.
//!
//! Every message is a frame: a 4-byte big-endian payload length followed by
//! that many bytes of encoded value. A [`Server`] accepts connections, runs a
//! [`MessageHandler`] for each request and writes back its response; a
//! [`Client`] sends one request at a time and waits for the reply.

pub mod client;
pub mod connection;
pub mod handler;
pub mod logging;
pub mod observer;
pub mod registry;
pub mod server;
pub mod wire;

pub use client::{Client, ClientConfig, ClientError, NoResponseReason};
pub use connection::{CloseReason, ConnectionError};
pub use handler::MessageHandler;
pub use logging::{LogConfig, LogHandler, LoggingError, init_logging};
pub use observer::{LifecycleObserver, TracingObserver};
pub use registry::{ConnectionId, ConnectionInfo, ConnectionRegistry, ConnectionState};
pub use server::{ListenerState, Server, ServerConfig, ServerError, wait_for_signal};
pub use wire::codec::{CodecError, JsonCodec, Value, ValueCodec};
pub use wire::frame::{DEFAULT_MAX_FRAME_LENGTH, FrameCodec, FrameError, FramedConnection};
