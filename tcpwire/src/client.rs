//! TCP client: connect with a timeout, exchange request/response frames, close.
//!
//! A request either yields the server's response value or an explicit
//! [`ClientError::NoResponse`]. An empty response (`{}`, `null`, `[]`) is a
//! successful response and is never confused with "nothing came back".

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;

use crate::observer::{LifecycleObserver, TracingObserver};
use crate::wire::codec::{CodecError, JsonCodec, Value, ValueCodec};
use crate::wire::frame::{DEFAULT_MAX_FRAME_LENGTH, FrameError, FramedConnection};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub connect_timeout: Duration,
    pub max_frame_length: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(5),
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ClientConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

/// Why a request produced no response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoResponseReason {
    /// The request could not be written; the server had already gone away.
    PeerGone,
    /// The server closed the connection before a complete response arrived.
    Closed,
}

impl fmt::Display for NoResponseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::PeerGone => f.write_str("server went away before the request was sent"),
            Self::Closed => f.write_str("server closed the connection without responding"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("connection refused by {addr}")]
    ConnectionRefused { addr: String },

    #[error("timed out connecting to {addr} after {timeout:?}")]
    ConnectTimeout { addr: String, timeout: Duration },

    #[error("failed to connect to {addr}: {source}")]
    Connect {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("client is not connected")]
    NotConnected,

    #[error("no response received: {0}")]
    NoResponse(NoResponseReason),

    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl ClientError {
    pub fn is_no_response(&self) -> bool {
        matches!(self, Self::NoResponse(_))
    }
}

/// Client holding at most one connection.
pub struct Client {
    config: ClientConfig,
    codec: Arc<dyn ValueCodec>,
    observer: Arc<dyn LifecycleObserver>,
    connection: Option<FramedConnection<TcpStream>>,
    peer: Option<SocketAddr>,
}

impl Default for Client {
    fn default() -> Self {
        Self::new()
    }
}

impl Client {
    pub fn new() -> Self {
        Self::with_config(ClientConfig::default())
    }

    pub fn with_config(config: ClientConfig) -> Self {
        Self {
            config,
            codec: Arc::new(JsonCodec),
            observer: Arc::new(TracingObserver),
            connection: None,
            peer: None,
        }
    }

    pub fn with_codec(mut self, codec: impl ValueCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_observer(mut self, observer: impl LifecycleObserver) -> Self {
        self.observer = Arc::new(observer);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Open a connection, replacing any existing one.
    pub async fn connect(&mut self, host: &str, port: u16) -> Result<(), ClientError> {
        self.close().await;

        let addr = format!("{host}:{port}");
        let timeout = self.config.connect_timeout;
        let stream = match tokio::time::timeout(timeout, TcpStream::connect((host, port))).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(self.connect_failed(ClientError::ConnectionRefused { addr }));
            }
            Ok(Err(source)) => {
                let err = ClientError::Connect {
                    addr: addr.clone(),
                    source,
                };
                return Err(self.connect_failed(err));
            }
            Err(_) => {
                let err = ClientError::ConnectTimeout {
                    addr: addr.clone(),
                    timeout,
                };
                return Err(self.connect_failed(err));
            }
        };

        self.peer = stream.peer_addr().ok();
        if let Some(peer) = self.peer {
            self.observer.on_connect(peer);
        }
        self.connection = Some(FramedConnection::with_max_frame_length(
            stream,
            self.config.max_frame_length,
        ));
        Ok(())
    }

    /// Send one request and wait for its response.
    ///
    /// After [`ClientError::NoResponse`] or an I/O failure the connection is
    /// dropped and later calls return [`ClientError::NotConnected`] until
    /// [`Client::connect`] succeeds again.
    pub async fn send(&mut self, request: &Value) -> Result<Value, ClientError> {
        let payload = self.codec.encode(request)?;
        let connection = self.connection.as_mut().ok_or(ClientError::NotConnected)?;

        match connection.write_frame(payload).await {
            Ok(()) => {}
            Err(FrameError::PeerGone) => return Err(self.no_response(NoResponseReason::PeerGone)),
            // Nothing was written; the connection is still in sync.
            Err(e @ FrameError::TooLarge { .. }) => return Err(e.into()),
            Err(e) => {
                self.drop_connection();
                return Err(e.into());
            }
        }

        match connection.read_frame().await {
            Ok(Some(frame)) => Ok(self.codec.decode(&frame)?),
            Ok(None) => Err(self.no_response(NoResponseReason::Closed)),
            Err(e) => {
                self.drop_connection();
                Err(e.into())
            }
        }
    }

    /// Close the connection. Idempotent.
    pub async fn close(&mut self) {
        if let Some(mut connection) = self.connection.take() {
            if let Err(e) = connection.close().await {
                tracing::trace!(error = %e, "Socket close failed");
            }
            self.observer.on_disconnect(self.peer.take());
        }
    }

    fn connect_failed(&self, err: ClientError) -> ClientError {
        let addr = match &err {
            ClientError::ConnectionRefused { addr }
            | ClientError::ConnectTimeout { addr, .. }
            | ClientError::Connect { addr, .. } => addr.as_str(),
            _ => "",
        };
        self.observer.on_connect_failed(addr, &err);
        err
    }

    fn no_response(&mut self, reason: NoResponseReason) -> ClientError {
        self.observer.on_no_response(self.peer, reason);
        self.drop_connection();
        ClientError::NoResponse(reason)
    }

    fn drop_connection(&mut self) {
        self.connection = None;
        self.peer = None;
    }
}
