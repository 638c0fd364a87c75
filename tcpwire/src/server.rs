//! TCP server: listener, accept loop and coordinated shutdown.
//!
//! Flow:
//! 1. `start()` binds, publishes the bound address, runs the accept loop
//! 2. Each accepted socket gets the next sequential id, a registry record and
//!    its own task (see `connection`)
//! 3. `stop()` stops the accept loop, closes the listening socket, then closes
//!    every registered connection and waits for its task to finish

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::{OnceCell, oneshot, watch};
use tokio_util::sync::CancellationToken;

use crate::connection::{ConnectionContext, handle_connection};
use crate::handler::MessageHandler;
use crate::observer::{LifecycleObserver, TracingObserver};
use crate::registry::{ConnectionId, ConnectionInfo, ConnectionRecord, ConnectionRegistry};
use crate::wire::codec::{JsonCodec, ValueCodec};
use crate::wire::frame::DEFAULT_MAX_FRAME_LENGTH;

/// Pause after a failed `accept()` (e.g. out of file descriptors).
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// Port 0 binds an ephemeral port; see [`Server::local_addr`].
    pub port: u16,
    /// Pending-connection queue length passed to `listen()`.
    pub backlog: u32,
    pub max_frame_length: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8000,
            backlog: 5,
            max_frame_length: DEFAULT_MAX_FRAME_LENGTH,
        }
    }
}

impl ServerConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            ..Self::default()
        }
    }

    pub fn with_host(mut self, host: impl Into<String>) -> Self {
        self.host = host.into();
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    pub fn with_max_frame_length(mut self, max_frame_length: usize) -> Self {
        self.max_frame_length = max_frame_length;
        self
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("invalid listen address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    #[error("server already started")]
    AlreadyStarted,

    #[error("server has been stopped")]
    Stopped,
}

/// Listener lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerState {
    /// Constructed, `start()` not called yet.
    Idle,
    /// `start()` is resolving and binding the address.
    Binding,
    /// Accept loop running.
    Listening(SocketAddr),
    /// Listening socket closed (or never opened). Terminal.
    Closed,
}

impl ListenerState {
    pub fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Listening(addr) => Some(*addr),
            _ => None,
        }
    }
}

/// Marks the listener closed when the accept loop ends, including when the
/// `start()` future is dropped.
struct ClosedOnDrop<'a>(&'a watch::Sender<ListenerState>);

impl Drop for ClosedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(ListenerState::Closed);
    }
}

/// Request/response server.
///
/// Share it behind an `Arc`: one task runs [`Server::start`], another calls
/// [`Server::stop`].
pub struct Server<H> {
    config: ServerConfig,
    handler: Arc<H>,
    codec: Arc<dyn ValueCodec>,
    observer: Arc<dyn LifecycleObserver>,
    registry: Arc<ConnectionRegistry>,
    next_id: AtomicU64,
    shutdown: CancellationToken,
    state: watch::Sender<ListenerState>,
    /// Set once every drained connection has been joined; holds the count.
    stopped: OnceCell<usize>,
}

impl<H: MessageHandler> Server<H> {
    pub fn new(config: ServerConfig, handler: H) -> Self {
        Self {
            config,
            handler: Arc::new(handler),
            codec: Arc::new(JsonCodec),
            observer: Arc::new(TracingObserver),
            registry: ConnectionRegistry::new(),
            next_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
            state: watch::Sender::new(ListenerState::Idle),
            stopped: OnceCell::new(),
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

    pub fn with_shared_observer(mut self, observer: Arc<dyn LifecycleObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn state(&self) -> ListenerState {
        *self.state.borrow()
    }

    /// True while the accept loop is running.
    pub fn is_running(&self) -> bool {
        matches!(self.state(), ListenerState::Listening(_))
    }

    /// Address the listener is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.state().local_addr()
    }

    /// Wait until `start()` has bound the listener.
    ///
    /// Returns `None` if the server stopped, or failed to bind, first.
    pub async fn wait_listening(&self) -> Option<SocketAddr> {
        let mut rx = self.state.subscribe();
        match rx
            .wait_for(|state| !matches!(state, ListenerState::Idle | ListenerState::Binding))
            .await
        {
            Ok(state) => state.local_addr(),
            Err(_) => None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.registry.snapshot()
    }

    /// Bind and run the accept loop until [`Server::stop`] is called.
    ///
    /// A server can be started once.
    pub async fn start(&self) -> Result<(), ServerError> {
        let mut previous = ListenerState::Idle;
        let claimed = self.state.send_if_modified(|state| {
            previous = *state;
            if *state == ListenerState::Idle {
                *state = ListenerState::Binding;
                true
            } else {
                false
            }
        });
        if !claimed {
            return Err(match previous {
                ListenerState::Closed => ServerError::Stopped,
                _ => ServerError::AlreadyStarted,
            });
        }
        let _closed = ClosedOnDrop(&self.state);

        let listener = self.bind().await?;
        let addr = listener.local_addr().map_err(|source| ServerError::Bind {
            addr: self.target(),
            source,
        })?;

        self.state.send_replace(ListenerState::Listening(addr));
        self.observer.on_listening(addr, self.codec.name());

        self.accept_loop(listener).await;
        Ok(())
    }

    /// Stop accepting, close every connection, and wait for all connection
    /// tasks to finish.
    ///
    /// On return the registry is empty and no connection task is running, for
    /// every caller: concurrent calls all wait for the same teardown.
    /// Idempotent; calling it before `start()` prevents the server from starting.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        self.state.send_if_modified(|state| {
            if *state == ListenerState::Idle {
                *state = ListenerState::Closed;
                true
            } else {
                false
            }
        });

        // No new registrations can happen once the accept loop has exited.
        let mut rx = self.state.subscribe();
        let _ = rx.wait_for(|state| *state == ListenerState::Closed).await;

        self.stopped.get_or_init(|| self.close_connections()).await;
    }

    async fn close_connections(&self) -> usize {
        let records = self.registry.drain();
        let closed = records.len();
        let results = futures::future::join_all(records.into_iter().map(|record| async move {
            let id = record.id();
            (id, record.close().await)
        }))
        .await;

        for (id, result) in results {
            if let Err(e) = result {
                self.observer.on_worker_failed(id, &e);
            }
        }

        self.observer.on_stopped(closed);
        closed
    }

    fn target(&self) -> String {
        format!("{}:{}", self.config.host, self.config.port)
    }

    async fn bind(&self) -> Result<TcpListener, ServerError> {
        let target = self.target();
        let addr = tokio::net::lookup_host(target.as_str())
            .await
            .map_err(|e| ServerError::InvalidAddress {
                addr: target.clone(),
                reason: e.to_string(),
            })?
            .next()
            .ok_or_else(|| ServerError::InvalidAddress {
                addr: target.clone(),
                reason: "no addresses resolved".to_string(),
            })?;

        let bind_error = |source: io::Error| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };

        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()
        } else {
            TcpSocket::new_v6()
        }
        .map_err(bind_error)?;
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(bind_error)?;
        socket.bind(addr).map_err(bind_error)?;
        socket.listen(self.config.backlog).map_err(bind_error)
    }

    async fn accept_loop(&self, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };

            match accepted {
                Ok((stream, peer)) => self.spawn_connection(stream, peer),
                Err(e) => {
                    self.observer.on_accept_error(&e);
                    tokio::select! {
                        _ = self.shutdown.cancelled() => break,
                        _ = tokio::time::sleep(ACCEPT_ERROR_BACKOFF) => {}
                    }
                }
            }
        }
        drop(listener);
    }

    fn spawn_connection(&self, stream: TcpStream, peer: SocketAddr) {
        let id = ConnectionId::new(self.next_id.fetch_add(1, Ordering::Relaxed));
        let shutdown = self.shutdown.child_token();

        let ctx = ConnectionContext {
            id,
            peer,
            handler: Arc::clone(&self.handler),
            codec: Arc::clone(&self.codec),
            observer: Arc::clone(&self.observer),
            registry: Arc::clone(&self.registry),
            shutdown: shutdown.clone(),
            max_frame_length: self.config.max_frame_length,
        };

        // The task must not start (and so cannot deregister) before its record exists.
        let (registered_tx, registered_rx) = oneshot::channel::<()>();
        let worker = tokio::spawn(async move {
            if registered_rx.await.is_ok() {
                handle_connection(ctx, stream).await;
            }
        });

        self.registry
            .register(ConnectionRecord::new(id, peer, shutdown, worker));
        self.observer.on_accept(id, peer);
        let _ = registered_tx.send(());
    }
}

/// Wait for SIGINT or (on unix) SIGTERM. Returns the signal name.
pub async fn wait_for_signal() -> io::Result<&'static str> {
    #[cfg(unix)]
    let mut sigterm = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())?;
    #[cfg(unix)]
    let terminate = async move {
        sigterm.recv().await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate => Ok("SIGTERM"),
    }
}
