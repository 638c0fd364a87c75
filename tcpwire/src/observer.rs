//! Lifecycle observer - the single place connection events are reported.
//!
//! Server and client loops call into a [`LifecycleObserver`] at fixed points
//! (listening, accept, close, error, connect, shutdown) instead of formatting
//! log lines themselves. [`TracingObserver`] is the default and emits
//! structured `tracing` events.

use std::io;
use std::net::SocketAddr;

use tokio::task::JoinError;

use crate::client::{ClientError, NoResponseReason};
use crate::connection::{CloseReason, ConnectionError};
use crate::registry::ConnectionId;

/// Hooks for connection lifecycle events. All methods default to no-ops.
pub trait LifecycleObserver: Send + Sync + 'static {
    /// The listener is bound and accepting, decoding requests with `codec`.
    fn on_listening(&self, _addr: SocketAddr, _codec: &'static str) {}

    /// A connection was accepted and registered.
    fn on_accept(&self, _id: ConnectionId, _peer: SocketAddr) {}

    /// `accept()` failed; the accept loop keeps running.
    fn on_accept_error(&self, _error: &io::Error) {}

    /// A connection ended because of an error.
    fn on_connection_error(&self, _id: ConnectionId, _error: &ConnectionError) {}

    /// A connection finished teardown and left the registry.
    fn on_close(&self, _id: ConnectionId, _peer: SocketAddr, _reason: CloseReason, _requests: u64) {}

    /// A connection task panicked or was aborted.
    fn on_worker_failed(&self, _id: ConnectionId, _error: &JoinError) {}

    /// The server finished shutting down.
    fn on_stopped(&self, _closed_connections: usize) {}

    /// The client connected.
    fn on_connect(&self, _peer: SocketAddr) {}

    /// The client failed to connect.
    fn on_connect_failed(&self, _addr: &str, _error: &ClientError) {}

    /// The client sent a request but no response came back.
    fn on_no_response(&self, _peer: Option<SocketAddr>, _reason: NoResponseReason) {}

    /// The client closed its connection.
    fn on_disconnect(&self, _peer: Option<SocketAddr>) {}
}

/// Observer that reports through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl LifecycleObserver for TracingObserver {
    fn on_listening(&self, addr: SocketAddr, codec: &'static str) {
        tracing::info!(%addr, codec, "Server started");
    }

    fn on_accept(&self, id: ConnectionId, peer: SocketAddr) {
        tracing::info!(connection_id = %id, %peer, "New connection");
    }

    fn on_accept_error(&self, error: &io::Error) {
        tracing::warn!(%error, "Failed to accept connection");
    }

    fn on_connection_error(&self, id: ConnectionId, error: &ConnectionError) {
        tracing::warn!(connection_id = %id, %error, "Connection error");
    }

    fn on_close(&self, id: ConnectionId, peer: SocketAddr, reason: CloseReason, requests: u64) {
        tracing::info!(connection_id = %id, %peer, %reason, requests, "Connection closed");
    }

    fn on_worker_failed(&self, id: ConnectionId, error: &JoinError) {
        tracing::error!(connection_id = %id, %error, "Connection task terminated abnormally");
    }

    fn on_stopped(&self, closed_connections: usize) {
        tracing::info!(closed_connections, "Server has been terminated");
    }

    fn on_connect(&self, peer: SocketAddr) {
        tracing::info!(%peer, "Connected");
    }

    fn on_connect_failed(&self, addr: &str, error: &ClientError) {
        tracing::error!(addr, %error, "Connection failed");
    }

    fn on_no_response(&self, peer: Option<SocketAddr>, reason: NoResponseReason) {
        tracing::warn!(?peer, %reason, "No response received from server");
    }

    fn on_disconnect(&self, peer: Option<SocketAddr>) {
        tracing::info!(?peer, "Connection closed");
    }
}
