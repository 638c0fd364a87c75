//! Per-connection handling loop.
//!
//! Each accepted socket gets its own task running:
//! read frame → decode request → call handler → encode response → write frame,
//! until the peer disconnects, an I/O error occurs, or shutdown is ordered.
//! Request and response strictly alternate; the next request is never read
//! before the previous response is written.
//!
//! Every failure is local to the connection: it ends this loop and nothing else.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::sync::CancellationToken;

use crate::handler::MessageHandler;
use crate::observer::LifecycleObserver;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::wire::codec::{CodecError, ValueCodec};
use crate::wire::frame::{FrameError, FramedConnection};

/// Why a connection left the `Open` state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    /// Peer closed the connection, possibly mid-frame.
    PeerClosed,
    /// Writing the response failed because the peer went away.
    PeerGone,
    /// The server ordered the connection closed.
    Shutdown,
    /// A read, decode, encode or write error ended the connection.
    Error,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PeerClosed => "peer_closed",
            Self::PeerGone => "peer_gone",
            Self::Shutdown => "shutdown",
            Self::Error => "error",
        }
    }
}

impl std::fmt::Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("failed to read request frame: {0}")]
    Read(#[source] FrameError),

    #[error("invalid request payload: {0}")]
    Decode(#[source] CodecError),

    #[error("failed to encode response: {0}")]
    Encode(#[source] CodecError),

    #[error("failed to write response frame: {0}")]
    Write(#[source] FrameError),
}

/// Everything a connection task needs besides its socket.
pub(crate) struct ConnectionContext<H> {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub handler: Arc<H>,
    pub codec: Arc<dyn ValueCodec>,
    pub observer: Arc<dyn LifecycleObserver>,
    pub registry: Arc<ConnectionRegistry>,
    pub shutdown: CancellationToken,
    pub max_frame_length: usize,
}

/// Removes the connection from the registry when dropped, so the record goes
/// away even if the handler panics.
struct Registration<'a> {
    registry: &'a ConnectionRegistry,
    id: ConnectionId,
}

impl Drop for Registration<'_> {
    fn drop(&mut self) {
        self.registry.deregister(self.id);
    }
}

/// Run one connection to completion: Open → Closing → Closed.
pub(crate) async fn handle_connection<H, T>(ctx: ConnectionContext<H>, io: T)
where
    H: MessageHandler,
    T: AsyncRead + AsyncWrite + Unpin,
{
    let registration = Registration {
        registry: &ctx.registry,
        id: ctx.id,
    };
    let mut conn = FramedConnection::with_max_frame_length(io, ctx.max_frame_length);
    let mut requests = 0u64;

    let outcome = serve_requests(&ctx, &mut conn, &mut requests).await;

    ctx.registry.mark_closing(ctx.id);
    let reason = match outcome {
        Ok(reason) => reason,
        Err(e) => {
            ctx.observer.on_connection_error(ctx.id, &e);
            CloseReason::Error
        }
    };

    // On shutdown the peer may not be reading; drop the socket without flushing.
    if reason != CloseReason::Shutdown
        && let Err(e) = conn.close().await
    {
        tracing::trace!(connection_id = %ctx.id, error = %e, "Socket close failed");
    }
    drop(conn);
    drop(registration);

    ctx.observer.on_close(ctx.id, ctx.peer, reason, requests);
}

async fn serve_requests<H, T>(
    ctx: &ConnectionContext<H>,
    conn: &mut FramedConnection<T>,
    requests: &mut u64,
) -> Result<CloseReason, ConnectionError>
where
    H: MessageHandler,
    T: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
            frame = conn.read_frame() => frame.map_err(ConnectionError::Read)?,
        };
        let Some(payload) = frame else {
            return Ok(CloseReason::PeerClosed);
        };

        let request = ctx.codec.decode(&payload).map_err(ConnectionError::Decode)?;
        let response = tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
            response = ctx.handler.handle(request) => response,
        };
        *requests += 1;
        let payload = ctx.codec.encode(&response).map_err(ConnectionError::Encode)?;

        tokio::select! {
            biased;
            _ = ctx.shutdown.cancelled() => return Ok(CloseReason::Shutdown),
            written = conn.write_frame(payload) => match written {
                Ok(()) => {}
                Err(FrameError::PeerGone) => return Ok(CloseReason::PeerGone),
                Err(e) => return Err(ConnectionError::Write(e)),
            },
        }
    }
}
