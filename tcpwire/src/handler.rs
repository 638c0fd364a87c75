//! Application callback invoked for every inbound request.

use async_trait::async_trait;

use crate::wire::codec::Value;

/// Trait for the request handler - maps one request value to one response value.
///
/// Called from the connection's own task, one request at a time per
/// connection. Handlers on different connections run concurrently.
///
/// Plain closures `Fn(Value) -> Value` implement this trait. They run on the
/// blocking thread pool, so a slow callback never stalls the accept loop or
/// other connections.
#[async_trait]
pub trait MessageHandler: Send + Sync + 'static {
    async fn handle(&self, request: Value) -> Value;
}

#[async_trait]
impl<F> MessageHandler for F
where
    F: Fn(Value) -> Value + Clone + Send + Sync + 'static,
{
    async fn handle(&self, request: Value) -> Value {
        let callback = self.clone();
        match tokio::task::spawn_blocking(move || callback(request)).await {
            Ok(response) => response,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            // Only happens while the runtime shuts down; the connection is
            // torn down with it.
            Err(e) => {
                tracing::debug!(error = %e, "Callback task cancelled");
                std::future::pending().await
            }
        }
    }
}
