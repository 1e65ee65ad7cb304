use crate::association::Association;
use futures_util::future::BoxFuture;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

/// One per-connection protocol handler instance.
///
/// The handler owns the negotiated association, including the underlying
/// stream, and is responsible for ending the session at the right protocol
/// point (release, abort, or plain drop).
pub trait Service: Send + 'static {
    /// Drives one established association to completion.
    fn run(self: Box<Self>, association: Association) -> BoxFuture<'static, anyhow::Result<()>>;
}

/// Creates a fresh [`Service`] for every accepted connection.
pub trait ServiceFactory: Send + Sync + 'static {
    /// Instantiates the handler for a connection from `peer`.
    fn create(&self, peer: SocketAddr) -> Box<dyn Service>;
}

struct FnService<F>(F);

impl<F, Fut> Service for FnService<F>
where
    F: FnOnce(Association) -> Fut + Send + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn run(self: Box<Self>, association: Association) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin((self.0)(association))
    }
}

struct FnFactory<F>(F);

impl<F, Fut> ServiceFactory for FnFactory<F>
where
    F: Fn(Association) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    fn create(&self, _peer: SocketAddr) -> Box<dyn Service> {
        Box::new(FnService(self.0.clone()))
    }
}

/// Wraps an async closure into a [`ServiceFactory`]; every accepted
/// connection gets its own clone of the closure.
pub fn service_fn<F, Fut>(f: F) -> Arc<dyn ServiceFactory>
where
    F: Fn(Association) -> Fut + Send + Sync + Clone + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnFactory(f))
}

/// Loopback service: reflects every received data unit back to the peer
/// until the association is released.
pub struct EchoService;

impl Service for EchoService {
    fn run(self: Box<Self>, mut association: Association) -> BoxFuture<'static, anyhow::Result<()>> {
        Box::pin(async move {
            while let Some(payload) = association.recv().await? {
                association.send(&payload).await?;
            }
            Ok(())
        })
    }
}

/// Factory producing an [`EchoService`] per connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct EchoFactory;

impl ServiceFactory for EchoFactory {
    fn create(&self, _peer: SocketAddr) -> Box<dyn Service> {
        Box::new(EchoService)
    }
}
