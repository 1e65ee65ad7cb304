use crate::config::ServerOptions;
use crate::error::NetError;
use crate::server::{self, ServerHandle, ServerInstance};
use crate::service::ServiceFactory;
use dashmap::DashMap;
use std::sync::{Arc, OnceLock};

/// Process-wide port → server instance mapping.
///
/// One long-lived registry object owns the map; entries are inserted by
/// [`create`](Self::create) and removed when the returned handle is
/// disposed. The registry is keyed by the requested TCP port alone,
/// independent of bind address — two instances cannot share a port even on
/// different addresses.
#[derive(Clone, Default)]
pub struct ServerRegistry {
    inner: Arc<DashMap<u16, Arc<ServerInstance>>>,
}

impl ServerRegistry {
    /// Creates an empty registry. Most callers want [`global`](Self::global);
    /// separate registries are useful for tests.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> &'static ServerRegistry {
        static GLOBAL: OnceLock<ServerRegistry> = OnceLock::new();
        GLOBAL.get_or_init(ServerRegistry::new)
    }

    /// Registers a server on `port`, binds its listener, and starts its
    /// accept loop. The port check and the registration are a single atomic
    /// step: under concurrent calls for one port, exactly one succeeds and
    /// the rest observe [`NetError::PortInUse`].
    ///
    /// # Errors
    ///
    /// [`NetError::PortInUse`] if a live instance is already registered,
    /// [`NetError::Config`] on invalid options, [`NetError::Bind`] /
    /// [`NetError::Tls`] if the listener cannot be set up — in which case
    /// the reservation is rolled back.
    pub async fn create(
        &self,
        port: u16,
        options: ServerOptions,
        factory: Arc<dyn ServiceFactory>,
    ) -> Result<ServerHandle, NetError> {
        options.validate().map_err(NetError::Config)?;

        let instance = match self.inner.entry(port) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                return Err(NetError::PortInUse(port));
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                let instance = Arc::new(ServerInstance::new(port));
                entry.insert(Arc::clone(&instance));
                instance
            }
        };

        match server::start(Arc::clone(&instance), options, factory).await {
            Ok(()) => Ok(ServerHandle::new(instance, self.clone())),
            Err(e) => {
                self.inner.remove(&port);
                Err(e)
            }
        }
    }

    /// Returns the instance registered on `port`, or `None` if no instance
    /// is registered — including after disposal.
    #[must_use]
    pub fn get_instance(&self, port: u16) -> Option<Arc<ServerInstance>> {
        self.inner.get(&port).map(|entry| Arc::clone(entry.value()))
    }

    /// Whether the instance registered on `port` is currently listening.
    /// `false` when no instance is registered.
    #[must_use]
    pub fn is_listening(&self, port: u16) -> bool {
        self.get_instance(port)
            .is_some_and(|instance| instance.is_listening())
    }

    pub(crate) fn remove(&self, port: u16) {
        self.inner.remove(&port);
    }

    /// Number of registered instances.
    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    /// Returns `true` if no instance is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::EchoFactory;

    fn echo() -> Arc<dyn ServiceFactory> {
        Arc::new(EchoFactory)
    }

    async fn free_port() -> u16 {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    fn local_options() -> ServerOptions {
        ServerOptions {
            bind_addr: "127.0.0.1".parse().unwrap(),
            ..ServerOptions::default()
        }
    }

    #[tokio::test]
    async fn get_instance_none_when_unregistered() {
        let registry = ServerRegistry::new();
        assert!(registry.get_instance(1).is_none());
        assert!(!registry.is_listening(1));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn create_registers_and_listens() {
        let registry = ServerRegistry::new();
        let port = free_port().await;
        let handle = registry.create(port, local_options(), echo()).await.unwrap();

        assert!(handle.is_listening());
        assert!(registry.is_listening(port));
        assert_eq!(registry.len(), 1);
        let instance = registry.get_instance(port).unwrap();
        assert_eq!(instance.port(), port);
        assert_eq!(instance.local_addr().unwrap().port(), port);

        handle.dispose().await;
        assert!(registry.get_instance(port).is_none());
        assert!(!registry.is_listening(port));
    }

    #[tokio::test]
    async fn second_create_on_same_port_fails() {
        let registry = ServerRegistry::new();
        let port = free_port().await;
        let first = registry.create(port, local_options(), echo()).await.unwrap();

        match registry.create(port, local_options(), echo()).await {
            Err(NetError::PortInUse(p)) => assert_eq!(p, port),
            other => panic!("expected PortInUse, got {other:?}"),
        }
        // The surviving listener is unaffected.
        assert!(first.is_listening());
        first.dispose().await;
    }

    #[tokio::test]
    async fn dispose_then_recreate_succeeds() {
        let registry = ServerRegistry::new();
        let port = free_port().await;

        let first = registry.create(port, local_options(), echo()).await.unwrap();
        first.dispose().await;

        let second = registry.create(port, local_options(), echo()).await.unwrap();
        assert!(second.is_listening());
        second.dispose().await;
    }

    #[tokio::test]
    async fn invalid_options_are_rejected_before_registration() {
        let registry = ServerRegistry::new();
        let mut options = local_options();
        options.max_pdu_length = 1;
        match registry.create(0, options, echo()).await {
            Err(NetError::Config(msg)) => assert!(msg.contains("max_pdu_length")),
            other => panic!("expected Config error, got {other:?}"),
        }
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failed_bind_rolls_back_registration() {
        let registry = ServerRegistry::new();
        // Hold the port with a plain listener outside the registry.
        let blocker = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = blocker.local_addr().unwrap().port();

        match registry.create(port, local_options(), echo()).await {
            Err(NetError::Bind { .. }) => {}
            other => panic!("expected Bind error, got {other:?}"),
        }
        assert!(registry.get_instance(port).is_none());
    }
}
