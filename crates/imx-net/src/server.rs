//! Server instance state, the accept loop, and the caller-facing handle.

use crate::config::ServerOptions;
use crate::connection::handle_connection;
use crate::error::NetError;
use crate::metrics::{counters, gauges};
use crate::registry::ServerRegistry;
use crate::service::ServiceFactory;
use futures_util::FutureExt;
use std::net::SocketAddr;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, OnceLock};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info};

/// State of one registered listener.
///
/// Shared between the registry entry, the caller's [`ServerHandle`], and
/// every connection unit the accept loop spawns. Connection units keep the
/// instance alive until they finish, even after the handle is disposed.
pub struct ServerInstance {
    port: u16,
    local_addr: OnceLock<SocketAddr>,
    listening: AtomicBool,
    completed: AtomicUsize,
    last_error: Mutex<Option<Arc<NetError>>>,
    shutdown: watch::Sender<bool>,
    loop_task: Mutex<Option<JoinHandle<()>>>,
}

impl ServerInstance {
    pub(crate) fn new(port: u16) -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            port,
            local_addr: OnceLock::new(),
            listening: AtomicBool::new(false),
            completed: AtomicUsize::new(0),
            last_error: Mutex::new(None),
            shutdown,
            loop_task: Mutex::new(None),
        }
    }

    /// Port this instance was registered under.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Address the listener actually bound to, once the bind succeeded.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get().copied()
    }

    /// Whether the accept loop is currently bound and accepting. Only
    /// authoritative for the loop itself — previously accepted connections
    /// may still be running when this turns false.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.listening.load(Ordering::SeqCst)
    }

    /// Number of connection units that have run to completion, successes
    /// and failures alike.
    #[must_use]
    pub fn completed_connections(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Most recent unhandled per-connection failure, if any. No history is
    /// kept.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<NetError>> {
        self.last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }

    /// Requests the accept loop to stop taking new connections. Best
    /// effort: in-flight connection units continue to completion, and the
    /// listening flag clears once the loop has actually exited.
    pub fn stop(&self) {
        let _ = self.shutdown.send(true);
    }

    pub(crate) fn record_failure(&self, err: NetError) {
        debug!(port = self.port, error = %err, "connection failure recorded");
        *self
            .last_error
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(Arc::new(err));
    }

    pub(crate) fn connection_finished(&self) {
        self.completed.fetch_add(1, Ordering::SeqCst);
        counters::connections_completed_total();
        gauges::dec_connections_active();
    }

    pub(crate) fn take_loop_task(&self) -> Option<JoinHandle<()>> {
        self.loop_task
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take()
    }
}

/// Binds the listener and spawns the accept loop for `instance`.
pub(crate) async fn start(
    instance: Arc<ServerInstance>,
    options: ServerOptions,
    factory: Arc<dyn ServiceFactory>,
) -> Result<(), NetError> {
    let bind_addr = SocketAddr::new(options.bind_addr, instance.port());
    let tls_acceptor = match &options.tls {
        Some(tls) => Some(tls.build_acceptor()?),
        None => None,
    };

    let listener = TcpListener::bind(bind_addr)
        .await
        .map_err(|source| NetError::Bind {
            addr: bind_addr.to_string(),
            source,
        })?;
    let local_addr = listener.local_addr()?;
    let _ = instance.local_addr.set(local_addr);
    instance.listening.store(true, Ordering::SeqCst);
    info!(%local_addr, "listener started");

    let shutdown_rx = instance.shutdown.subscribe();
    let task = tokio::spawn(accept_loop(
        listener,
        Arc::clone(&instance),
        factory,
        Arc::new(options),
        tls_acceptor,
        shutdown_rx,
    ));
    *instance
        .loop_task
        .lock()
        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(task);
    Ok(())
}

async fn accept_loop(
    listener: TcpListener,
    instance: Arc<ServerInstance>,
    factory: Arc<dyn ServiceFactory>,
    options: Arc<ServerOptions>,
    tls_acceptor: Option<TlsAcceptor>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let instance = Arc::clone(&instance);
                        let factory = Arc::clone(&factory);
                        let options = Arc::clone(&options);
                        let tls_acceptor = tls_acceptor.clone();
                        gauges::inc_connections_active();
                        tokio::spawn(async move {
                            let outcome = AssertUnwindSafe(handle_connection(
                                stream,
                                peer,
                                tls_acceptor,
                                factory,
                                options,
                            ))
                            .catch_unwind()
                            .await;
                            match outcome {
                                Ok(Ok(())) => {}
                                Ok(Err(e)) => {
                                    debug!(%peer, error = %e, "connection failed");
                                    instance.record_failure(e);
                                }
                                Err(panic) => {
                                    let msg = panic_message(&panic);
                                    instance.record_failure(NetError::Service(anyhow::anyhow!(
                                        "service handler panicked: {msg}"
                                    )));
                                }
                            }
                            instance.connection_finished();
                        });
                    }
                    Err(e) if matches!(
                        e.kind(),
                        std::io::ErrorKind::ConnectionAborted | std::io::ErrorKind::ConnectionReset
                    ) => {
                        // The peer went away between arrival and accept;
                        // that is a per-connection failure, not a listener one.
                        instance.record_failure(NetError::Io(e));
                    }
                    Err(e) => {
                        error!(port = instance.port(), error = %e, "listener failed, accept loop stopping");
                        instance.record_failure(NetError::Io(e));
                        break;
                    }
                }
            }
            _ = shutdown_rx.changed() => {
                info!(port = instance.port(), "stop requested, accept loop exiting");
                break;
            }
        }
    }
    instance.listening.store(false, Ordering::SeqCst);
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

/// Caller's half of a registered server.
///
/// Ownership of the instance is shared with the registry entry; disposing
/// the handle removes the entry and winds the accept loop down. In-flight
/// connection units keep running and still count toward the completed
/// total.
pub struct ServerHandle {
    instance: Arc<ServerInstance>,
    registry: ServerRegistry,
    disposed: bool,
}

impl std::fmt::Debug for ServerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerHandle")
            .field("port", &self.instance.port())
            .field("local_addr", &self.instance.local_addr())
            .field("disposed", &self.disposed)
            .finish()
    }
}

impl ServerHandle {
    pub(crate) fn new(instance: Arc<ServerInstance>, registry: ServerRegistry) -> Self {
        Self {
            instance,
            registry,
            disposed: false,
        }
    }

    /// The shared instance, for state queries that outlive the handle.
    #[must_use]
    pub fn instance(&self) -> Arc<ServerInstance> {
        Arc::clone(&self.instance)
    }

    /// Port this server was registered under.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.instance.port()
    }

    /// Address the listener actually bound to.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.instance.local_addr()
    }

    /// Whether the accept loop is currently accepting.
    #[must_use]
    pub fn is_listening(&self) -> bool {
        self.instance.is_listening()
    }

    /// Number of connection units that have finished.
    #[must_use]
    pub fn completed_connections(&self) -> usize {
        self.instance.completed_connections()
    }

    /// Most recent recorded per-connection failure.
    #[must_use]
    pub fn last_error(&self) -> Option<Arc<NetError>> {
        self.instance.last_error()
    }

    /// Requests the accept loop to stop taking new connections.
    pub fn stop(&self) {
        self.instance.stop();
    }

    /// Stops the server, removes its registry entry, and waits for the
    /// accept loop to exit, after which the port is free to rebind.
    pub async fn dispose(mut self) {
        self.disposed = true;
        self.registry.remove(self.instance.port());
        self.instance.stop();
        if let Some(task) = self.instance.take_loop_task() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if !self.disposed {
            self.registry.remove(self.instance.port());
            self.instance.stop();
        }
    }
}
