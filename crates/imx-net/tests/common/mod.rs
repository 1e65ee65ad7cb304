use imx_net::{ClientOptions, ServerHandle, ServerOptions, ServerRegistry, ServiceFactory};
use std::future::Future;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

/// Server options suitable for loopback tests: short deadlines so failure
/// paths resolve quickly.
pub fn test_server_options() -> ServerOptions {
    ServerOptions {
        bind_addr: "127.0.0.1".parse().unwrap(),
        association_timeout: Duration::from_millis(500),
        handshake_timeout: Duration::from_secs(2),
        io_timeout: Duration::from_secs(5),
        ..ServerOptions::default()
    }
}

/// Client options pointed at a loopback port, with test-friendly deadlines.
pub fn test_client_options(port: u16) -> ClientOptions {
    ClientOptions::new("127.0.0.1", port)
        .with_io_timeout(Duration::from_secs(5))
        .with_handshake_timeout(Duration::from_secs(2))
}

/// Picks a currently-free TCP port on the given loopback address.
pub async fn free_port_on(addr: IpAddr) -> u16 {
    let listener = tokio::net::TcpListener::bind((addr, 0)).await.unwrap();
    listener.local_addr().unwrap().port()
}

/// Picks a currently-free TCP port on IPv4 loopback.
pub async fn free_port() -> u16 {
    free_port_on("127.0.0.1".parse().unwrap()).await
}

/// Registers a server with the given factory on a fresh port and returns
/// the handle together with the port.
pub async fn start_server(
    registry: &ServerRegistry,
    options: ServerOptions,
    factory: Arc<dyn ServiceFactory>,
) -> (u16, ServerHandle) {
    let port = free_port().await;
    let handle = registry.create(port, options, factory).await.unwrap();
    (port, handle)
}

/// Polls `cond` until it returns true or two seconds elapse.
pub async fn wait_for<F, Fut>(mut cond: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..200 {
        if cond().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Blocking-predicate variant of [`wait_for`].
pub async fn wait_for_sync(mut cond: impl FnMut() -> bool) -> bool {
    wait_for(|| {
        let v = cond();
        async move { v }
    })
    .await
}
