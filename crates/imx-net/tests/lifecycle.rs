//! Registry and listener lifecycle behavior: port ownership, disposal,
//! stop semantics, and isolation of per-connection failures.

mod common;

use common::*;
use imx_net::{service_fn, Association, EchoFactory, NetError, ServerRegistry, TransportStream};
use std::sync::Arc;
use tokio::sync::mpsc;

#[tokio::test]
async fn concurrent_create_on_same_port_has_one_winner() {
    let registry = ServerRegistry::new();
    let port = free_port().await;

    let (a, b) = tokio::join!(
        registry.create(port, test_server_options(), Arc::new(EchoFactory)),
        registry.create(port, test_server_options(), Arc::new(EchoFactory)),
    );

    let (winner, loser) = match (a, b) {
        (Ok(handle), Err(e)) | (Err(e), Ok(handle)) => (handle, e),
        (Ok(_), Ok(_)) => panic!("both creates succeeded on one port"),
        (Err(a), Err(b)) => panic!("both creates failed: {a:?} / {b:?}"),
    };
    assert!(matches!(loser, NetError::PortInUse(p) if p == port));

    // The surviving listener is fully operational.
    assert!(registry.is_listening(port));
    let association = Association::connect(&test_client_options(port)).await.unwrap();
    association.release().await.unwrap();
    winner.dispose().await;
}

#[tokio::test]
async fn registry_lookup_tracks_lifetime() {
    let registry = ServerRegistry::new();
    let port = free_port().await;

    assert!(registry.get_instance(port).is_none());
    assert!(!registry.is_listening(port));

    let handle = registry
        .create(port, test_server_options(), Arc::new(EchoFactory))
        .await
        .unwrap();
    assert!(registry.get_instance(port).is_some());
    assert!(registry.is_listening(port));

    // A different port shows nothing even while this one is live.
    assert!(registry.get_instance(port.wrapping_add(1)).is_none());
    assert!(!registry.is_listening(port.wrapping_add(1)));

    handle.dispose().await;
    assert!(registry.get_instance(port).is_none());
    assert!(!registry.is_listening(port));
}

#[tokio::test]
async fn create_dispose_recreate_cycles() {
    let registry = ServerRegistry::new();
    let port = free_port().await;

    for _ in 0..3 {
        let handle = registry
            .create(port, test_server_options(), Arc::new(EchoFactory))
            .await
            .unwrap();
        assert!(handle.is_listening());
        handle.dispose().await;
    }
}

#[tokio::test]
async fn family_mismatch_fails_at_the_socket_layer() {
    let registry = ServerRegistry::new();

    // IPv6-loopback listener, IPv4 client.
    let v6_port = free_port_on("::1".parse().unwrap()).await;
    let mut v6_options = test_server_options();
    v6_options.bind_addr = "::1".parse().unwrap();
    let v6_handle = registry
        .create(v6_port, v6_options, Arc::new(EchoFactory))
        .await
        .unwrap();
    match Association::connect(&test_client_options(v6_port)).await {
        Err(NetError::Connect { .. }) => {}
        other => panic!("expected Connect error, got {other:?}"),
    }
    v6_handle.dispose().await;

    // IPv4-loopback listener, IPv6 client.
    let (v4_port, v4_handle) =
        start_server(&registry, test_server_options(), Arc::new(EchoFactory)).await;
    let mut v6_client = test_client_options(v4_port);
    v6_client.host = "::1".to_owned();
    match Association::connect(&v6_client).await {
        Err(NetError::Connect { .. }) => {}
        other => panic!("expected Connect error, got {other:?}"),
    }
    v4_handle.dispose().await;
}

#[tokio::test]
async fn stop_lets_inflight_connections_finish() {
    let registry = ServerRegistry::new();
    let (release_tx, mut release_rx) = mpsc::channel::<()>(1);
    let release_tx = Arc::new(release_tx);

    let factory = service_fn(move |mut association: Association| {
        let release_tx = Arc::clone(&release_tx);
        async move {
            while let Some(payload) = association.recv().await? {
                association.send(&payload).await?;
            }
            let _ = release_tx.send(()).await;
            Ok(())
        }
    });
    let (port, handle) = start_server(&registry, test_server_options(), factory).await;

    let association = Association::connect(&test_client_options(port)).await.unwrap();

    handle.stop();
    assert!(wait_for_sync(|| !handle.is_listening()).await);

    // No new connections are accepted once the loop has exited...
    match Association::connect(&test_client_options(port)).await {
        Err(NetError::Connect { .. }) => {}
        other => panic!("expected Connect error after stop, got {other:?}"),
    }

    // ...but the in-flight association still completes and is counted.
    association.release().await.unwrap();
    assert!(release_rx.recv().await.is_some());
    assert!(wait_for_sync(|| handle.completed_connections() == 1).await);
    assert!(handle.last_error().is_none());
    handle.dispose().await;
}

#[tokio::test]
async fn failing_handler_never_stops_the_listener() {
    let registry = ServerRegistry::new();
    let factory = service_fn(|association: Association| async move {
        drop(association);
        anyhow::bail!("storage backend unavailable")
    });
    let (port, handle) = start_server(&registry, test_server_options(), factory).await;

    for expected in 1..=3 {
        match Association::connect(&test_client_options(port)).await {
            // The handler drops the association immediately, so the client
            // sees either a successful setup or an early close.
            Ok(association) => drop(association),
            Err(NetError::Closed | NetError::Io(_)) => {}
            Err(other) => panic!("unexpected client error: {other:?}"),
        }
        assert!(wait_for_sync(|| handle.completed_connections() == expected).await);
    }

    assert!(handle.is_listening());
    let err = handle.last_error().unwrap();
    assert!(matches!(*err, NetError::Service(_)));
    handle.dispose().await;
}

#[tokio::test]
async fn panicking_handler_is_contained() {
    let registry = ServerRegistry::new();
    let factory = service_fn(|association: Association| async move {
        drop(association);
        panic!("handler logic error");
    });
    let (port, handle) = start_server(&registry, test_server_options(), factory).await;

    match Association::connect(&test_client_options(port)).await {
        Ok(association) => drop(association),
        Err(NetError::Closed | NetError::Io(_)) => {}
        Err(other) => panic!("unexpected client error: {other:?}"),
    }

    assert!(wait_for_sync(|| handle.completed_connections() == 1).await);
    let err = handle.last_error().unwrap();
    assert!(matches!(*err, NetError::Service(_)));
    assert!(handle.is_listening());
    handle.dispose().await;
}

#[tokio::test]
async fn transport_dispose_twice_is_noop() {
    let registry = ServerRegistry::new();
    let (port, handle) =
        start_server(&registry, test_server_options(), Arc::new(EchoFactory)).await;

    let options = test_client_options(port);
    let mut stream = TransportStream::connect(&options).await.unwrap();
    stream.dispose().await;
    let disposed_once = stream.is_disposed();
    stream.dispose().await;
    assert!(disposed_once);
    assert!(stream.is_disposed());
    handle.dispose().await;
}

#[tokio::test]
async fn instance_state_outlives_disposed_handle() {
    let registry = ServerRegistry::new();
    let (port, handle) =
        start_server(&registry, test_server_options(), Arc::new(EchoFactory)).await;

    let instance = handle.instance();
    let association = Association::connect(&test_client_options(port)).await.unwrap();
    handle.dispose().await;

    // The registry entry is gone, but the connection unit still holds the
    // instance and finishes against it.
    assert!(registry.get_instance(port).is_none());
    association.release().await.unwrap();
    assert!(wait_for_sync(|| instance.completed_connections() == 1).await);
}

#[tokio::test]
async fn dropping_handle_unregisters() {
    let registry = ServerRegistry::new();
    let (port, handle) =
        start_server(&registry, test_server_options(), Arc::new(EchoFactory)).await;

    drop(handle);
    assert!(registry.get_instance(port).is_none());
    assert!(wait_for_sync(|| !registry.is_listening(port)).await);
}
