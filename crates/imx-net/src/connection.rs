use crate::association::accept_association;
use crate::config::ServerOptions;
use crate::error::NetError;
use crate::metrics::{counters, histograms};
use crate::service::ServiceFactory;
use crate::transport::TransportStream;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::net::TcpStream;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Drives one accepted connection: optional encrypted-channel upgrade,
/// association negotiation, then the service handler. Runs inside its own
/// task; any failure it returns is recorded on the owning server instance
/// and never reaches the accept loop.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    tls_acceptor: Option<TlsAcceptor>,
    factory: Arc<dyn ServiceFactory>,
    options: Arc<ServerOptions>,
) -> Result<(), NetError> {
    stream.set_nodelay(options.no_delay)?;

    let transport = TransportStream::accept(
        stream,
        tls_acceptor.as_ref(),
        true,
        options.handshake_timeout,
    )
    .await?;

    let setup_started = Instant::now();
    let association = match accept_association(transport, &options).await {
        Ok(association) => {
            counters::associations_total("accepted");
            association
        }
        Err(e) => {
            counters::associations_total("rejected");
            return Err(e);
        }
    };
    histograms::association_setup_seconds(setup_started.elapsed().as_secs_f64());
    debug!(
        %peer,
        max_pdu = association.max_pdu_length(),
        secure = association.is_secure(),
        "association established"
    );

    let service = factory.create(peer);
    service.run(association).await.map_err(NetError::Service)
}
