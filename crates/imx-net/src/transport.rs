//! Transport stream: one TCP socket, optionally upgraded to an encrypted
//! session, with explicit ownership and idempotent disposal.

use crate::config::ClientOptions;
use crate::error::NetError;
use crate::tls;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::{TlsAcceptor, TlsConnector, TlsStream};

/// The byte stream carried by a [`TransportStream`]: either the raw socket
/// or the negotiated encrypted session over it.
pub enum StreamIo {
    /// Cleartext TCP stream.
    Plain(TcpStream),
    /// Encrypted session, client or server role.
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncRead for StreamIo {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_read(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamIo {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_write(cx, buf),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_write(cx, buf),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_flush(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_flush(cx),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut *self {
            Self::Plain(s) => Pin::new(s).poll_shutdown(cx),
            Self::Tls(s) => Pin::new(s.as_mut()).poll_shutdown(cx),
        }
    }
}

fn disposed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "transport stream disposed")
}

/// A live connection to one peer.
///
/// Created by [`connect`](TransportStream::connect) (client role) or
/// [`accept`](TransportStream::accept) (server role). Endpoint identity is
/// captured from the live socket. Disposal is idempotent; once disposed,
/// all further I/O fails with an explicit error.
pub struct TransportStream {
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    secure: bool,
    owns_socket: bool,
    io: Option<StreamIo>,
}

impl TransportStream {
    /// Opens a TCP connection per the given options, performing the
    /// client-role encrypted-channel handshake when requested.
    ///
    /// # Errors
    ///
    /// [`NetError::Connect`] if the socket connection fails (refusal,
    /// unreachable host, address-family mismatch, connect timeout),
    /// [`NetError::HandshakeTimeout`] if the upgrade misses its deadline,
    /// [`NetError::Handshake`] if the upgrade fails outright.
    pub async fn connect(options: &ClientOptions) -> Result<Self, NetError> {
        // IPv6 literals need bracketing to form a socket address.
        let addr = if options.host.contains(':') {
            format!("[{}]:{}", options.host, options.port)
        } else {
            format!("{}:{}", options.host, options.port)
        };
        let tcp = match timeout(options.io_timeout, TcpStream::connect(addr.as_str())).await {
            Ok(Ok(tcp)) => tcp,
            Ok(Err(source)) => return Err(NetError::Connect { addr, source }),
            Err(_) => {
                return Err(NetError::Connect {
                    addr,
                    source: io::Error::new(io::ErrorKind::TimedOut, "connect timed out"),
                })
            }
        };
        tcp.set_nodelay(options.no_delay)?;
        let local_addr = tcp.local_addr()?;
        let peer_addr = tcp.peer_addr()?;

        let io = if options.use_tls {
            let connector = TlsConnector::from(tls::client_config(options)?);
            let name = ServerName::try_from(options.host.clone())
                .map_err(|_| NetError::Tls(format!("invalid server name {:?}", options.host)))?;
            // Dropping the handshake future on deadline expiry cancels the
            // in-flight handshake along with it.
            let stream = timeout(options.handshake_timeout, connector.connect(name, tcp))
                .await
                .map_err(|_| NetError::HandshakeTimeout(options.handshake_timeout))?
                .map_err(NetError::Handshake)?;
            StreamIo::Tls(Box::new(stream.into()))
        } else {
            StreamIo::Plain(tcp)
        };

        Ok(Self {
            local_addr,
            peer_addr,
            secure: options.use_tls,
            owns_socket: true,
            io: Some(io),
        })
    }

    /// Wraps an already-accepted socket, performing the server-role
    /// encrypted-channel handshake when an acceptor is supplied.
    /// `owns_socket` controls whether disposal shuts the socket down.
    ///
    /// # Errors
    ///
    /// [`NetError::HandshakeTimeout`] if the upgrade misses its deadline,
    /// [`NetError::Handshake`] if it fails outright.
    pub async fn accept(
        tcp: TcpStream,
        acceptor: Option<&TlsAcceptor>,
        owns_socket: bool,
        handshake_timeout: Duration,
    ) -> Result<Self, NetError> {
        let local_addr = tcp.local_addr()?;
        let peer_addr = tcp.peer_addr()?;

        let (io, secure) = match acceptor {
            Some(acceptor) => {
                let stream = timeout(handshake_timeout, acceptor.accept(tcp))
                    .await
                    .map_err(|_| NetError::HandshakeTimeout(handshake_timeout))?
                    .map_err(NetError::Handshake)?;
                (StreamIo::Tls(Box::new(stream.into())), true)
            }
            None => (StreamIo::Plain(tcp), false),
        };

        Ok(Self {
            local_addr,
            peer_addr,
            secure,
            owns_socket,
            io: Some(io),
        })
    }

    /// Local endpoint of the underlying socket.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote endpoint of the underlying socket.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// Whether the stream was upgraded to an encrypted session.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Whether [`dispose`](Self::dispose) (or [`into_io`](Self::into_io))
    /// has already taken the stream.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.io.is_none()
    }

    /// Takes the byte stream out of the wrapper, leaving it disposed.
    /// Session lifetime is then the caller's responsibility.
    #[must_use]
    pub fn into_io(mut self) -> Option<StreamIo> {
        self.io.take()
    }

    /// Releases the stream. Only the first call has an effect. An owned
    /// socket is shut down; a non-owned one is released without an active
    /// shutdown, its lifetime remaining the original owner's concern.
    pub async fn dispose(&mut self) {
        if let Some(mut io) = self.io.take() {
            if self.owns_socket {
                let _ = io.shutdown().await;
            }
        }
    }
}

impl AsyncRead for TransportStream {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        match &mut self.io {
            Some(io) => Pin::new(io).poll_read(cx, buf),
            None => Poll::Ready(Err(disposed_error())),
        }
    }
}

impl AsyncWrite for TransportStream {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        match &mut self.io {
            Some(io) => Pin::new(io).poll_write(cx, buf),
            None => Poll::Ready(Err(disposed_error())),
        }
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.io {
            Some(io) => Pin::new(io).poll_flush(cx),
            None => Poll::Ready(Err(disposed_error())),
        }
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        match &mut self.io {
            Some(io) => Pin::new(io).poll_shutdown(cx),
            None => Poll::Ready(Err(disposed_error())),
        }
    }
}

impl std::fmt::Debug for TransportStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportStream")
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("secure", &self.secure)
            .field("owns_socket", &self.owns_socket)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn connected_pair() -> (TransportStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let options = ClientOptions::new("127.0.0.1", addr.port());
        let (client, (server, _)) =
            tokio::join!(TransportStream::connect(&options), async {
                listener.accept().await.unwrap()
            });
        (client.unwrap(), server)
    }

    #[tokio::test]
    async fn connect_captures_endpoint_identity() {
        let (client, server) = connected_pair().await;
        assert_eq!(client.peer_addr(), server.local_addr().unwrap());
        assert_eq!(client.local_addr(), server.peer_addr().unwrap());
        assert!(!client.is_secure());
    }

    #[tokio::test]
    async fn dispose_is_idempotent() {
        let (mut client, _server) = connected_pair().await;
        assert!(!client.is_disposed());
        client.dispose().await;
        assert!(client.is_disposed());
        client.dispose().await;
        assert!(client.is_disposed());
    }

    #[tokio::test]
    async fn io_after_dispose_fails() {
        let (mut client, _server) = connected_pair().await;
        client.dispose().await;
        let err = client.write_all(b"data").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn connect_to_dead_port_is_connect_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let options = ClientOptions::new("127.0.0.1", addr.port());
        match TransportStream::connect(&options).await {
            Err(NetError::Connect { .. }) => {}
            other => panic!("expected Connect error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn accept_wraps_existing_socket() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr);
        let ((accepted, peer), _client) =
            tokio::join!(async { listener.accept().await.unwrap() }, client);

        let stream =
            TransportStream::accept(accepted, None, true, Duration::from_secs(1)).await.unwrap();
        assert_eq!(stream.peer_addr(), peer);
        assert!(!stream.is_secure());
    }

    #[tokio::test]
    async fn into_io_leaves_stream_disposed() {
        let (client, _server) = connected_pair().await;
        let io = client.into_io();
        assert!(io.is_some());
    }
}
