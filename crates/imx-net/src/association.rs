//! Association negotiation and the negotiated session handle.
//!
//! Before any application data moves, the requestor proposes parameters
//! (protocol version, application context, maximum PDU length) and the
//! acceptor grants or rejects them. The granted maximum PDU length is the
//! acceptor's configured value — both sides honor the grant, not the
//! proposal, for all subsequent unit sizing.

use crate::config::{ClientOptions, ServerOptions};
use crate::error::NetError;
use crate::metrics::counters;
use crate::transport::TransportStream;
use imx_common::pdu::{self, Pdu, PduError, HEADER_LEN, MAX_SETUP_BODY};
use imx_common::types::{abort_reason, reject_reason, PROTOCOL_VERSION};
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::timeout;

/// Writes one PDU to the stream and flushes it.
///
/// # Errors
///
/// Returns [`NetError::Io`] on write failure.
pub async fn write_pdu<S>(stream: &mut S, pdu: &Pdu) -> Result<(), NetError>
where
    S: AsyncWrite + Unpin,
{
    let bytes = pdu.serialize();
    stream.write_all(&bytes).await?;
    stream.flush().await?;
    Ok(())
}

/// Reads one PDU from the stream, refusing bodies larger than `max_body`.
///
/// # Errors
///
/// [`NetError::Closed`] if the peer closed mid-PDU, [`NetError::Pdu`] on
/// malformed or oversized input, [`NetError::Io`] on other read failures.
pub async fn read_pdu<S>(stream: &mut S, max_body: usize) -> Result<Pdu, NetError>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; HEADER_LEN];
    stream.read_exact(&mut header).await.map_err(map_eof)?;
    let (kind, len) = pdu::parse_header(&header)?;
    if len > max_body {
        return Err(NetError::Pdu(PduError::BodyTooLarge {
            max: max_body,
            actual: len,
        }));
    }
    let mut body = vec![0u8; len];
    stream.read_exact(&mut body).await.map_err(map_eof)?;
    Ok(Pdu::parse_body(kind, &body)?)
}

fn map_eof(e: io::Error) -> NetError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        NetError::Closed
    } else {
        NetError::Io(e)
    }
}

/// Parameters in force on an established association.
#[derive(Debug, Clone)]
pub struct AssociationParams {
    /// Granted maximum PDU length governing both directions.
    pub max_pdu_length: u32,
    /// Agreed application context name.
    pub context: String,
    /// Requestor's node name.
    pub calling: String,
    /// Addressed node name.
    pub called: String,
}

/// A negotiated session over one transport stream.
///
/// Owned by whoever drives the session next — on the server side that is
/// the per-connection service handler, which keeps the stream alive until
/// the protocol reaches its release point.
pub struct Association {
    stream: TransportStream,
    params: AssociationParams,
    io_timeout: Duration,
}

impl std::fmt::Debug for Association {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Association")
            .field("peer_addr", &self.stream.peer_addr())
            .field("secure", &self.stream.is_secure())
            .field("params", &self.params)
            .field("io_timeout", &self.io_timeout)
            .finish()
    }
}

impl Association {
    /// Connects to a peer and requests an association.
    ///
    /// # Errors
    ///
    /// Everything [`TransportStream::connect`] raises, plus
    /// [`NetError::Rejected`] when the acceptor declines and
    /// [`NetError::NegotiationTimeout`] when no reply arrives in time.
    pub async fn connect(options: &ClientOptions) -> Result<Self, NetError> {
        options.validate().map_err(NetError::Config)?;
        let mut stream = TransportStream::connect(options).await?;

        let request = Pdu::associate_rq(
            PROTOCOL_VERSION,
            options.max_pdu_length,
            &options.context,
            &options.calling,
            &options.called,
        );
        write_pdu(&mut stream, &request).await?;

        let reply = timeout(options.io_timeout, read_pdu(&mut stream, MAX_SETUP_BODY))
            .await
            .map_err(|_| NetError::NegotiationTimeout)??;

        match reply {
            Pdu::AssociateAc {
                max_pdu_length,
                context,
                ..
            } => Ok(Self {
                stream,
                params: AssociationParams {
                    // The grant, not our proposal, sizes every unit from here on.
                    max_pdu_length,
                    context,
                    calling: options.calling.clone(),
                    called: options.called.clone(),
                },
                io_timeout: options.io_timeout,
            }),
            Pdu::AssociateRj { reason } => Err(NetError::Rejected { reason }),
            other => {
                let _ = write_pdu(&mut stream, &Pdu::abort(abort_reason::UNEXPECTED_PDU)).await;
                Err(NetError::UnexpectedPdu { kind: other.kind() })
            }
        }
    }

    /// Granted maximum PDU length in force on this association.
    #[must_use]
    pub fn max_pdu_length(&self) -> u32 {
        self.params.max_pdu_length
    }

    /// Negotiated parameters.
    #[must_use]
    pub fn params(&self) -> &AssociationParams {
        &self.params
    }

    /// Remote endpoint of the underlying transport.
    #[must_use]
    pub fn peer_addr(&self) -> SocketAddr {
        self.stream.peer_addr()
    }

    /// Local endpoint of the underlying transport.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.stream.local_addr()
    }

    /// Whether the transport was upgraded to an encrypted session.
    #[must_use]
    pub fn is_secure(&self) -> bool {
        self.stream.is_secure()
    }

    /// Sends one data unit. The payload must fit the granted maximum PDU
    /// length.
    ///
    /// # Errors
    ///
    /// [`NetError::Pdu`] with `BodyTooLarge` on oversize payloads,
    /// [`NetError::Io`] on transport failure.
    pub async fn send(&mut self, payload: &[u8]) -> Result<(), NetError> {
        let max = self.params.max_pdu_length as usize;
        if payload.len() > max {
            return Err(NetError::Pdu(PduError::BodyTooLarge {
                max,
                actual: payload.len(),
            }));
        }
        write_pdu(&mut self.stream, &Pdu::data(payload)).await?;
        counters::data_bytes_total("out", payload.len() as u64);
        Ok(())
    }

    /// Receives the next data unit. Answers a peer release request with the
    /// confirmation and returns `None`; an abort surfaces as an error.
    ///
    /// # Errors
    ///
    /// [`NetError::Aborted`] on a peer abort, [`NetError::UnexpectedPdu`]
    /// on a PDU invalid in the established state, [`NetError::Closed`] /
    /// [`NetError::Io`] on transport failure.
    pub async fn recv(&mut self) -> Result<Option<Vec<u8>>, NetError> {
        let max = self.params.max_pdu_length as usize;
        match read_pdu(&mut self.stream, max).await? {
            Pdu::Data { payload } => {
                counters::data_bytes_total("in", payload.len() as u64);
                Ok(Some(payload))
            }
            Pdu::ReleaseRq => {
                write_pdu(&mut self.stream, &Pdu::release_rp()).await?;
                self.stream.dispose().await;
                Ok(None)
            }
            Pdu::Abort { reason } => Err(NetError::Aborted { reason }),
            other => {
                let _ = write_pdu(&mut self.stream, &Pdu::abort(abort_reason::UNEXPECTED_PDU)).await;
                Err(NetError::UnexpectedPdu { kind: other.kind() })
            }
        }
    }

    /// Performs the orderly release sequence and disposes the transport.
    /// Data units still in flight from the peer are discarded.
    ///
    /// # Errors
    ///
    /// [`NetError::Aborted`] if the peer aborts instead of confirming,
    /// [`NetError::Io`] on transport failure or release timeout.
    pub async fn release(mut self) -> Result<(), NetError> {
        write_pdu(&mut self.stream, &Pdu::release_rq()).await?;

        let max = self.params.max_pdu_length as usize;
        let stream = &mut self.stream;
        let wait = async {
            loop {
                match read_pdu(stream, max).await? {
                    Pdu::ReleaseRp => return Ok(()),
                    Pdu::Data { .. } => continue,
                    Pdu::Abort { reason } => return Err(NetError::Aborted { reason }),
                    other => return Err(NetError::UnexpectedPdu { kind: other.kind() }),
                }
            }
        };
        let result = timeout(self.io_timeout, wait).await.unwrap_or_else(|_| {
            Err(NetError::Io(io::Error::new(
                io::ErrorKind::TimedOut,
                "release confirmation timed out",
            )))
        });

        self.stream.dispose().await;
        result
    }

    /// Aborts the association immediately and disposes the transport.
    pub async fn abort(mut self, reason: u8) {
        let _ = write_pdu(&mut self.stream, &Pdu::abort(reason)).await;
        self.stream.dispose().await;
    }

    /// Hands the underlying transport back, ending this handle's
    /// involvement in the session.
    #[must_use]
    pub fn into_stream(self) -> TransportStream {
        self.stream
    }
}

/// Acceptor half of the negotiation: reads the proposal, validates it, and
/// grants the locally configured maximum PDU length.
///
/// # Errors
///
/// [`NetError::NegotiationTimeout`] if no proposal arrives in time,
/// [`NetError::Rejected`] when the proposal is declined (the rejection PDU
/// has been sent to the peer), [`NetError::UnexpectedPdu`] if the first
/// PDU is not an association request.
pub async fn accept_association(
    mut stream: TransportStream,
    options: &ServerOptions,
) -> Result<Association, NetError> {
    let request = timeout(
        options.association_timeout,
        read_pdu(&mut stream, MAX_SETUP_BODY),
    )
    .await
    .map_err(|_| NetError::NegotiationTimeout)??;

    match request {
        Pdu::AssociateRq {
            version,
            max_pdu_length: proposed,
            context,
            calling,
            called,
        } => {
            if version != PROTOCOL_VERSION {
                return reject(stream, reject_reason::VERSION_MISMATCH).await;
            }
            if context != options.application_context {
                return reject(stream, reject_reason::CONTEXT_MISMATCH).await;
            }

            // The grant is this acceptor's configured value; the proposal
            // only tells us what the peer would have liked.
            let granted = options.max_pdu_length;
            tracing::debug!(proposed, granted, %calling, "association proposal accepted");

            let accept = Pdu::associate_ac(PROTOCOL_VERSION, granted, &context);
            write_pdu(&mut stream, &accept).await?;

            Ok(Association {
                stream,
                params: AssociationParams {
                    max_pdu_length: granted,
                    context,
                    calling,
                    called,
                },
                io_timeout: options.io_timeout,
            })
        }
        other => {
            let _ = write_pdu(&mut stream, &Pdu::abort(abort_reason::UNEXPECTED_PDU)).await;
            stream.dispose().await;
            Err(NetError::UnexpectedPdu { kind: other.kind() })
        }
    }
}

async fn reject(mut stream: TransportStream, reason: u8) -> Result<Association, NetError> {
    let _ = write_pdu(&mut stream, &Pdu::associate_rj(reason)).await;
    stream.dispose().await;
    Err(NetError::Rejected { reason })
}
