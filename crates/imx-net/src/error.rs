use imx_common::pdu::PduError;
use imx_common::types::reject_label;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during transport and session operations.
#[derive(Debug, Error)]
pub enum NetError {
    /// A live server is already registered on the requested port.
    #[error("port {0} already has a live listener")]
    PortInUse(u16),
    /// Binding the listening socket failed.
    #[error("bind to {addr} failed: {source}")]
    Bind {
        /// Address the bind was attempted on.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// Opening the outbound TCP connection failed. Covers refusal,
    /// unreachable hosts and address-family mismatches.
    #[error("connect to {addr} failed: {source}")]
    Connect {
        /// Address the connection was attempted to.
        addr: String,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },
    /// The encrypted-channel handshake did not complete within its deadline.
    #[error("secure channel handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),
    /// The encrypted-channel handshake failed outright.
    #[error("secure channel handshake failed: {0}")]
    Handshake(#[source] io::Error),
    /// TLS configuration could not be built or loaded.
    #[error("tls configuration error: {0}")]
    Tls(String),
    /// The peer declined the association during negotiation.
    #[error("association rejected by peer: {}", reject_label(*reason))]
    Rejected {
        /// Rejection reason code.
        reason: u8,
    },
    /// The peer tore the association down with an abort PDU.
    #[error("association aborted by peer (reason {reason:#04x})")]
    Aborted {
        /// Abort reason code.
        reason: u8,
    },
    /// The parameter exchange did not complete within its deadline.
    #[error("association negotiation timed out")]
    NegotiationTimeout,
    /// A PDU arrived that is not valid in the current session state.
    #[error("unexpected pdu type {kind:#04x} during session exchange")]
    UnexpectedPdu {
        /// Wire type byte of the offending PDU.
        kind: u8,
    },
    /// The peer closed the connection mid-exchange.
    #[error("connection closed by peer")]
    Closed,
    /// The transport stream was already disposed.
    #[error("transport stream already disposed")]
    Disposed,
    /// Option values failed validation.
    #[error("configuration error: {0}")]
    Config(String),
    /// Wire-format error on a received PDU.
    #[error("pdu error: {0}")]
    Pdu(#[from] PduError),
    /// Underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    /// A service handler returned or raised a failure.
    #[error("service handler failed: {0}")]
    Service(#[source] anyhow::Error),
}
