//! Protocol constants and wire code definitions for IMX.

/// Session-protocol version carried in association setup PDUs.
/// Bump this on breaking wire-format changes.
pub const PROTOCOL_VERSION: u16 = 1;

/// Application context name both peers must agree on before any
/// application data is exchanged.
pub const APPLICATION_CONTEXT: &str = "imx.v1";

/// Default maximum protocol-data-unit length granted by an acceptor
/// that was not configured otherwise.
pub const DEFAULT_MAX_PDU_LENGTH: u32 = 262_144;

/// Smallest max-PDU-length value a peer may propose or grant.
pub const MIN_PDU_LENGTH: u32 = 1_024;

/// Largest max-PDU-length value a peer may propose or grant (16 MiB).
pub const MAX_PDU_LENGTH: u32 = 16 * 1024 * 1024;

/// Longest node name (calling/called identity) accepted in an
/// association request, in bytes.
pub const MAX_NODE_NAME: usize = 64;

/// Longest application context name accepted on the wire, in bytes.
pub const MAX_CONTEXT_NAME: usize = 64;

/// Reason codes carried in an association-reject PDU.
pub mod reject_reason {
    /// The proposed application context is not supported.
    pub const CONTEXT_MISMATCH: u8 = 0x01;
    /// The proposed session-protocol version is not supported.
    pub const VERSION_MISMATCH: u8 = 0x02;
    /// The acceptor is shutting down and not taking new associations.
    pub const SHUTTING_DOWN: u8 = 0x03;
    /// The proposed maximum PDU length is outside acceptable bounds.
    pub const BAD_PDU_LENGTH: u8 = 0x04;
    /// The called node name is not served by this acceptor.
    pub const CALLED_UNKNOWN: u8 = 0x05;
}

/// Reason codes carried in an abort PDU.
pub mod abort_reason {
    /// No specific reason given.
    pub const UNSPECIFIED: u8 = 0x00;
    /// A PDU arrived that is not valid in the current session state.
    pub const UNEXPECTED_PDU: u8 = 0x01;
    /// A received PDU could not be parsed.
    pub const INVALID_PDU: u8 = 0x02;
    /// A received data unit exceeded the negotiated maximum length.
    pub const OVERSIZED_PDU: u8 = 0x03;
}

/// Human-readable label for a rejection reason code, for diagnostics.
#[must_use]
pub fn reject_label(reason: u8) -> &'static str {
    match reason {
        reject_reason::CONTEXT_MISMATCH => "application context mismatch",
        reject_reason::VERSION_MISMATCH => "protocol version mismatch",
        reject_reason::SHUTTING_DOWN => "acceptor shutting down",
        reject_reason::BAD_PDU_LENGTH => "unacceptable max PDU length",
        reject_reason::CALLED_UNKNOWN => "called node unknown",
        _ => "unrecognized reason",
    }
}
