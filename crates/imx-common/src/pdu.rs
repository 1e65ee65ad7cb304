//! IMX protocol-data-unit serialization and parsing.
//!
//! Every PDU starts with a fixed six-byte header: a type byte, a reserved
//! byte, and a big-endian `u32` body length. The body layout depends on the
//! type. Association setup PDUs are small and bounded; data PDUs are bounded
//! by the per-association negotiated maximum length, which this crate does
//! not know — callers enforce it when framing reads.

use crate::types::{MAX_CONTEXT_NAME, MAX_NODE_NAME};
use thiserror::Error;

/// ASSOCIATE-RQ type: requestor → acceptor, proposes association parameters.
pub const TYPE_ASSOCIATE_RQ: u8 = 0x01;
/// ASSOCIATE-AC type: acceptor → requestor, grants association parameters.
pub const TYPE_ASSOCIATE_AC: u8 = 0x02;
/// ASSOCIATE-RJ type: acceptor → requestor, declines the association.
pub const TYPE_ASSOCIATE_RJ: u8 = 0x03;
/// DATA type: one framed unit of application data, either direction.
pub const TYPE_DATA: u8 = 0x04;
/// RELEASE-RQ type: requests orderly association shutdown.
pub const TYPE_RELEASE_RQ: u8 = 0x05;
/// RELEASE-RP type: confirms orderly association shutdown.
pub const TYPE_RELEASE_RP: u8 = 0x06;
/// ABORT type: immediate association teardown, either direction.
pub const TYPE_ABORT: u8 = 0x07;

/// Fixed PDU header size: type byte, reserved byte, `u32` body length.
pub const HEADER_LEN: usize = 6;

/// Upper bound on the body of any association setup PDU (everything except
/// DATA). Large enough for the version, length and three max-length names.
pub const MAX_SETUP_BODY: usize = 256;

/// A parsed IMX protocol-data-unit.
///
/// Variants map 1:1 to wire types defined by the `TYPE_*` constants.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pdu {
    /// Association proposal from the requestor.
    AssociateRq {
        /// Session-protocol version the requestor speaks.
        version: u16,
        /// Maximum PDU length the requestor proposes.
        max_pdu_length: u32,
        /// Application context name the requestor wants to use.
        context: String,
        /// Requestor's node name.
        calling: String,
        /// Node name the requestor believes it is addressing.
        called: String,
    },
    /// Association grant from the acceptor.
    AssociateAc {
        /// Session-protocol version the acceptor speaks.
        version: u16,
        /// Maximum PDU length the acceptor grants. This value, not the
        /// requestor's proposal, governs the rest of the association.
        max_pdu_length: u32,
        /// Application context name echoed back by the acceptor.
        context: String,
    },
    /// Association declined by the acceptor.
    AssociateRj {
        /// Rejection reason code (see [`crate::types::reject_reason`]).
        reason: u8,
    },
    /// One framed unit of application data.
    Data {
        /// Opaque application payload.
        payload: Vec<u8>,
    },
    /// Orderly shutdown request.
    ReleaseRq,
    /// Orderly shutdown confirmation.
    ReleaseRp,
    /// Immediate teardown notification.
    Abort {
        /// Abort reason code (see [`crate::types::abort_reason`]).
        reason: u8,
    },
}

/// Errors that can occur during PDU parsing.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PduError {
    /// The input was empty.
    #[error("pdu is empty")]
    Empty,
    /// The input is too short for the header or the declared body.
    #[error("pdu too short: expected {expected} bytes, got {actual}")]
    TooShort {
        /// Minimum expected byte count.
        expected: usize,
        /// Actual byte count received.
        actual: usize,
    },
    /// The declared body length does not match the bytes present.
    #[error("pdu length mismatch: header declares {declared} body bytes, got {actual}")]
    LengthMismatch {
        /// Body length declared in the header.
        declared: usize,
        /// Body bytes actually present.
        actual: usize,
    },
    /// The declared body length exceeds what the caller allows.
    #[error("pdu body too large: max {max}, got {actual}")]
    BodyTooLarge {
        /// Maximum allowed body size.
        max: usize,
        /// Declared body size.
        actual: usize,
    },
    /// The type byte does not match any known PDU type.
    #[error("unknown pdu type {0:#04x}")]
    UnknownType(u8),
    /// A length-prefixed name field exceeds its bound.
    #[error("{field} too long: max {max} bytes, got {actual}")]
    FieldTooLong {
        /// Name of the offending field.
        field: &'static str,
        /// Maximum allowed length.
        max: usize,
        /// Actual length on the wire.
        actual: usize,
    },
    /// A name field is not valid UTF-8.
    #[error("{field} is not valid utf-8")]
    InvalidText {
        /// Name of the offending field.
        field: &'static str,
    },
}

/// Parses the fixed header, returning the type byte and declared body length.
///
/// # Errors
///
/// Returns [`PduError::UnknownType`] if the type byte is unrecognized.
pub fn parse_header(header: &[u8; HEADER_LEN]) -> Result<(u8, usize), PduError> {
    let kind = header[0];
    if !(TYPE_ASSOCIATE_RQ..=TYPE_ABORT).contains(&kind) {
        return Err(PduError::UnknownType(kind));
    }
    let len = u32::from_be_bytes([header[2], header[3], header[4], header[5]]) as usize;
    Ok((kind, len))
}

fn read_name<'a>(
    data: &'a [u8],
    field: &'static str,
    max: usize,
) -> Result<(String, &'a [u8]), PduError> {
    let (&len, rest) = data.split_first().ok_or(PduError::TooShort {
        expected: 1,
        actual: 0,
    })?;
    let len = len as usize;
    if len > max {
        return Err(PduError::FieldTooLong {
            field,
            max,
            actual: len,
        });
    }
    if rest.len() < len {
        return Err(PduError::TooShort {
            expected: len,
            actual: rest.len(),
        });
    }
    let (name, rest) = rest.split_at(len);
    let name = String::from_utf8(name.to_vec()).map_err(|_| PduError::InvalidText { field })?;
    Ok((name, rest))
}

fn push_name(out: &mut Vec<u8>, name: &str) {
    // u8 length prefix; names are bounded at 64 bytes by the caller.
    let bytes = &name.as_bytes()[..name.len().min(u8::MAX as usize)];
    out.push(bytes.len() as u8);
    out.extend_from_slice(bytes);
}

impl Pdu {
    /// Creates an `AssociateRq` PDU.
    #[must_use]
    pub fn associate_rq(
        version: u16,
        max_pdu_length: u32,
        context: &str,
        calling: &str,
        called: &str,
    ) -> Self {
        Self::AssociateRq {
            version,
            max_pdu_length,
            context: context.to_owned(),
            calling: calling.to_owned(),
            called: called.to_owned(),
        }
    }

    /// Creates an `AssociateAc` PDU.
    #[must_use]
    pub fn associate_ac(version: u16, max_pdu_length: u32, context: &str) -> Self {
        Self::AssociateAc {
            version,
            max_pdu_length,
            context: context.to_owned(),
        }
    }

    /// Creates an `AssociateRj` PDU with the given reason code.
    #[must_use]
    pub const fn associate_rj(reason: u8) -> Self {
        Self::AssociateRj { reason }
    }

    /// Creates a `Data` PDU.
    #[must_use]
    pub fn data(payload: &[u8]) -> Self {
        Self::Data {
            payload: payload.to_vec(),
        }
    }

    /// Creates a `ReleaseRq` PDU.
    #[must_use]
    pub const fn release_rq() -> Self {
        Self::ReleaseRq
    }

    /// Creates a `ReleaseRp` PDU.
    #[must_use]
    pub const fn release_rp() -> Self {
        Self::ReleaseRp
    }

    /// Creates an `Abort` PDU with the given reason code.
    #[must_use]
    pub const fn abort(reason: u8) -> Self {
        Self::Abort { reason }
    }

    /// Returns the wire type byte for this PDU.
    #[must_use]
    pub const fn kind(&self) -> u8 {
        match self {
            Self::AssociateRq { .. } => TYPE_ASSOCIATE_RQ,
            Self::AssociateAc { .. } => TYPE_ASSOCIATE_AC,
            Self::AssociateRj { .. } => TYPE_ASSOCIATE_RJ,
            Self::Data { .. } => TYPE_DATA,
            Self::ReleaseRq => TYPE_RELEASE_RQ,
            Self::ReleaseRp => TYPE_RELEASE_RP,
            Self::Abort { .. } => TYPE_ABORT,
        }
    }

    fn body(&self) -> Vec<u8> {
        match self {
            Self::AssociateRq {
                version,
                max_pdu_length,
                context,
                calling,
                called,
            } => {
                let mut v = Vec::with_capacity(9 + context.len() + calling.len() + called.len());
                v.extend_from_slice(&version.to_be_bytes());
                v.extend_from_slice(&max_pdu_length.to_be_bytes());
                push_name(&mut v, context);
                push_name(&mut v, calling);
                push_name(&mut v, called);
                v
            }
            Self::AssociateAc {
                version,
                max_pdu_length,
                context,
            } => {
                let mut v = Vec::with_capacity(7 + context.len());
                v.extend_from_slice(&version.to_be_bytes());
                v.extend_from_slice(&max_pdu_length.to_be_bytes());
                push_name(&mut v, context);
                v
            }
            Self::AssociateRj { reason } | Self::Abort { reason } => vec![*reason],
            Self::Data { payload } => payload.clone(),
            Self::ReleaseRq | Self::ReleaseRp => Vec::new(),
        }
    }

    /// Serializes this PDU, header included, for transmission.
    ///
    /// # Examples
    ///
    /// ```
    /// use imx_common::pdu::{Pdu, TYPE_DATA};
    /// let bytes = Pdu::data(b"hello").serialize();
    /// assert_eq!(bytes[0], TYPE_DATA);
    /// assert_eq!(&bytes[6..], b"hello");
    /// ```
    #[must_use]
    pub fn serialize(&self) -> Vec<u8> {
        let body = self.body();
        let mut v = Vec::with_capacity(HEADER_LEN + body.len());
        v.push(self.kind());
        v.push(0);
        v.extend_from_slice(&(body.len() as u32).to_be_bytes());
        v.extend_from_slice(&body);
        v
    }

    /// Parses a complete PDU (header plus body) from a byte slice.
    ///
    /// # Errors
    ///
    /// Returns [`PduError`] if the slice is empty, too short, carries a
    /// mismatched length header, or has an unrecognized type byte.
    ///
    /// # Examples
    ///
    /// ```
    /// use imx_common::pdu::Pdu;
    /// let pdu = Pdu::data(b"hello");
    /// let parsed = Pdu::parse(&pdu.serialize()).unwrap();
    /// assert_eq!(pdu, parsed);
    /// ```
    pub fn parse(data: &[u8]) -> Result<Self, PduError> {
        if data.is_empty() {
            return Err(PduError::Empty);
        }
        if data.len() < HEADER_LEN {
            return Err(PduError::TooShort {
                expected: HEADER_LEN,
                actual: data.len(),
            });
        }
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&data[..HEADER_LEN]);
        let (kind, declared) = parse_header(&header)?;
        let body = &data[HEADER_LEN..];
        if body.len() != declared {
            return Err(PduError::LengthMismatch {
                declared,
                actual: body.len(),
            });
        }
        Self::parse_body(kind, body)
    }

    /// Parses a PDU body whose header has already been consumed.
    ///
    /// # Errors
    ///
    /// Returns [`PduError`] if the body is malformed for the given type.
    pub fn parse_body(kind: u8, body: &[u8]) -> Result<Self, PduError> {
        match kind {
            TYPE_ASSOCIATE_RQ => {
                if body.len() < 9 {
                    return Err(PduError::TooShort {
                        expected: 9,
                        actual: body.len(),
                    });
                }
                let version = u16::from_be_bytes([body[0], body[1]]);
                let max_pdu_length = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
                let rest = &body[6..];
                let (context, rest) = read_name(rest, "application context", MAX_CONTEXT_NAME)?;
                let (calling, rest) = read_name(rest, "calling node name", MAX_NODE_NAME)?;
                let (called, _) = read_name(rest, "called node name", MAX_NODE_NAME)?;
                Ok(Self::AssociateRq {
                    version,
                    max_pdu_length,
                    context,
                    calling,
                    called,
                })
            }
            TYPE_ASSOCIATE_AC => {
                if body.len() < 7 {
                    return Err(PduError::TooShort {
                        expected: 7,
                        actual: body.len(),
                    });
                }
                let version = u16::from_be_bytes([body[0], body[1]]);
                let max_pdu_length = u32::from_be_bytes([body[2], body[3], body[4], body[5]]);
                let (context, _) = read_name(&body[6..], "application context", MAX_CONTEXT_NAME)?;
                Ok(Self::AssociateAc {
                    version,
                    max_pdu_length,
                    context,
                })
            }
            TYPE_ASSOCIATE_RJ => {
                if body.is_empty() {
                    return Err(PduError::TooShort {
                        expected: 1,
                        actual: 0,
                    });
                }
                Ok(Self::AssociateRj { reason: body[0] })
            }
            TYPE_DATA => Ok(Self::Data {
                payload: body.to_vec(),
            }),
            TYPE_RELEASE_RQ => Ok(Self::ReleaseRq),
            TYPE_RELEASE_RP => Ok(Self::ReleaseRp),
            TYPE_ABORT => {
                if body.is_empty() {
                    return Err(PduError::TooShort {
                        expected: 1,
                        actual: 0,
                    });
                }
                Ok(Self::Abort { reason: body[0] })
            }
            t => Err(PduError::UnknownType(t)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{APPLICATION_CONTEXT, PROTOCOL_VERSION};

    #[test]
    fn serialize_writes_header_then_body() {
        let bytes = Pdu::data(b"hello").serialize();
        assert_eq!(bytes[0], TYPE_DATA);
        assert_eq!(bytes[1], 0);
        assert_eq!(u32::from_be_bytes([bytes[2], bytes[3], bytes[4], bytes[5]]), 5);
        assert_eq!(&bytes[6..], b"hello");
    }

    #[test]
    fn associate_rq_round_trip() {
        let pdu = Pdu::associate_rq(
            PROTOCOL_VERSION,
            200_000,
            APPLICATION_CONTEXT,
            "STORE-SCU",
            "ARCHIVE",
        );
        let parsed = Pdu::parse(&pdu.serialize()).unwrap();
        assert_eq!(pdu, parsed);
        assert_eq!(parsed.kind(), TYPE_ASSOCIATE_RQ);
    }

    #[test]
    fn associate_ac_round_trip() {
        let pdu = Pdu::associate_ac(PROTOCOL_VERSION, 400_000, APPLICATION_CONTEXT);
        let parsed = Pdu::parse(&pdu.serialize()).unwrap();
        match parsed {
            Pdu::AssociateAc { max_pdu_length, .. } => assert_eq!(max_pdu_length, 400_000),
            other => panic!("expected AssociateAc, got {other:?}"),
        }
    }

    #[test]
    fn associate_rj_round_trip() {
        let bytes = Pdu::associate_rj(0x01).serialize();
        let parsed = Pdu::parse(&bytes).unwrap();
        assert!(matches!(parsed, Pdu::AssociateRj { reason: 0x01 }));
    }

    #[test]
    fn release_and_abort_round_trip() {
        assert_eq!(Pdu::parse(&Pdu::release_rq().serialize()).unwrap(), Pdu::ReleaseRq);
        assert_eq!(Pdu::parse(&Pdu::release_rp().serialize()).unwrap(), Pdu::ReleaseRp);
        let parsed = Pdu::parse(&Pdu::abort(0x02).serialize()).unwrap();
        assert!(matches!(parsed, Pdu::Abort { reason: 0x02 }));
    }

    #[test]
    fn data_empty_payload() {
        let parsed = Pdu::parse(&Pdu::data(&[]).serialize()).unwrap();
        if let Pdu::Data { payload } = parsed {
            assert!(payload.is_empty());
        } else {
            panic!("expected Data pdu");
        }
    }

    #[test]
    fn empty_input_is_error() {
        assert_eq!(Pdu::parse(&[]), Err(PduError::Empty));
    }

    #[test]
    fn truncated_header_is_error() {
        let result = Pdu::parse(&[TYPE_DATA, 0, 0]);
        assert!(matches!(result, Err(PduError::TooShort { .. })));
    }

    #[test]
    fn unknown_type_is_error() {
        let mut bytes = Pdu::data(b"x").serialize();
        bytes[0] = 0xFF;
        assert!(matches!(Pdu::parse(&bytes), Err(PduError::UnknownType(0xFF))));
    }

    #[test]
    fn length_mismatch_is_error() {
        let mut bytes = Pdu::data(b"hello").serialize();
        bytes[5] = 99; // declare a longer body than is present
        assert!(matches!(Pdu::parse(&bytes), Err(PduError::LengthMismatch { .. })));
    }

    #[test]
    fn truncated_associate_rq_body_is_error() {
        let pdu = Pdu::associate_rq(1, 4096, APPLICATION_CONTEXT, "A", "B");
        let bytes = pdu.serialize();
        // Chop the called-name bytes off and fix up the header length.
        let mut short = bytes[..bytes.len() - 2].to_vec();
        let body_len = (short.len() - HEADER_LEN) as u32;
        short[2..6].copy_from_slice(&body_len.to_be_bytes());
        assert!(matches!(Pdu::parse(&short), Err(PduError::TooShort { .. })));
    }

    #[test]
    fn oversized_context_name_is_rejected() {
        let long = "x".repeat(MAX_CONTEXT_NAME + 1);
        let bytes = Pdu::associate_rq(1, 4096, &long, "A", "B").serialize();
        assert!(matches!(
            Pdu::parse(&bytes),
            Err(PduError::FieldTooLong { field: "application context", .. })
        ));
    }

    #[test]
    fn non_utf8_name_is_rejected() {
        let pdu = Pdu::associate_ac(1, 4096, "ok");
        let mut bytes = pdu.serialize();
        let ctx_start = HEADER_LEN + 7;
        bytes[ctx_start] = 0xFF;
        bytes[ctx_start + 1] = 0xFE;
        assert!(matches!(Pdu::parse(&bytes), Err(PduError::InvalidText { .. })));
    }

    #[test]
    fn parse_header_reports_kind_and_length() {
        let bytes = Pdu::data(&[0u8; 300]).serialize();
        let mut header = [0u8; HEADER_LEN];
        header.copy_from_slice(&bytes[..HEADER_LEN]);
        assert_eq!(parse_header(&header).unwrap(), (TYPE_DATA, 300));
    }

    #[test]
    fn all_pdu_kinds_have_correct_type_byte() {
        assert_eq!(Pdu::associate_rq(1, 0, "c", "a", "b").kind(), TYPE_ASSOCIATE_RQ);
        assert_eq!(Pdu::associate_ac(1, 0, "c").kind(), TYPE_ASSOCIATE_AC);
        assert_eq!(Pdu::associate_rj(0).kind(), TYPE_ASSOCIATE_RJ);
        assert_eq!(Pdu::data(&[]).kind(), TYPE_DATA);
        assert_eq!(Pdu::release_rq().kind(), TYPE_RELEASE_RQ);
        assert_eq!(Pdu::release_rp().kind(), TYPE_RELEASE_RP);
        assert_eq!(Pdu::abort(0).kind(), TYPE_ABORT);
    }
}
