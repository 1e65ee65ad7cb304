//! Common wire types shared across the IMX imaging transport stack.
//!
//! This crate provides:
//! - Protocol-data-unit serialization and parsing ([`pdu`])
//! - Protocol constants and wire code definitions ([`types`])

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod pdu;
pub mod types;

pub use pdu::{Pdu, PduError};
