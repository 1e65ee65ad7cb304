//! IMX transport and session layer — a TLS-capable TCP listener that hands
//! negotiated associations to pluggable per-connection services.
#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod association;
/// Server/client options and CLI argument parsing.
pub mod config;
mod connection;
/// Error types for transport and session operations.
pub mod error;
/// Prometheus metrics collection and HTTP endpoint.
pub mod metrics;
/// Process-wide port → server instance registry.
pub mod registry;
pub mod server;
/// Per-connection service handler contract.
pub mod service;
pub mod tls;
pub mod transport;

pub use association::{accept_association, Association, AssociationParams};
pub use config::{ClientOptions, ServerOptions};
pub use error::NetError;
pub use registry::ServerRegistry;
pub use server::{ServerHandle, ServerInstance};
pub use service::{service_fn, EchoFactory, Service, ServiceFactory};
pub use transport::TransportStream;
