use crate::tls::TlsServerOptions;
use clap::Parser;
use imx_common::types::{
    APPLICATION_CONTEXT, DEFAULT_MAX_PDU_LENGTH, MAX_CONTEXT_NAME, MAX_NODE_NAME, MAX_PDU_LENGTH,
    MIN_PDU_LENGTH,
};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

/// Deadline for the encrypted-channel upgrade, client and server role alike.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(60);

/// Deadline for the association parameter exchange on the acceptor side.
pub const DEFAULT_ASSOCIATION_TIMEOUT: Duration = Duration::from_secs(30);

/// Read/write deadline for negotiation and release exchanges.
pub const DEFAULT_IO_TIMEOUT: Duration = Duration::from_secs(30);

/// CLI arguments for the imxd daemon.
#[derive(Parser, Debug, Clone)]
#[command(name = "imxd")]
#[command(about = "IMX imaging transport daemon")]
#[command(version)]
pub struct Args {
    /// Socket address to listen on.
    #[arg(long, default_value = "0.0.0.0:11112", env = "IMXD_LISTEN")]
    pub listen: SocketAddr,
    /// Socket address for the metrics endpoint.
    #[arg(long, default_value = "127.0.0.1:9090", env = "IMXD_METRICS")]
    pub metrics_addr: SocketAddr,
    /// Maximum protocol-data-unit length granted to peers, in bytes.
    #[arg(long, default_value = "262144", env = "IMXD_MAX_PDU")]
    pub max_pdu: u32,
    /// Application context name accepted from peers.
    #[arg(long, default_value = APPLICATION_CONTEXT, env = "IMXD_CONTEXT")]
    pub context: String,
    /// Association negotiation timeout in seconds.
    #[arg(long, default_value = "30", env = "IMXD_ASSOC_TIMEOUT")]
    pub assoc_timeout: u64,
    /// Encrypted-channel handshake deadline in seconds.
    #[arg(long, default_value = "60", env = "IMXD_HANDSHAKE_TIMEOUT")]
    pub handshake_timeout: u64,
    /// Read/write timeout for negotiation and release exchanges, in seconds.
    #[arg(long, default_value = "30", env = "IMXD_IO_TIMEOUT")]
    pub io_timeout: u64,
    /// Path to the TLS certificate chain (PEM). Enables TLS together with --tls-key.
    #[arg(long, env = "IMXD_TLS_CERT")]
    pub tls_cert: Option<PathBuf>,
    /// Path to the TLS private key (PEM).
    #[arg(long, env = "IMXD_TLS_KEY")]
    pub tls_key: Option<PathBuf>,
}

/// Options governing a server instance and its accept loop.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Address the listening socket binds to. The address family decides
    /// which peers can connect; `0.0.0.0` accepts IPv4 only.
    pub bind_addr: IpAddr,
    /// Maximum protocol-data-unit length this acceptor grants. The granted
    /// value governs the association regardless of the peer's proposal.
    pub max_pdu_length: u32,
    /// Application context name required of requestors.
    pub application_context: String,
    /// Whether to disable Nagle's algorithm on accepted sockets.
    pub no_delay: bool,
    /// Deadline for the association parameter exchange.
    pub association_timeout: Duration,
    /// Deadline for the encrypted-channel upgrade.
    pub handshake_timeout: Duration,
    /// Read/write deadline for negotiation and release exchanges.
    pub io_timeout: Duration,
    /// TLS material; `None` listens in the clear.
    pub tls: Option<TlsServerOptions>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            application_context: APPLICATION_CONTEXT.to_owned(),
            no_delay: true,
            association_timeout: DEFAULT_ASSOCIATION_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            io_timeout: DEFAULT_IO_TIMEOUT,
            tls: None,
        }
    }
}

impl ServerOptions {
    /// Validates the option values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        validate_pdu_length(self.max_pdu_length)?;
        validate_context(&self.application_context)?;

        if self.association_timeout.is_zero() {
            return Err("association_timeout must be greater than 0".to_string());
        }
        if self.association_timeout > Duration::from_secs(300) {
            return Err("association_timeout exceeds reasonable limit (300 seconds)".to_string());
        }

        validate_handshake_timeout(self.handshake_timeout)?;
        validate_io_timeout(self.io_timeout)?;
        Ok(())
    }
}

impl From<&Args> for ServerOptions {
    fn from(args: &Args) -> Self {
        let tls = match (&args.tls_cert, &args.tls_key) {
            (Some(cert), Some(key)) => Some(TlsServerOptions::new(cert, key)),
            _ => None,
        };
        Self {
            bind_addr: args.listen.ip(),
            max_pdu_length: args.max_pdu,
            application_context: args.context.clone(),
            no_delay: true,
            association_timeout: Duration::from_secs(args.assoc_timeout),
            handshake_timeout: Duration::from_secs(args.handshake_timeout),
            io_timeout: Duration::from_secs(args.io_timeout),
            tls,
        }
    }
}

/// Options governing an outbound connection and association request.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Host name or address to connect to.
    pub host: String,
    /// TCP port to connect to.
    pub port: u16,
    /// Whether to upgrade the connection to an encrypted channel.
    pub use_tls: bool,
    /// Whether to accept peer certificates that fail policy checks.
    /// Only honored when `use_tls` is set.
    pub ignore_cert_errors: bool,
    /// CA bundle (PEM) to verify the peer certificate against.
    pub ca_file: Option<PathBuf>,
    /// Whether to disable Nagle's algorithm on the socket.
    pub no_delay: bool,
    /// Maximum protocol-data-unit length to propose. The acceptor's grant,
    /// not this proposal, governs the association.
    pub max_pdu_length: u32,
    /// Application context name to propose.
    pub context: String,
    /// This node's name, sent in the association request.
    pub calling: String,
    /// The node name this request addresses.
    pub called: String,
    /// Read/write deadline for connection setup and negotiation exchanges.
    pub io_timeout: Duration,
    /// Deadline for the encrypted-channel upgrade.
    pub handshake_timeout: Duration,
}

impl ClientOptions {
    /// Creates options for connecting to `host:port` with defaults for
    /// everything else.
    #[must_use]
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            use_tls: false,
            ignore_cert_errors: false,
            ca_file: None,
            no_delay: true,
            max_pdu_length: DEFAULT_MAX_PDU_LENGTH,
            context: APPLICATION_CONTEXT.to_owned(),
            calling: "IMX-CLIENT".to_owned(),
            called: "IMX-SERVER".to_owned(),
            io_timeout: DEFAULT_IO_TIMEOUT,
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
        }
    }

    /// Enables the encrypted-channel upgrade.
    #[must_use]
    pub fn with_tls(mut self) -> Self {
        self.use_tls = true;
        self
    }

    /// Accepts peer certificates that fail policy checks.
    #[must_use]
    pub fn with_ignore_cert_errors(mut self) -> Self {
        self.ignore_cert_errors = true;
        self
    }

    /// Verifies the peer certificate against the given CA bundle.
    #[must_use]
    pub fn with_ca_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.ca_file = Some(path.into());
        self
    }

    /// Sets the max PDU length to propose.
    #[must_use]
    pub fn with_max_pdu_length(mut self, length: u32) -> Self {
        self.max_pdu_length = length;
        self
    }

    /// Sets the application context name to propose.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = context.into();
        self
    }

    /// Sets the setup read/write deadline.
    #[must_use]
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = timeout;
        self
    }

    /// Sets the encrypted-channel handshake deadline.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Validates the option values are within acceptable bounds.
    /// Returns Ok(()) if valid, Err with description otherwise.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("host must not be empty".to_string());
        }
        validate_pdu_length(self.max_pdu_length)?;
        validate_context(&self.context)?;

        if self.calling.len() > MAX_NODE_NAME {
            return Err(format!(
                "calling node name exceeds maximum length ({MAX_NODE_NAME} bytes)"
            ));
        }
        if self.called.len() > MAX_NODE_NAME {
            return Err(format!(
                "called node name exceeds maximum length ({MAX_NODE_NAME} bytes)"
            ));
        }

        validate_handshake_timeout(self.handshake_timeout)?;
        validate_io_timeout(self.io_timeout)?;
        Ok(())
    }
}

fn validate_pdu_length(length: u32) -> Result<(), String> {
    if length < MIN_PDU_LENGTH {
        return Err(format!(
            "max_pdu_length below minimum ({MIN_PDU_LENGTH} bytes)"
        ));
    }
    if length > MAX_PDU_LENGTH {
        return Err(format!(
            "max_pdu_length exceeds maximum ({MAX_PDU_LENGTH} bytes)"
        ));
    }
    Ok(())
}

fn validate_context(context: &str) -> Result<(), String> {
    if context.is_empty() {
        return Err("application context must not be empty".to_string());
    }
    if context.len() > MAX_CONTEXT_NAME {
        return Err(format!(
            "application context exceeds maximum length ({MAX_CONTEXT_NAME} bytes)"
        ));
    }
    Ok(())
}

fn validate_handshake_timeout(timeout: Duration) -> Result<(), String> {
    if timeout.is_zero() {
        return Err("handshake_timeout must be greater than 0".to_string());
    }
    if timeout > Duration::from_secs(600) {
        return Err("handshake_timeout exceeds reasonable limit (600 seconds)".to_string());
    }
    Ok(())
}

fn validate_io_timeout(timeout: Duration) -> Result<(), String> {
    if timeout.is_zero() {
        return Err("io_timeout must be greater than 0".to_string());
    }
    if timeout > Duration::from_secs(3600) {
        return Err("io_timeout exceeds reasonable limit (3600 seconds)".to_string());
    }
    Ok(())
}
