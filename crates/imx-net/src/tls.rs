//! TLS configuration for the encrypted-channel upgrade.
//!
//! Server role: certificate chain and key loaded from PEM files, protocol
//! versions restricted to TLS 1.2/1.3. Client role: peer verification
//! against a CA bundle, or an explicit opt-out that accepts policy errors.

use crate::config::ClientOptions;
use crate::error::NetError;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::TlsAcceptor;

/// TLS material for a server instance.
#[derive(Debug, Clone)]
pub struct TlsServerOptions {
    /// Path to the certificate chain file (PEM format).
    pub cert_path: PathBuf,
    /// Path to the private key file (PEM format).
    pub key_path: PathBuf,
}

impl TlsServerOptions {
    /// Creates TLS server options from certificate and key paths.
    pub fn new(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Self {
        Self {
            cert_path: cert_path.as_ref().to_path_buf(),
            key_path: key_path.as_ref().to_path_buf(),
        }
    }

    /// Builds the acceptor used to upgrade incoming sockets.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::Tls`] if the PEM files cannot be read or the
    /// configuration is rejected by rustls.
    pub fn build_acceptor(&self) -> Result<TlsAcceptor, NetError> {
        let certs = load_certs(&self.cert_path)?;
        let key = load_private_key(&self.key_path)?;

        let config = ServerConfig::builder_with_protocol_versions(&[
            &rustls::version::TLS13,
            &rustls::version::TLS12,
        ])
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| NetError::Tls(e.to_string()))?;

        Ok(TlsAcceptor::from(Arc::new(config)))
    }
}

/// Builds the client-side TLS configuration for an outbound connection.
///
/// # Errors
///
/// Returns [`NetError::Tls`] if the CA bundle cannot be read or the
/// configuration is rejected by rustls.
pub fn client_config(options: &ClientOptions) -> Result<Arc<ClientConfig>, NetError> {
    let config = if options.ignore_cert_errors {
        ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(danger::NoPolicyVerification::new()))
            .with_no_client_auth()
    } else {
        let mut roots = RootCertStore::empty();
        if let Some(ca) = &options.ca_file {
            for cert in load_certs(ca)? {
                roots
                    .add(cert)
                    .map_err(|e| NetError::Tls(format!("bad CA certificate: {e}")))?;
            }
        }
        ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth()
    };

    Ok(Arc::new(config))
}

/// Loads certificates from a PEM file.
fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, NetError> {
    let file = File::open(path).map_err(|e| {
        NetError::Tls(format!(
            "failed to open certificate file {}: {}",
            path.display(),
            e
        ))
    })?;
    let mut reader = BufReader::new(file);

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(Result::ok)
        .collect();

    if certs.is_empty() {
        return Err(NetError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Loads a private key from a PEM file. PKCS#8, PKCS#1 and SEC1 keys are
/// accepted; other PEM items are skipped.
fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, NetError> {
    let file = File::open(path)
        .map_err(|e| NetError::Tls(format!("failed to open key file {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader) {
            Ok(Some(rustls_pemfile::Item::Pkcs1Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs1(key));
            }
            Ok(Some(rustls_pemfile::Item::Pkcs8Key(key))) => {
                return Ok(PrivateKeyDer::Pkcs8(key));
            }
            Ok(Some(rustls_pemfile::Item::Sec1Key(key))) => {
                return Ok(PrivateKeyDer::Sec1(key));
            }
            Ok(Some(_)) => {}
            Ok(None) => break,
            Err(e) => {
                return Err(NetError::Tls(format!(
                    "failed to parse key file {}: {}",
                    path.display(),
                    e
                )));
            }
        }
    }

    Err(NetError::Tls(format!(
        "no private key found in {}",
        path.display()
    )))
}

mod danger {
    use tokio_rustls::rustls::client::danger::{
        HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
    };
    use tokio_rustls::rustls::crypto::{
        aws_lc_rs, verify_tls12_signature, verify_tls13_signature, CryptoProvider,
    };
    use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
    use tokio_rustls::rustls::{DigitallySignedStruct, Error, SignatureScheme};

    /// Verifier that skips certificate policy checks while still validating
    /// handshake signatures. Installed only on explicit opt-in.
    #[derive(Debug)]
    pub(super) struct NoPolicyVerification(CryptoProvider);

    impl NoPolicyVerification {
        pub(super) fn new() -> Self {
            Self(aws_lc_rs::default_provider())
        }
    }

    impl ServerCertVerifier for NoPolicyVerification {
        fn verify_server_cert(
            &self,
            _end_entity: &CertificateDer<'_>,
            _intermediates: &[CertificateDer<'_>],
            _server_name: &ServerName<'_>,
            _ocsp_response: &[u8],
            _now: UnixTime,
        ) -> Result<ServerCertVerified, Error> {
            Ok(ServerCertVerified::assertion())
        }

        fn verify_tls12_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn verify_tls13_signature(
            &self,
            message: &[u8],
            cert: &CertificateDer<'_>,
            dss: &DigitallySignedStruct,
        ) -> Result<HandshakeSignatureValid, Error> {
            verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
        }

        fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
            self.0.signature_verification_algorithms.supported_schemes()
        }
    }
}
