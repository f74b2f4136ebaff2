//! TLS wrapping for `secure-tcp` listeners and outbound connections
//! (spec.md §4.1, §4.3). Certificate/key file handling beyond loading PEM
//! bytes is the caller's (daemon binary's) job, per spec.md §1 — the core
//! only needs a "plain or secure stream" capability.

use std::io::BufReader;
use std::sync::Arc;

use rustls::{Certificate, PrivateKey, ServerConfig};
use rustls_pemfile::{certs, pkcs8_private_keys};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio_rustls::{TlsAcceptor, TlsConnector};

#[derive(Debug, Error)]
pub enum TlsSetupError {
    #[error("io error reading certificate material: {0}")]
    Io(#[from] std::io::Error),
    #[error("no certificates found in PEM input")]
    NoCertificates,
    #[error("no private key found in PEM input")]
    NoPrivateKey,
    #[error("rustls configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

pub fn load_certificates(pem: &[u8]) -> Result<Vec<Certificate>, TlsSetupError> {
    let mut reader = BufReader::new(pem);
    let raw = certs(&mut reader)?;
    if raw.is_empty() {
        return Err(TlsSetupError::NoCertificates);
    }
    Ok(raw.into_iter().map(Certificate).collect())
}

pub fn load_private_key(pem: &[u8]) -> Result<PrivateKey, TlsSetupError> {
    let mut reader = BufReader::new(pem);
    let mut keys = pkcs8_private_keys(&mut reader)?;
    keys.pop().map(PrivateKey).ok_or(TlsSetupError::NoPrivateKey)
}

/// Build a server-side TLS acceptor for the `secure-tcp` listener.
pub fn build_acceptor(
    certificates: Vec<Certificate>,
    private_key: PrivateKey,
) -> Result<TlsAcceptor, TlsSetupError> {
    let config = ServerConfig::builder()
        .with_safe_defaults()
        .with_no_client_auth()
        .with_single_cert(certificates, private_key)?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Build a client-side TLS connector for dialing a `secure-tcp` peer.
/// `verify_certificates` is forced off only in test contexts (mirrors the
/// teacher's `SkipServerVerification`, used there for the same reason).
pub fn build_connector(verify_certificates: bool) -> TlsConnector {
    let mut root_store = rustls::RootCertStore::empty();
    if verify_certificates {
        if let Ok(native) = rustls_native_certs::load_native_certs() {
            for cert in native {
                let _ = root_store.add(&Certificate(cert.0));
            }
        }
    }

    let builder = rustls::ClientConfig::builder().with_safe_defaults();
    let config = if verify_certificates {
        builder
            .with_root_certificates(root_store)
            .with_no_client_auth()
    } else {
        let mut config = builder
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier))
            .with_no_client_auth();
        config.enable_sni = false;
        config
    };

    TlsConnector::from(Arc::new(config))
}

/// Accepts any server certificate. Used only when `verify_certificates` is
/// explicitly disabled (local development / test fixtures), matching the
/// teacher's `SkipServerVerification`.
struct InsecureVerifier;

impl rustls::client::ServerCertVerifier for InsecureVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<rustls::client::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::ServerCertVerified::assertion())
    }
}

/// Generate a self-signed certificate for loopback/testing use, the way
/// the teacher's `cert_utils::generate_self_signed_cert` does.
pub fn generate_self_signed_cert(subject_alt_names: Vec<String>) -> Result<(Vec<u8>, Vec<u8>), TlsSetupError> {
    let cert = rcgen::generate_simple_self_signed(subject_alt_names)
        .map_err(|err| TlsSetupError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string())))?;
    let cert_pem = cert.serialize_pem().map_err(|err| {
        TlsSetupError::Io(std::io::Error::new(std::io::ErrorKind::Other, err.to_string()))
    })?;
    let key_pem = cert.serialize_private_key_pem();
    Ok((cert_pem.into_bytes(), key_pem.into_bytes()))
}

/// Wrap an accepted TCP stream in TLS for the `secure-tcp` listener.
pub async fn accept(
    acceptor: &TlsAcceptor,
    stream: TcpStream,
) -> Result<tokio_rustls::server::TlsStream<TcpStream>, std::io::Error> {
    acceptor.accept(stream).await
}

/// Wrap an outbound TCP stream in TLS for a `secure-tcp` dial.
pub async fn connect(
    connector: &TlsConnector,
    domain: &str,
    stream: TcpStream,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>, std::io::Error> {
    let server_name = rustls::ServerName::try_from(domain)
        .map_err(|_| std::io::Error::new(std::io::ErrorKind::InvalidInput, "invalid DNS name"))?;
    connector.connect(server_name, stream).await
}
