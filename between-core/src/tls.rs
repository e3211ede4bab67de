//! Static certificate loading for the TLS listener.
//!
//! The listener presents one fixed certificate/key pair for every client.

use crate::config::TlsConfig;
use crate::error::ProxyError;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::ServerConfig;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::debug;

/// Build an acceptor from the PEM files named in `config`.
pub fn create_tls_acceptor(config: &TlsConfig) -> Result<TlsAcceptor, ProxyError> {
    let cert_pem = read_pem(&config.cert_file)?;
    let key_pem = read_pem(&config.key_file)?;
    acceptor_from_pem(&cert_pem, &key_pem)
}

/// Build an acceptor from an in-memory certificate chain and private key.
pub fn acceptor_from_pem(cert_pem: &[u8], key_pem: &[u8]) -> Result<TlsAcceptor, ProxyError> {
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut &cert_pem[..])
        .collect::<Result<_, _>>()
        .map_err(|e| ProxyError::Tls(format!("invalid certificate PEM: {}", e)))?;
    if certs.is_empty() {
        return Err(ProxyError::Tls("no certificates found in PEM".into()));
    }

    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut &key_pem[..])
        .map_err(|e| ProxyError::Tls(format!("invalid key PEM: {}", e)))?
        .ok_or_else(|| ProxyError::Tls("no private key found in PEM".into()))?;

    debug!("Loaded {} certificate(s) for TLS listener", certs.len());

    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)?;

    // Requests are relayed one at a time through hyper's HTTP/1 server path.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsAcceptor::from(Arc::new(config)))
}

fn read_pem(path: &Path) -> Result<Vec<u8>, ProxyError> {
    fs::read(path).map_err(|e| {
        ProxyError::Configuration(format!("cannot read {}: {}", path.display(), e))
    })
}
