//! TLS support for the inbound listener

use rustls::pki_types::CertificateDer;
use rustls::ServerConfig;
use rustls_pemfile::{certs, private_key};
use smtprelay_common::config::TlsConfig;
use smtprelay_common::RelayError;
use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::TlsAcceptor;
use tracing::info;

/// Load the configured certificate chain and key into an acceptor.
pub fn create_tls_acceptor(tls_config: &TlsConfig) -> Result<TlsAcceptor, RelayError> {
    let cert_file = File::open(&tls_config.cert_file).map_err(|e| {
        RelayError::Config(format!(
            "failed to open certificate {}: {e}",
            tls_config.cert_file.display()
        ))
    })?;
    let mut cert_reader = BufReader::new(cert_file);
    let certs: Vec<CertificateDer<'static>> = certs(&mut cert_reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| RelayError::Config(format!("failed to parse certificates: {e}")))?;
    if certs.is_empty() {
        return Err(RelayError::Config(format!(
            "no certificates in {}",
            tls_config.cert_file.display()
        )));
    }
    info!(count = certs.len(), "loaded TLS certificate chain");

    let key_file = File::open(&tls_config.key_file).map_err(|e| {
        RelayError::Config(format!(
            "failed to open key {}: {e}",
            tls_config.key_file.display()
        ))
    })?;
    let mut key_reader = BufReader::new(key_file);
    let key = private_key(&mut key_reader)
        .map_err(|e| RelayError::Config(format!("failed to read private key: {e}")))?
        .ok_or_else(|| {
            RelayError::Config(format!(
                "no private key in {}",
                tls_config.key_file.display()
            ))
        })?;

    let server_config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| RelayError::Config(format!("failed to build TLS config: {e}")))?;

    Ok(TlsAcceptor::from(Arc::new(server_config)))
}
