//! rustls client configuration shared by both transports.

use anyhow::{Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::options::TlsOptions;

/// ALPN for the raw QUIC binding
pub const ALPN_LOOM: &[u8] = b"loom";

/// ALPN for the HTTP/3 binding
pub const ALPN_H3: &[u8] = b"h3";

/// Build a client configuration advertising `alpn`
pub fn client_config(options: &TlsOptions, alpn: &[&[u8]]) -> Result<ClientConfig> {
    // Install default crypto provider if not already set
    let _ = rustls::crypto::ring::default_provider().install_default();

    let builder = ClientConfig::builder();
    let builder = if options.insecure_skip_verify {
        warn!("TLS certificate verification disabled");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert::new()))
    } else {
        builder.with_root_certificates(root_store(options.ca_file.as_deref())?)
    };

    let mut config = match (&options.cert_file, &options.key_file) {
        (None, None) => builder.with_no_client_auth(),
        (Some(cert_file), Some(key_file)) => {
            let certs = load_certs(cert_file)?;
            let key = load_key(key_file)?;
            debug!("Presenting client certificate from {:?}", cert_file);
            builder
                .with_client_auth_cert(certs, key)
                .context("Failed to configure client certificate")?
        }
        _ => anyhow::bail!("client certificate and key must be configured together"),
    };

    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

fn root_store(ca_file: Option<&Path>) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    match ca_file {
        Some(path) => {
            for cert in load_certs(path)? {
                roots
                    .add(cert)
                    .context("Failed to add CA certificate to root store")?;
            }
        }
        None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    let certs = rustls_pemfile::certs(&mut pem.as_slice())
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse certificates in {:?}", path))?;
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {:?}", path);
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path).with_context(|| format!("Failed to read {:?}", path))?;
    rustls_pemfile::private_key(&mut pem.as_slice())
        .with_context(|| format!("Failed to parse private key in {:?}", path))?
        .ok_or_else(|| anyhow::anyhow!("No private key found in {:?}", path))
}

/// Verifier behind `insecure_skip_verify`
#[derive(Debug)]
struct AcceptAnyServerCert {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_insecure_config_sets_alpn() {
        let options = TlsOptions {
            insecure_skip_verify: true,
            ..TlsOptions::default()
        };
        let config = client_config(&options, &[ALPN_LOOM]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"loom".to_vec()]);
    }

    #[test]
    fn test_default_roots() {
        let config = client_config(&TlsOptions::default(), &[ALPN_H3]).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"h3".to_vec()]);
    }

    #[test]
    fn test_missing_ca_file() {
        let options = TlsOptions {
            ca_file: Some("/nonexistent/ca.pem".into()),
            ..TlsOptions::default()
        };
        assert!(client_config(&options, &[ALPN_LOOM]).is_err());
    }

    #[test]
    fn test_empty_ca_file() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"not a certificate").unwrap();
        let options = TlsOptions {
            ca_file: Some(file.path().to_path_buf()),
            ..TlsOptions::default()
        };
        let err = client_config(&options, &[ALPN_LOOM]).unwrap_err();
        assert!(err.to_string().contains("No certificates found"));
    }

    #[test]
    fn test_cert_without_key() {
        let options = TlsOptions {
            insecure_skip_verify: true,
            cert_file: Some("client.pem".into()),
            ..TlsOptions::default()
        };
        assert!(client_config(&options, &[ALPN_LOOM]).is_err());
    }
}
