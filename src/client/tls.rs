//! Backend TLS policy: one `TlsConnector` per proxy process, configured by
//! the backend transport mode.

use std::fs::File;
use std::io::BufReader;
use std::sync::Arc;

use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::client::verify_server_cert_signed_by_trust_anchor;
use tokio_rustls::rustls::crypto::{self, aws_lc_rs, CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::server::ParsedCertificate;
use tokio_rustls::rustls::{
    CertificateError, ClientConfig, DigitallySignedStruct, Error as TlsError, RootCertStore,
    SignatureScheme,
};
use tokio_rustls::TlsConnector;

use super::config::SslMode;
use crate::config::{BackendTlsConfig, ConfigError};

fn default_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(aws_lc_rs::default_provider()))
}

/// Validates the certificate chain against the configured roots but skips
/// hostname verification, matching `verify-ca` semantics.
#[derive(Debug)]
struct SkipHostnameVerifier {
    roots: Arc<RootCertStore>,
    supported: WebPkiSupportedAlgorithms,
}

impl SkipHostnameVerifier {
    fn new(roots: Arc<RootCertStore>, provider: &CryptoProvider) -> Self {
        Self {
            roots,
            supported: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for SkipHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        let cert = ParsedCertificate::try_from(end_entity)
            .map_err(|_| TlsError::InvalidCertificate(CertificateError::BadEncoding))?;

        verify_server_cert_signed_by_trust_anchor(
            &cert,
            &self.roots,
            intermediates,
            now,
            self.supported.all,
        )?;

        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls12_signature(message, cert, dss, &self.supported)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        crypto::verify_tls13_signature(message, cert, dss, &self.supported)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

/// Accepts any certificate. Used for the encrypted-no-verify mode, which
/// wants the wire encrypted but performs no validation.
#[derive(Debug)]
struct NoopVerifier {
    supported: WebPkiSupportedAlgorithms,
}

impl NoopVerifier {
    fn new(provider: &CryptoProvider) -> Self {
        Self {
            supported: provider.signature_verification_algorithms,
        }
    }
}

impl ServerCertVerifier for NoopVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, TlsError> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.supported.supported_schemes()
    }
}

fn load_certs(path: &std::path::Path) -> Result<Vec<CertificateDer<'static>>, ConfigError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })
}

fn load_private_key(path: &std::path::Path) -> Result<PrivateKeyDer<'static>, ConfigError> {
    let mut reader = BufReader::new(File::open(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ConfigError::FileRead {
            path: path.to_path_buf(),
            source: e,
        })?
        .ok_or_else(|| ConfigError::InvalidValue {
            name: "private key file",
            value: path.display().to_string(),
        })
}

fn load_root_store(cfg: &BackendTlsConfig) -> Result<Arc<RootCertStore>, ConfigError> {
    let path = cfg
        .root_ca
        .as_ref()
        .ok_or(ConfigError::MissingRootCa)?;
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .map_err(|_| ConfigError::InvalidValue {
                name: "root ca file",
                value: path.display().to_string(),
            })?;
    }
    Ok(Arc::new(roots))
}

/// The per-process backend transport state handed to every connect call.
#[derive(Clone)]
pub struct BackendTransport {
    pub mode: SslMode,
    pub(crate) connector: Option<TlsConnector>,
}

impl std::fmt::Debug for BackendTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackendTransport")
            .field("mode", &self.mode)
            .finish_non_exhaustive()
    }
}

impl BackendTransport {
    pub fn plaintext() -> BackendTransport {
        BackendTransport {
            mode: SslMode::Disable,
            connector: None,
        }
    }

    /// Build the connector for the configured mode. Client certificates are
    /// attached when both halves of the pair are configured; a lone half is
    /// rejected by config validation before this point.
    pub fn from_config(cfg: &BackendTlsConfig) -> Result<BackendTransport, ConfigError> {
        if cfg.mode == SslMode::Disable {
            return Ok(BackendTransport::plaintext());
        }

        let provider = default_provider();

        let builder = match cfg.mode {
            SslMode::Disable => unreachable!(),
            SslMode::Require => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoopVerifier::new(&provider))),
            SslMode::VerifyCa => {
                let roots = load_root_store(cfg)?;
                ClientConfig::builder()
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(SkipHostnameVerifier::new(
                        roots, &provider,
                    )))
            }
            SslMode::VerifyFull => {
                let roots = load_root_store(cfg)?;
                ClientConfig::builder().with_root_certificates(roots)
            }
        };

        let client_config = match (&cfg.client_cert, &cfg.client_key) {
            (Some(cert), Some(key)) => builder
                .with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)
                .map_err(|e| ConfigError::InvalidValue {
                    name: "client certificate",
                    value: e.to_string(),
                })?,
            _ => builder.with_no_client_auth(),
        };

        Ok(BackendTransport {
            mode: cfg.mode,
            connector: Some(TlsConnector::from(Arc::new(client_config))),
        })
    }
}
