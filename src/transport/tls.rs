//! TLS upgrade for STARTTLS.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::ring as ring_provider;
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::warn;

use super::BoxStream;
use crate::error::{ErrorKind, Result, XmppError};

/// Server certificate trust policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TlsPolicy {
    /// Verify against the platform trust store. The default.
    SystemRoots,
    /// Skip certificate verification entirely. Only for explicit opt-in
    /// against servers with self-signed certificates; the session is still
    /// encrypted but not authenticated.
    AcceptAnyCertificate,
}

/// Certificate verifier that accepts anything, backing
/// [`TlsPolicy::AcceptAnyCertificate`].
#[derive(Debug)]
struct AcceptAnyVerifier;

impl ServerCertVerifier for AcceptAnyVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        ring_provider::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Build a TLS connector for the given policy. The ring provider is
/// selected explicitly so the config builds the same regardless of which
/// other providers the dependency graph pulled in.
pub fn connector(policy: TlsPolicy) -> Result<TlsConnector> {
    let builder = ClientConfig::builder_with_provider(Arc::new(ring_provider::default_provider()))
        .with_safe_default_protocol_versions()
        .map_err(|e| XmppError::with_source(ErrorKind::Transport, "TLS config failed", e))?;
    let config = match policy {
        TlsPolicy::SystemRoots => {
            let mut roots = RootCertStore::empty();
            let certs = rustls_native_certs::load_native_certs();
            for error in &certs.errors {
                warn!(%error, "failed to load a native root certificate");
            }
            for cert in certs.certs {
                if let Err(e) = roots.add(cert) {
                    warn!(error = %e, "rejected native root certificate");
                }
            }
            if roots.is_empty() {
                return Err(XmppError::transport("no usable root certificates"));
            }
            builder.with_root_certificates(roots).with_no_client_auth()
        }
        TlsPolicy::AcceptAnyCertificate => {
            warn!("TLS certificate verification disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyVerifier))
                .with_no_client_auth()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

/// Run the TLS handshake over `stream`, verifying against `name`.
pub async fn upgrade(stream: BoxStream, name: &str, policy: TlsPolicy) -> Result<BoxStream> {
    let connector = connector(policy)?;
    let server_name = ServerName::try_from(name.to_string())
        .map_err(|e| XmppError::with_source(ErrorKind::Transport, "invalid TLS server name", e))?;
    let tls = connector
        .connect(server_name, stream)
        .await
        .map_err(|e| XmppError::with_source(ErrorKind::Transport, "TLS handshake failed", e))?;
    Ok(Box::new(tls))
}
