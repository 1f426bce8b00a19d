//! TLS client configuration for relay and remote-radio connections.
//!
//! The SmartLink relay and remote radios present certificates that are not
//! checked by stock clients, so the default [`TrustPolicy`] accepts any
//! certificate. A caller that wants real verification supplies its own
//! root store with [`TrustPolicy::Roots`]; transport code does not change.

use std::fmt;
use std::sync::Arc;

use rustls::ClientConfig;
use rustls::RootCertStore;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::TlsConnector;

use flexlink_core::error::{Error, Result};

/// How the server certificate is checked during the TLS upgrade.
#[derive(Clone, Default)]
pub enum TrustPolicy {
    /// Accept any certificate.
    #[default]
    AcceptAll,
    /// Verify the chain against these roots and check the server name.
    Roots(Arc<RootCertStore>),
}

impl fmt::Debug for TrustPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrustPolicy::AcceptAll => write!(f, "AcceptAll"),
            TrustPolicy::Roots(roots) => write!(f, "Roots({} anchors)", roots.len()),
        }
    }
}

impl TrustPolicy {
    /// Build the rustls client configuration for this policy.
    pub fn client_config(&self) -> Arc<ClientConfig> {
        let config = match self {
            TrustPolicy::AcceptAll => ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
                .with_no_client_auth(),
            TrustPolicy::Roots(roots) => ClientConfig::builder()
                .with_root_certificates(Arc::clone(roots))
                .with_no_client_auth(),
        };
        Arc::new(config)
    }

    /// A connector ready to wrap TCP streams.
    pub fn connector(&self) -> TlsConnector {
        TlsConnector::from(self.client_config())
    }
}

/// Convert a host string (DNS name or IP literal) into a TLS server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_owned())
        .map_err(|e| Error::InvalidParameter(format!("invalid TLS server name {host:?}: {e}")))
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ECDSA_NISTP521_SHA512,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
            rustls::SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_accepts_all() {
        assert!(matches!(TrustPolicy::default(), TrustPolicy::AcceptAll));
    }

    #[test]
    fn accept_all_builds_config() {
        let config = TrustPolicy::AcceptAll.client_config();
        assert!(config.alpn_protocols.is_empty());
    }

    #[test]
    fn roots_policy_builds_config() {
        let policy = TrustPolicy::Roots(Arc::new(RootCertStore::empty()));
        let _ = policy.client_config();
        assert_eq!(format!("{policy:?}"), "Roots(0 anchors)");
    }

    #[test]
    fn server_name_accepts_dns_and_ip() {
        assert!(server_name("smartlink.flexradio.com").is_ok());
        assert!(server_name("192.168.1.20").is_ok());
        assert!(server_name("").is_err());
    }
}
