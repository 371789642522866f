//! TLS client configuration for outbound CSMS connections
//!
//! Builds a rustls connector from the configured CA bundle, optional client
//! certificate, and the insecure-skip-verify escape hatch. When TLS settings
//! are absent, `wss://` URLs fall back to the library default (native roots).

use std::fs::File;
use std::io::BufReader;
use std::path::PathBuf;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use serde::{Deserialize, Serialize};
use tokio_tungstenite::Connector;
use tracing::warn;

use super::client::ClientError;

/// TLS settings for a station's outbound connection.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TlsSettings {
    /// Build a custom rustls connector instead of the library default
    #[serde(default)]
    pub enabled: bool,
    /// PEM bundle the server certificate is verified against; native roots
    /// when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_path: Option<PathBuf>,
    /// PEM client certificate chain presented to the server
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_cert_path: Option<PathBuf>,
    /// PEM private key for the client certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_key_path: Option<PathBuf>,
    /// Skip server certificate verification entirely
    #[serde(default)]
    pub insecure_skip_verify: bool,
}

/// Build the connector handed to `connect_async_tls_with_config`.
///
/// `None` leaves TLS handling to tokio-tungstenite's default.
pub fn build_connector(settings: &TlsSettings) -> Result<Option<Connector>, ClientError> {
    if !settings.enabled {
        return Ok(None);
    }

    // Pin the crypto provider explicitly; relying on the process default
    // panics when more than one provider feature is linked in.
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(format!("protocol versions: {}", e)))?;

    let config = if settings.insecure_skip_verify {
        warn!("TLS server certificate verification is DISABLED");
        let builder = builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(InsecureVerifier));
        with_client_auth(builder, settings)?
    } else {
        let roots = load_roots(settings)?;
        let builder = builder.with_root_certificates(roots);
        with_client_auth(builder, settings)?
    };

    Ok(Some(Connector::Rustls(Arc::new(config))))
}

fn load_roots(settings: &TlsSettings) -> Result<RootCertStore, ClientError> {
    let mut roots = RootCertStore::empty();
    match settings.ca_cert_path {
        Some(ref path) => {
            for cert in read_certs(path)? {
                roots
                    .add(cert)
                    .map_err(|e| ClientError::Tls(format!("bad CA certificate: {}", e)))?;
            }
        }
        None => {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }
    }
    Ok(roots)
}

fn with_client_auth(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>,
    settings: &TlsSettings,
) -> Result<ClientConfig, ClientError> {
    match (&settings.client_cert_path, &settings.client_key_path) {
        (Some(cert_path), Some(key_path)) => {
            let certs = read_certs(cert_path)?;
            let key = read_key(key_path)?;
            builder
                .with_client_auth_cert(certs, key)
                .map_err(|e| ClientError::Tls(format!("bad client certificate: {}", e)))
        }
        (None, None) => Ok(builder.with_no_client_auth()),
        _ => Err(ClientError::Tls(
            "client certificate and key must both be set".to_string(),
        )),
    }
}

fn read_certs(path: &PathBuf) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("cannot parse {}: {}", path.display(), e)))
}

fn read_key(path: &PathBuf) -> Result<PrivateKeyDer<'static>, ClientError> {
    let file = File::open(path)
        .map_err(|e| ClientError::Tls(format!("cannot open {}: {}", path.display(), e)))?;
    let mut reader = BufReader::new(file);
    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| ClientError::Tls(format!("cannot parse {}: {}", path.display(), e)))?
        .ok_or_else(|| ClientError::Tls(format!("no private key in {}", path.display())))
}

/// Accepts any server certificate. Only reachable through
/// `insecure_skip_verify = true`.
#[derive(Debug)]
struct InsecureVerifier;

impl ServerCertVerifier for InsecureVerifier {
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
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disabled_settings_use_library_default() {
        let connector = build_connector(&TlsSettings::default()).unwrap();
        assert!(connector.is_none());
    }

    #[test]
    fn cert_without_key_rejected() {
        let settings = TlsSettings {
            enabled: true,
            client_cert_path: Some(PathBuf::from("/tmp/client.pem")),
            ..Default::default()
        };
        assert!(matches!(
            build_connector(&settings),
            Err(ClientError::Tls(_))
        ));
    }

    #[test]
    fn insecure_verifier_builds() {
        let settings = TlsSettings {
            enabled: true,
            insecure_skip_verify: true,
            ..Default::default()
        };
        assert!(build_connector(&settings).unwrap().is_some());
    }
}
