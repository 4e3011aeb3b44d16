//! TLS for the local leg when the proxied service speaks HTTPS

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

use crate::config::TunnelConfig;
use crate::ClientError;

/// Connector plus the name checked against the local certificate
#[derive(Clone)]
pub struct LocalTls {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for LocalTls {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalTls")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

impl LocalTls {
    /// `None` unless the config asks for HTTPS to the local service
    pub fn from_config(config: &TunnelConfig) -> Result<Option<Self>, ClientError> {
        if !config.local_https {
            return Ok(None);
        }

        let server_name = ServerName::try_from(config.local_host.clone())
            .map_err(|e| ClientError::Tls(format!("invalid local host name: {}", e)))?;

        Ok(Some(Self {
            connector: build_connector(config)?,
            server_name,
        }))
    }
}

fn build_connector(config: &TunnelConfig) -> Result<TlsConnector, ClientError> {
    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .map_err(|e| ClientError::Tls(e.to_string()))?;

    let builder = if config.allow_invalid_cert {
        warn!("Certificate verification disabled for the local service");
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyCert {
                algorithms: provider.signature_verification_algorithms,
            }))
    } else {
        let mut roots = rustls::RootCertStore::empty();
        match &config.local_ca {
            Some(ca) => {
                let (added, ignored) = roots.add_parsable_certificates(read_certs(ca)?);
                if added == 0 {
                    return Err(ClientError::Tls(format!(
                        "no usable CA certificate in {}",
                        ca.display()
                    )));
                }
                if ignored > 0 {
                    debug!("Skipped {} unparsable certificates in {}", ignored, ca.display());
                }
            }
            None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
        }
        builder.with_root_certificates(roots)
    };

    let client_config = match (&config.local_cert, &config.local_key) {
        (Some(cert), Some(key)) => builder
            .with_client_auth_cert(read_certs(cert)?, read_key(key)?)
            .map_err(|e| ClientError::Tls(format!("invalid client cert/key: {}", e)))?,
        _ => builder.with_no_client_auth(),
    };

    Ok(TlsConnector::from(Arc::new(client_config)))
}

fn pem_reader(path: &Path) -> Result<BufReader<File>, ClientError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|e| ClientError::Tls(format!("failed to open {}: {}", path.display(), e)))
}

fn read_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, ClientError> {
    let certs = rustls_pemfile::certs(&mut pem_reader(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ClientError::Tls(format!("failed to parse {}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(ClientError::Tls(format!("no certificates in {}", path.display())));
    }
    Ok(certs)
}

fn read_key(path: &Path) -> Result<PrivateKeyDer<'static>, ClientError> {
    match rustls_pemfile::private_key(&mut pem_reader(path)?) {
        Ok(Some(key)) => Ok(key),
        Ok(None) => Err(ClientError::Tls(format!("no private key in {}", path.display()))),
        Err(e) => Err(ClientError::Tls(format!("failed to parse {}: {}", path.display(), e))),
    }
}

/// Trusts any certificate chain but still checks handshake signatures
#[derive(Debug)]
struct AcceptAnyCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ServerCertVerifier for AcceptAnyCert {
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> crate::TunnelConfigBuilder {
        TunnelConfig::builder().local_port(8443)
    }

    #[test]
    fn test_plain_local_leg() {
        let config = config().build().unwrap();
        assert!(LocalTls::from_config(&config).unwrap().is_none());
    }

    #[test]
    fn test_default_roots() {
        let config = config().local_https(true).build().unwrap();
        let tls = LocalTls::from_config(&config).unwrap().unwrap();
        assert_eq!(tls.server_name.to_str(), "localhost");
    }

    #[test]
    fn test_insecure_mode() {
        let config = config()
            .local_https(true)
            .allow_invalid_cert(true)
            .local_host("10.0.0.5")
            .build()
            .unwrap();
        assert!(LocalTls::from_config(&config).unwrap().is_some());
    }

    #[test]
    fn test_accept_any_cert_offers_provider_schemes() {
        let verifier = AcceptAnyCert {
            algorithms: rustls::crypto::ring::default_provider().signature_verification_algorithms,
        };
        let schemes = verifier.supported_verify_schemes();
        assert!(schemes.contains(&SignatureScheme::ECDSA_NISTP256_SHA256));
        assert!(schemes.contains(&SignatureScheme::ED25519));
    }

    #[test]
    fn test_empty_key_file() {
        let path = std::env::temp_dir().join(format!("burrow-empty-key-{}.pem", std::process::id()));
        std::fs::write(&path, "").unwrap();
        let result = read_key(&path);
        std::fs::remove_file(&path).unwrap();
        assert!(matches!(result, Err(ClientError::Tls(msg)) if msg.starts_with("no private key")));
    }

    #[test]
    fn test_missing_ca_file() {
        let config = config()
            .local_https(true)
            .local_ca("/nonexistent/ca.pem")
            .build()
            .unwrap();
        assert!(matches!(
            LocalTls::from_config(&config),
            Err(ClientError::Tls(_))
        ));
    }
}
