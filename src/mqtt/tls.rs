//! Broker options and TLS material for direct connections

use std::fmt;
use std::sync::Arc;

use rumqttc::tokio_rustls::rustls;
use rumqttc::tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use rumqttc::tokio_rustls::rustls::crypto::{self, WebPkiSupportedAlgorithms};
use rumqttc::tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rumqttc::tokio_rustls::rustls::{DigitallySignedStruct, SignatureScheme};
use rumqttc::{MqttOptions, TlsConfiguration, Transport};
use tracing::{debug, warn};

use super::config::ConnectionConfig;
use super::error::ConnectError;

/// Translates a [`ConnectionConfig`] into rumqttc options.
pub fn mqtt_options(config: &ConnectionConfig) -> Result<MqttOptions, ConnectError> {
    if config.hostname.trim().is_empty() {
        return Err(ConnectError::Transport(
            "no broker hostname configured".to_string(),
        ));
    }
    if config.client_id.trim().is_empty() {
        return Err(ConnectError::Transport("client id must not be empty".to_string()));
    }

    let mut options = MqttOptions::new(&config.client_id, &config.hostname, config.port);
    options.set_keep_alive(config.keep_alive());
    if !config.username.is_empty() {
        options.set_credentials(&config.username, &config.password);
    }
    if config.use_tls {
        options.set_transport(tls_transport(config)?);
    }
    Ok(options)
}

fn tls_transport(config: &ConnectionConfig) -> Result<Transport, ConnectError> {
    if !config.reject_unauthorized {
        warn!(
            "Server certificate verification disabled for {}",
            config.endpoint()
        );
        if !config.client_certificate.is_empty() {
            warn!("Client certificate is not presented when verification is disabled");
        }
        let verifier = AcceptAnyServerCert::new();
        let client_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(verifier))
            .with_no_client_auth();
        return Ok(Transport::tls_with_config(TlsConfiguration::Rustls(
            Arc::new(client_config),
        )));
    }

    if config.ca_certificate.trim().is_empty() {
        return Err(ConnectError::Transport(
            "TLS with certificate verification needs a CA certificate".to_string(),
        ));
    }

    let client_auth = match (
        config.client_certificate.trim().is_empty(),
        config.client_key.trim().is_empty(),
    ) {
        (true, true) => None,
        (false, false) => Some((
            config.client_certificate.as_bytes().to_vec(),
            config.client_key.as_bytes().to_vec(),
        )),
        _ => {
            return Err(ConnectError::Transport(
                "client certificate and client key must be given together".to_string(),
            ))
        }
    };
    debug!(
        "TLS with CA certificate, mutual auth: {}",
        client_auth.is_some()
    );

    Ok(Transport::tls_with_config(TlsConfiguration::Simple {
        ca: config.ca_certificate.as_bytes().to_vec(),
        alpn: None,
        client_auth,
    }))
}

/// Accepts any server certificate but still checks handshake signatures.
struct AcceptAnyServerCert {
    algorithms: WebPkiSupportedAlgorithms,
}

impl AcceptAnyServerCert {
    fn new() -> Self {
        Self {
            algorithms: crypto::ring::default_provider().signature_verification_algorithms,
        }
    }
}

impl fmt::Debug for AcceptAnyServerCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AcceptAnyServerCert")
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
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_options() {
        let config = ConnectionConfig {
            hostname: "broker.lan".to_string(),
            port: 1884,
            username: "meter".to_string(),
            password: "pw".to_string(),
            ..ConnectionConfig::default()
        };
        let options = mqtt_options(&config).unwrap();
        assert_eq!(
            options.broker_address(),
            ("broker.lan".to_string(), 1884)
        );
        assert_eq!(
            options.credentials(),
            Some(("meter".to_string(), "pw".to_string()))
        );
        assert!(matches!(options.transport(), Transport::Tcp));
    }

    #[test]
    fn test_empty_hostname_is_transport_error() {
        let config = ConnectionConfig {
            hostname: "  ".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            mqtt_options(&config),
            Err(ConnectError::Transport(_))
        ));
    }

    #[test]
    fn test_verified_tls_needs_ca() {
        let config = ConnectionConfig {
            use_tls: true,
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            mqtt_options(&config),
            Err(ConnectError::Transport(_))
        ));
    }

    #[test]
    fn test_client_cert_without_key_rejected() {
        let config = ConnectionConfig {
            use_tls: true,
            ca_certificate: "ca".to_string(),
            client_certificate: "cert".to_string(),
            ..ConnectionConfig::default()
        };
        assert!(matches!(
            mqtt_options(&config),
            Err(ConnectError::Transport(_))
        ));
    }

    #[test]
    fn test_ca_selects_simple_tls() {
        let config = ConnectionConfig {
            use_tls: true,
            ca_certificate: "ca".to_string(),
            client_certificate: "cert".to_string(),
            client_key: "key".to_string(),
            ..ConnectionConfig::default()
        };
        let options = mqtt_options(&config).unwrap();
        match options.transport() {
            Transport::Tls(TlsConfiguration::Simple { client_auth, .. }) => {
                assert!(client_auth.is_some());
            }
            _ => panic!("expected simple TLS transport"),
        }
    }

    #[test]
    fn test_unverified_tls_uses_custom_config() {
        let config = ConnectionConfig {
            use_tls: true,
            reject_unauthorized: false,
            ..ConnectionConfig::default()
        };
        let options = mqtt_options(&config).unwrap();
        assert!(matches!(
            options.transport(),
            Transport::Tls(TlsConfiguration::Rustls(_))
        ));
    }
}
