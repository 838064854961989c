//! TLS material for the API server connection
//!
//! Kubeconfig files carry PEM data: a CA bundle to trust, and a client
//! certificate plus key used as the TLS identity. Both are handed to reqwest
//! (rustls backend).

use std::fmt;
use std::io::BufReader;

use crate::errors::PodtunnelError;

/// TLS settings for the upgrade request
#[derive(Clone, Default)]
pub struct TlsSettings {
    /// Skip server certificate verification (insecure, for testing only)
    pub insecure_skip_verify: bool,
    /// PEM bundle of additional trusted CA certificates
    pub ca_pem: Option<Vec<u8>>,
    /// PEM client certificate chain
    pub client_cert_pem: Option<Vec<u8>>,
    /// PEM private key matching `client_cert_pem`
    pub client_key_pem: Option<Vec<u8>>,
}

impl fmt::Debug for TlsSettings {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsSettings")
            .field("insecure_skip_verify", &self.insecure_skip_verify)
            .field("ca_pem", &self.ca_pem.as_ref().map(|c| c.len()))
            .field("client_cert_pem", &self.client_cert_pem.is_some())
            .field("client_key_pem", &self.client_key_pem.as_ref().map(|_| "[REDACTED]"))
            .finish()
    }
}

impl TlsSettings {
    /// Check if a client certificate is configured
    pub fn has_identity(&self) -> bool {
        self.client_cert_pem.is_some()
    }

    /// Apply these settings to a reqwest client builder
    pub fn apply_to_builder(
        &self,
        mut builder: reqwest::ClientBuilder,
    ) -> Result<reqwest::ClientBuilder, PodtunnelError> {
        if self.insecure_skip_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        if let Some(ca_pem) = &self.ca_pem {
            for cert in load_ca_bundle(ca_pem)? {
                builder = builder.add_root_certificate(cert);
            }
        }

        if let Some(identity) = self.load_identity()? {
            builder = builder.identity(identity);
        }

        Ok(builder)
    }

    /// Combine certificate and key into a reqwest identity
    fn load_identity(&self) -> Result<Option<reqwest::Identity>, PodtunnelError> {
        let cert = match &self.client_cert_pem {
            Some(cert) => cert,
            None => return Ok(None),
        };

        let mut combined = cert.clone();
        if let Some(key) = &self.client_key_pem {
            combined.extend_from_slice(b"\n");
            combined.extend_from_slice(key);
        }

        let identity = reqwest::Identity::from_pem(&combined)
            .map_err(|e| PodtunnelError::Config(format!("Failed to load client certificate: {}", e)))?;
        Ok(Some(identity))
    }
}

/// Parse every certificate in a PEM bundle
fn load_ca_bundle(pem: &[u8]) -> Result<Vec<reqwest::Certificate>, PodtunnelError> {
    let mut reader = BufReader::new(pem);
    let mut certs = Vec::new();

    for cert_result in rustls_pemfile::certs(&mut reader) {
        let cert = cert_result
            .map_err(|e| PodtunnelError::Config(format!("Failed to parse CA bundle: {}", e)))?;
        let cert = reqwest::Certificate::from_der(&cert)
            .map_err(|e| PodtunnelError::Config(format!("Failed to parse CA certificate: {}", e)))?;
        certs.push(cert);
    }

    if certs.is_empty() {
        return Err(PodtunnelError::Config(
            "CA bundle contains no PEM certificates".to_string()
        ));
    }

    Ok(certs)
}
