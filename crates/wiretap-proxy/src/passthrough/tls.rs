//! TLS policy for the pass-through client connection.
//!
//! By default the pass-through subsystem verifies upstream certificates
//! normally, using the platform's trust roots. A rule can opt specific hosts
//! out of verification (`ignore_host_https_errors`), which installs
//! [`NoVerifier`] only for the upstream connector used for those hosts —
//! the downstream-facing listener's own TLS identity is untouched.

use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{ClientConfig, DigitallySignedStruct};

use crate::error::{ProxyError, Result};
use crate::step::{ClientCertificate, IgnoreHttpsErrors};

/// Accepts any certificate chain. Used only for hosts a rule has explicitly
/// opted out of verification for via `ignore_host_https_errors`.
#[derive(Debug)]
pub struct NoVerifier;

impl ServerCertVerifier for NoVerifier {
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

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        vec![
            rustls::SignatureScheme::RSA_PKCS1_SHA256,
            rustls::SignatureScheme::RSA_PKCS1_SHA384,
            rustls::SignatureScheme::RSA_PKCS1_SHA512,
            rustls::SignatureScheme::ECDSA_NISTP256_SHA256,
            rustls::SignatureScheme::ECDSA_NISTP384_SHA384,
            rustls::SignatureScheme::ED25519,
            rustls::SignatureScheme::RSA_PSS_SHA256,
            rustls::SignatureScheme::RSA_PSS_SHA384,
            rustls::SignatureScheme::RSA_PSS_SHA512,
        ]
    }
}

/// Whether `host:port` opted out of verification per spec §4.4 step 4
/// ("strict HTTPS checks = NOT (hostname in ignoreHostHttpsErrors OR
/// host:port in same OR the list is the boolean `true`)").
pub fn should_ignore_cert_errors(policy: &IgnoreHttpsErrors, host: &str, port: u16) -> bool {
    policy.allows(host, port)
}

/// Builds the Mozilla root set plus any rule-supplied `extraCACertificates`
/// (spec §4.4 step 4: "Trusted CA set = Node/system roots plus
/// extraCACertificates").
fn trusted_root_store(extra_ca_certificates_pem: &[Vec<u8>]) -> Result<rustls::RootCertStore> {
    let mut root_store = rustls::RootCertStore {
        roots: webpki_roots::TLS_SERVER_ROOTS.iter().cloned().collect(),
    };
    for pem in extra_ca_certificates_pem {
        for cert in rustls_pemfile::certs(&mut pem.as_slice()) {
            let cert = cert.map_err(|e| ProxyError::Validation(format!("invalid extra CA certificate: {e}")))?;
            root_store
                .add(cert)
                .map_err(|e| ProxyError::Validation(format!("could not trust extra CA certificate: {e}")))?;
        }
    }
    Ok(root_store)
}

/// Loads a rule's `clientCertificateHostMap` entry for `host:port`, falling
/// back to a bare-`host` entry (spec §4.4 step 4: "Client cert = map lookup
/// by `host:port` then `host`").
fn client_cert_for_host<'a>(
    map: &'a std::collections::HashMap<String, ClientCertificate>,
    host: &str,
    port: u16,
) -> Option<&'a ClientCertificate> {
    map.get(&format!("{host}:{port}")).or_else(|| map.get(host))
}

fn parse_client_cert(cert: &ClientCertificate) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut cert.cert_chain_pem.as_slice())
        .collect::<std::result::Result<_, _>>()
        .map_err(|e| ProxyError::Validation(format!("invalid client certificate chain: {e}")))?;
    let key = rustls_pemfile::private_key(&mut cert.private_key_pem.as_slice())
        .map_err(|e| ProxyError::Validation(format!("invalid client certificate key: {e}")))?
        .ok_or_else(|| ProxyError::Validation("client certificate PEM had no private key".into()))?;
    Ok((chain, key))
}

/// Builds a `rustls::ClientConfig` for the upstream connection, trusting the
/// extra CA set and presenting a client certificate if the host map has one.
/// `rustls` only ever negotiates TLS 1.2/1.3 (it dropped 1.0/1.1 support
/// entirely for security reasons), so spec §4.4 step 4's "min TLS version
/// `TLSv1` when non-strict" has no effect here beyond what verification
/// itself already relaxes — documented in DESIGN.md.
pub fn client_config_for_host(
    ignore_host_https_errors: &IgnoreHttpsErrors,
    extra_ca_certificates_pem: &[Vec<u8>],
    client_certificate_host_map: &std::collections::HashMap<String, ClientCertificate>,
    host: &str,
    port: u16,
) -> Result<Arc<ClientConfig>> {
    let client_cert = client_cert_for_host(client_certificate_host_map, host, port);

    let mut config = if should_ignore_cert_errors(ignore_host_https_errors, host, port) {
        let builder = ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier));
        match client_cert {
            Some(cert) => {
                let (chain, key) = parse_client_cert(cert)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ProxyError::Validation(format!("invalid client certificate: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    } else {
        let builder = ClientConfig::builder().with_root_certificates(trusted_root_store(extra_ca_certificates_pem)?);
        match client_cert {
            Some(cert) => {
                let (chain, key) = parse_client_cert(cert)?;
                builder
                    .with_client_auth_cert(chain, key)
                    .map_err(|e| ProxyError::Validation(format!("invalid client certificate: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    };
    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_should_ignore_cert_errors_case_insensitive() {
        let policy = IgnoreHttpsErrors::Hosts(vec!["Example.com".to_string()]);
        assert!(should_ignore_cert_errors(&policy, "example.com", 443));
        assert!(!should_ignore_cert_errors(&policy, "other.com", 443));
    }

    #[test]
    fn test_should_ignore_cert_errors_all() {
        let policy = IgnoreHttpsErrors::All;
        assert!(should_ignore_cert_errors(&policy, "anything.example", 8443));
    }

    #[test]
    fn test_client_cert_for_host_prefers_host_port_entry() {
        use std::collections::HashMap;
        let mut map = HashMap::new();
        map.insert(
            "example.com".to_string(),
            ClientCertificate {
                cert_chain_pem: b"bare-host".to_vec(),
                private_key_pem: vec![],
            },
        );
        map.insert(
            "example.com:8443".to_string(),
            ClientCertificate {
                cert_chain_pem: b"host-port".to_vec(),
                private_key_pem: vec![],
            },
        );
        let found = client_cert_for_host(&map, "example.com", 8443).unwrap();
        assert_eq!(found.cert_chain_pem, b"host-port");
        let fallback = client_cert_for_host(&map, "example.com", 1234).unwrap();
        assert_eq!(fallback.cert_chain_pem, b"bare-host");
    }
}
