//! TLS configuration for both ends of the pipe.
//!
//! The server side presents either a caller-supplied certificate or a
//! self-signed stub generated for the configured SNI. The client side mimics
//! a mobile OkHttp client: its ClientHello advertises the cipher-suite and
//! key-exchange ordering of Android's TLS stack rather than rustls defaults,
//! so the pipe does not stand out by fingerprint.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::ring;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{version, ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme, SupportedCipherSuite};
use tracing::{info, warn};

/// Default server name used for the ClientHello SNI and the stub certificate
/// when nothing is configured.
pub const DEFAULT_SNI: &str = "example.org";

/// Builds the server-side TLS config.
///
/// When no certificate files are given a self-signed stub is synthesized for
/// `server_name`. TLS 1.2 is the floor either way.
pub fn server_config(
    cert_path: Option<&Path>,
    key_path: Option<&Path>,
    server_name: &str,
) -> Result<Arc<ServerConfig>> {
    let (certs, key) = match (cert_path, key_path) {
        (Some(cert_path), Some(key_path)) => {
            info!("using the supplied TLS certificate");
            load_pem(cert_path, key_path)?
        }
        (None, None) => {
            info!("generating a stub certificate for {server_name}");
            stub_certificate(server_name)?
        }
        _ => bail!("TLS certificate and key files must be supplied together"),
    };

    let config = ServerConfig::builder_with_provider(Arc::new(ring::default_provider()))
        .with_protocol_versions(&[&version::TLS12, &version::TLS13])
        .context("failed to configure TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("invalid TLS certificate or key")?;

    Ok(Arc::new(config))
}

fn load_pem(
    cert_path: &Path,
    key_path: &Path,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let mut cert_reader = BufReader::new(
        File::open(cert_path)
            .with_context(|| format!("failed to open certificate file {}", cert_path.display()))?,
    );
    let certs = rustls_pemfile::certs(&mut cert_reader)
        .collect::<std::io::Result<Vec<_>>>()
        .context("failed to parse certificate file")?;
    if certs.is_empty() {
        bail!("no certificates found in {}", cert_path.display());
    }

    let mut key_reader = BufReader::new(
        File::open(key_path)
            .with_context(|| format!("failed to open key file {}", key_path.display()))?,
    );
    let key = rustls_pemfile::private_key(&mut key_reader)
        .context("failed to parse key file")?
        .with_context(|| format!("no private key found in {}", key_path.display()))?;

    Ok((certs, key))
}

/// Generates a throwaway self-signed certificate for the given name.
fn stub_certificate(
    server_name: &str,
) -> Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let certified = rcgen::generate_simple_self_signed(vec![server_name.to_string()])
        .context("failed to generate a stub certificate")?;

    let cert = certified.cert.der().clone();
    let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(
        certified.key_pair.serialize_der(),
    ));

    Ok((vec![cert], key))
}

/// Cipher suites in the order Android's OkHttp stack advertises them.
fn okhttp_cipher_suites() -> Vec<SupportedCipherSuite> {
    vec![
        ring::cipher_suite::TLS13_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS13_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS13_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
        ring::cipher_suite::TLS_ECDHE_ECDSA_WITH_CHACHA20_POLY1305_SHA256,
        ring::cipher_suite::TLS_ECDHE_RSA_WITH_CHACHA20_POLY1305_SHA256,
    ]
}

/// Builds the client-side TLS config with the OkHttp ClientHello profile.
///
/// Certificate verification is off unless `verify` is set: the pipe is not a
/// CA-authenticated service and usually runs against a stub certificate.
pub fn client_config(verify: bool) -> Result<Arc<ClientConfig>> {
    let provider = rustls::crypto::CryptoProvider {
        cipher_suites: okhttp_cipher_suites(),
        kx_groups: vec![ring::kx_group::X25519, ring::kx_group::SECP256R1, ring::kx_group::SECP384R1],
        ..ring::default_provider()
    };

    let builder = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&version::TLS12, &version::TLS13])
        .context("failed to configure TLS protocol versions")?;

    let mut config = if verify {
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for cert in native.certs {
            let _ = roots.add(cert);
        }
        if !native.errors.is_empty() {
            warn!(
                "native certificate loading reported {} issues, continuing with available roots",
                native.errors.len()
            );
        }
        if roots.is_empty() {
            roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
        }

        builder.with_root_certificates(roots).with_no_client_auth()
    } else {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerify))
            .with_no_client_auth()
    };

    config.enable_sni = true;
    // The WebSocket upgrade is HTTP/1.1-based; advertising h2 could make the
    // far side negotiate HTTP/2 and break the upgrade.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Parses a host string into a rustls server name.
pub fn server_name(host: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(host.to_string())
        .with_context(|| format!("invalid TLS server name {host}"))
}

/// Accepts any server certificate.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
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
        ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stub_certificate_generation() {
        let (certs, _key) = stub_certificate(DEFAULT_SNI).unwrap();
        assert_eq!(certs.len(), 1);
        assert!(!certs[0].is_empty());
    }

    #[test]
    fn test_server_config_requires_both_files() {
        let err = server_config(Some(Path::new("/tmp/cert.pem")), None, DEFAULT_SNI);
        assert!(err.is_err());
    }

    #[test]
    fn test_client_config_alpn_is_http11() {
        let config = client_config(false).unwrap();
        assert_eq!(config.alpn_protocols, vec![b"http/1.1".to_vec()]);
    }

    #[test]
    fn test_server_name_rejects_garbage() {
        assert!(server_name("not a hostname").is_err());
        assert!(server_name("example.org").is_ok());
    }
}
