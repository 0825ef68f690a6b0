//! rustls configuration for both ends of a transaction.
//!
//! Gemini uses TLS without the web PKI: servers commonly present
//! self-signed certificates, and clients may present a certificate of their
//! own as an identity. The builders here encode that trust model:
//!
//! - [`server_config`] asks every client for a certificate but does not
//!   require one, and accepts whatever is presented.
//! - [`client_config`] does not validate the server's chain (trust on first
//!   use is left to the caller) and optionally presents an [`Identity`].
//!
//! Both still verify handshake signatures, so a peer must own the private
//! key of the certificate it presents. The protocol floor is TLS 1.2.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{CryptoProvider, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{
    ClientConfig, DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme,
    SupportedProtocolVersion,
};
use thiserror::Error;

/// TLS versions offered when no prebuilt config is supplied.
pub static PROTOCOL_VERSIONS: &[&SupportedProtocolVersion] =
    &[&rustls::version::TLS13, &rustls::version::TLS12];

/// Errors produced while building TLS configuration.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("TLS error: {0}")]
    Rustls(#[from] rustls::Error),

    #[error("no certificates found in PEM input")]
    NoCertificates,

    #[error("no private key found in PEM input")]
    NoPrivateKey,
}

/// A certificate chain plus its private key, presented to the peer.
#[derive(Debug)]
pub struct Identity {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Identity {
    pub fn new(certs: Vec<CertificateDer<'static>>, key: PrivateKeyDer<'static>) -> Self {
        Self { certs, key }
    }

    /// Load an identity from PEM-encoded certificate and key files.
    pub fn from_pem_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        Ok(Self {
            certs: load_certs(cert_path)?,
            key: load_private_key(key_path)?,
        })
    }
}

impl Clone for Identity {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Server-side config presenting `certs`/`key` and accepting any client
/// certificate.
pub fn server_config(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let provider = provider();
    let verifier = AcceptAnyClientCert {
        provider: Arc::clone(&provider),
    };

    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .with_client_cert_verifier(Arc::new(verifier))
        .with_single_cert(certs, key)?;
    Ok(Arc::new(config))
}

/// [`server_config`] from PEM files on disk.
pub fn server_config_from_pem(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<Arc<ServerConfig>, TlsError> {
    let identity = Identity::from_pem_files(cert_path, key_path)?;
    server_config(identity.certs, identity.key)
}

/// Client-side config that skips chain validation and optionally presents
/// `identity`.
pub fn client_config(identity: Option<Identity>) -> Result<Arc<ClientConfig>, TlsError> {
    let provider = provider();
    let verifier = SkipChainVerification {
        provider: Arc::clone(&provider),
    };

    let builder = ClientConfig::builder_with_provider(provider)
        .with_protocol_versions(PROTOCOL_VERSIONS)?
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(verifier));

    let config = match identity {
        Some(Identity { certs, key }) => builder.with_client_auth_cert(certs, key)?,
        None => builder.with_no_client_auth(),
    };
    Ok(Arc::new(config))
}

/// Read every certificate from a PEM file.
pub fn load_certs(path: impl AsRef<Path>) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let file = File::open(path)?;
    parse_certs(&mut BufReader::new(file))
}

/// Read the first private key (PKCS#8, PKCS#1 or SEC1) from a PEM file.
pub fn load_private_key(path: impl AsRef<Path>) -> Result<PrivateKeyDer<'static>, TlsError> {
    let file = File::open(path)?;
    parse_private_key(&mut BufReader::new(file))
}

/// Parse every certificate in PEM input.
pub fn parse_certs(pem: &mut dyn io::BufRead) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    let certs = rustls_pemfile::certs(pem).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsError::NoCertificates);
    }
    Ok(certs)
}

/// Parse the first private key in PEM input.
pub fn parse_private_key(pem: &mut dyn io::BufRead) -> Result<PrivateKeyDer<'static>, TlsError> {
    rustls_pemfile::private_key(pem)?.ok_or(TlsError::NoPrivateKey)
}

/// Accepts any server certificate; handshake signatures are still checked.
#[derive(Debug)]
struct SkipChainVerification {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for SkipChainVerification {
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
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// Offers client authentication without requiring it, and accepts any
/// presented certificate.
#[derive(Debug)]
struct AcceptAnyClientCert {
    provider: Arc<CryptoProvider>,
}

impl ClientCertVerifier for AcceptAnyClientCert {
    fn client_auth_mandatory(&self) -> bool {
        false
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    fn self_signed() -> (String, String) {
        let cert = rcgen::generate_simple_self_signed(vec!["localhost".to_owned()]).unwrap();
        (cert.cert.pem(), cert.key_pair.serialize_pem())
    }

    #[test]
    fn parses_rcgen_pem() {
        let (cert_pem, key_pem) = self_signed();
        let certs = parse_certs(&mut Cursor::new(cert_pem.as_bytes())).unwrap();
        assert_eq!(certs.len(), 1);
        parse_private_key(&mut Cursor::new(key_pem.as_bytes())).unwrap();
    }

    #[test]
    fn empty_pem_is_rejected() {
        assert!(matches!(
            parse_certs(&mut Cursor::new(&b""[..])),
            Err(TlsError::NoCertificates)
        ));
        assert!(matches!(
            parse_private_key(&mut Cursor::new(&b""[..])),
            Err(TlsError::NoPrivateKey)
        ));
    }

    #[test]
    fn builds_server_and_client_configs() {
        let (cert_pem, key_pem) = self_signed();
        let certs = parse_certs(&mut Cursor::new(cert_pem.as_bytes())).unwrap();
        let key = parse_private_key(&mut Cursor::new(key_pem.as_bytes())).unwrap();
        let identity = Identity::new(certs.clone(), key.clone_key());

        server_config(certs, key).unwrap();
        client_config(Some(identity)).unwrap();
        client_config(None).unwrap();
    }

    #[test]
    fn client_certificate_is_optional() {
        let verifier = AcceptAnyClientCert { provider: provider() };
        assert!(verifier.offer_client_auth());
        assert!(!verifier.client_auth_mandatory());
        assert!(!verifier.supported_verify_schemes().is_empty());
    }

    #[test]
    fn missing_file_is_io_error() {
        assert!(matches!(
            load_certs("/nonexistent/cert.pem"),
            Err(TlsError::Io(_))
        ));
    }
}
