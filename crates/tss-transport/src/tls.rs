//! TLS identities and pinned certificate verification.
//!
//! Committee members do not use a PKI. Each party's configuration pins the
//! DER SubjectPublicKeyInfo of every peer's TLS certificate; a handshake
//! succeeds only if the presented certificate carries the pinned key.
//! Handshake signatures are still checked with the provider's algorithms.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, SignatureScheme};
use zeroize::Zeroizing;

use crate::TransportError;

/// A certificate and its PKCS#8 private key, both DER.
#[derive(Clone)]
pub struct TlsIdentity {
    cert_der: Vec<u8>,
    key_der: Zeroizing<Vec<u8>>,
}

impl std::fmt::Debug for TlsIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsIdentity")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl TlsIdentity {
    pub fn from_der(cert_der: Vec<u8>, key_der: Vec<u8>) -> Self {
        Self {
            cert_der,
            key_der: Zeroizing::new(key_der),
        }
    }

    /// Generate a self-signed ECDSA P-256 identity.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Tls`] if certificate generation fails.
    pub fn generate(name: &str) -> Result<Self, TransportError> {
        let key_pair = rcgen::KeyPair::generate()
            .map_err(|e| TransportError::Tls(format!("key generation failed: {e}")))?;
        let params = rcgen::CertificateParams::new(vec![name.to_string()])
            .map_err(|e| TransportError::Tls(format!("cert params failed: {e}")))?;
        let cert = params
            .self_signed(&key_pair)
            .map_err(|e| TransportError::Tls(format!("self-signed cert generation failed: {e}")))?;
        Ok(Self::from_der(cert.der().to_vec(), key_pair.serialize_der()))
    }

    pub fn cert_der(&self) -> &[u8] {
        &self.cert_der
    }

    pub fn key_der(&self) -> &[u8] {
        &self.key_der
    }

    /// The SubjectPublicKeyInfo peers pin for this identity.
    pub fn public_key(&self) -> Result<Vec<u8>, TransportError> {
        spki_of(&self.cert_der)
    }

    pub(crate) fn cert_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![CertificateDer::from(self.cert_der.clone())]
    }

    pub(crate) fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.to_vec()))
    }
}

/// Extract the DER SubjectPublicKeyInfo from a DER certificate.
pub fn spki_of(cert_der: &[u8]) -> Result<Vec<u8>, TransportError> {
    let (_, cert) = x509_parser::parse_x509_certificate(cert_der)
        .map_err(|e| TransportError::Tls(format!("certificate parse failed: {e}")))?;
    Ok(cert.public_key().raw.to_vec())
}

pub(crate) fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn pin_failure() -> rustls::Error {
    rustls::Error::InvalidCertificate(rustls::CertificateError::ApplicationVerificationFailure)
}

// ---------------------------------------------------------------------------
// Client side: verify the server we dialed
// ---------------------------------------------------------------------------

/// Accepts exactly one server key.
///
/// A mismatch is recorded in `mismatch` so the dialer can stop retrying.
#[derive(Debug)]
pub(crate) struct PinnedServerVerifier {
    expected: Vec<u8>,
    mismatch: Arc<AtomicBool>,
    provider: Arc<CryptoProvider>,
}

impl PinnedServerVerifier {
    pub(crate) fn new(expected: Vec<u8>, mismatch: Arc<AtomicBool>) -> Self {
        Self {
            expected,
            mismatch,
            provider: provider(),
        }
    }
}

impl ServerCertVerifier for PinnedServerVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        let spki = spki_of(end_entity.as_ref()).map_err(|_| pin_failure())?;
        if spki != self.expected {
            self.mismatch.store(true, Ordering::Relaxed);
            return Err(pin_failure());
        }
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
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

// ---------------------------------------------------------------------------
// Server side: verify whoever dialed us
// ---------------------------------------------------------------------------

/// Accepts any key in the committee's pinned set.
#[derive(Debug)]
pub(crate) struct PinnedClientVerifier {
    allowed: HashSet<Vec<u8>>,
    provider: Arc<CryptoProvider>,
}

impl PinnedClientVerifier {
    pub(crate) fn new(allowed: impl IntoIterator<Item = Vec<u8>>) -> Self {
        Self {
            allowed: allowed.into_iter().collect(),
            provider: provider(),
        }
    }
}

impl ClientCertVerifier for PinnedClientVerifier {
    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        let spki = spki_of(end_entity.as_ref()).map_err(|_| pin_failure())?;
        if !self.allowed.contains(&spki) {
            tracing::warn!("rejected client certificate with unpinned key");
            return Err(pin_failure());
        }
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
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
        rustls::crypto::verify_tls13_signature(
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
