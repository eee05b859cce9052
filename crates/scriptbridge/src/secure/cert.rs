//! Ephemeral ECDSA P-256 certificates.
//!
//! Each side of the secure binding generates one per process. Nothing is
//! written to disk; the private key lives only in memory.

use std::fmt;

use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use sha2::{Digest, Sha256};

use super::SecureError;

/// Names the certificate is valid for. The worker only ever listens on
/// loopback.
const SUBJECT_ALT_NAMES: [&str; 2] = ["127.0.0.1", "localhost"];

pub struct EphemeralCert {
    cert_pem: String,
    key_pem: String,
}

impl EphemeralCert {
    /// Self-signed, usable for both server and client authentication.
    pub fn generate() -> Result<Self, SecureError> {
        let mut params = rcgen::CertificateParams::new(
            SUBJECT_ALT_NAMES.iter().map(|s| s.to_string()).collect::<Vec<_>>(),
        )?;
        params
            .distinguished_name
            .push(rcgen::DnType::CommonName, "scriptbridge ephemeral");
        params.extended_key_usages = vec![
            rcgen::ExtendedKeyUsagePurpose::ServerAuth,
            rcgen::ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key_pair = rcgen::KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)?;
        let cert = params.self_signed(&key_pair)?;

        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key_pair.serialize_pem(),
        })
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Hex SHA-256 of the PEM text, as carried in `X-Client-Cert-Hash`.
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.cert_pem)
    }

    /// Certificate followed by key, the form reqwest's `Identity` expects.
    pub fn identity_pem(&self) -> Vec<u8> {
        let mut pem = Vec::with_capacity(self.cert_pem.len() + self.key_pem.len() + 1);
        pem.extend_from_slice(self.cert_pem.as_bytes());
        if !self.cert_pem.ends_with('\n') {
            pem.push(b'\n');
        }
        pem.extend_from_slice(self.key_pem.as_bytes());
        pem
    }

    pub(crate) fn cert_der(&self) -> Result<CertificateDer<'static>, SecureError> {
        parse_cert(&self.cert_pem)
    }

    pub(crate) fn key_der(&self) -> Result<PrivateKeyDer<'static>, SecureError> {
        PrivateKeyDer::from_pem_slice(self.key_pem.as_bytes())
            .map_err(|e| SecureError::InvalidPem(format!("private key: {e}")))
    }
}

impl fmt::Debug for EphemeralCert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EphemeralCert")
            .field("fingerprint", &self.fingerprint())
            .field("key", &"<redacted>")
            .finish()
    }
}

pub fn fingerprint(pem: &str) -> String {
    hex::encode(Sha256::digest(pem.as_bytes()))
}

/// Parse the first certificate in a PEM document.
pub(crate) fn parse_cert(pem: &str) -> Result<CertificateDer<'static>, SecureError> {
    CertificateDer::pem_slice_iter(pem.as_bytes())
        .next()
        .ok_or_else(|| SecureError::InvalidPem("no certificate found".into()))?
        .map_err(|e| SecureError::InvalidPem(format!("certificate: {e}")))
}
