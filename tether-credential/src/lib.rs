//! Credential Engine: key material storage, RSA/AES primitives, an
//! X.509 certificate factory, and the synchronous/asynchronous facade
//! that `tether-session` drives during the handshake.

pub mod asymmetric;
pub mod base64;
pub mod certificate;
pub mod engine;
pub mod error;
pub mod key_material;
pub mod symmetric;
pub mod worker;

pub use engine::{ConfigureKind, CredentialEngine, KeyId};
pub use error::{Error, Result};
pub use key_material::KeyMaterial;
pub use worker::{AsyncEngine, Event, EventTag};

/// Extract the RSA public key from an arbitrary X.509 certificate PEM,
/// independent of any engine instance. Used by the handshake to seal a
/// `Credential` against a peer's certificate rather than its own.
pub fn certificate_public_key(certificate_pem: &str) -> Result<rsa::RsaPublicKey> {
    use rsa::pkcs1::DecodeRsaPublicKey;

    let (_, cert) = x509_parser::pem::parse_x509_pem(certificate_pem.as_bytes())
        .map_err(|e| Error::InvalidArgument(format!("invalid certificate PEM: {e}")))?;
    let parsed = cert
        .parse_x509()
        .map_err(|e| Error::InvalidArgument(format!("invalid X.509 certificate: {e}")))?;
    rsa::RsaPublicKey::from_pkcs1_der(parsed.public_key().raw)
        .or_else(|_| rsa::pkcs8::DecodePublicKey::from_public_key_der(parsed.public_key().raw))
        .map_err(|e| Error::CryptoFault(format!("certificate public key is not RSA: {e}")))
}
