//! Key Material Store (§4.2) — one RSA keypair, one X.509 certificate,
//! one symmetric key, lifecycle uninitialised → loaded → active.

use crate::error::Error;
use rand::RngCore;
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, EncodeRsaPublicKey};
use rsa::pkcs8::{DecodePrivateKey, LineEnding};
use rsa::{RsaPrivateKey, RsaPublicKey};
use zeroize::Zeroizing;

/// Default RSA modulus size when the caller doesn't specify one.
pub const DEFAULT_RSA_BITS: usize = 4096;
/// Default RSA public exponent (65537).
pub const DEFAULT_RSA_EXPONENT: u64 = 65537;
/// Default symmetric key length in bytes (256 bits).
pub const DEFAULT_SYMMETRIC_KEY_BYTES: usize = 32;

/// Owns the engine's cryptographic material. Getters on an unset field
/// return `Error::NotReady`.
#[derive(Default)]
pub struct KeyMaterial {
    private_key: Option<RsaPrivateKey>,
    certificate_pem: Option<String>,
    symmetric_key: Option<Zeroizing<Vec<u8>>>,
}

impl KeyMaterial {
    /// Create an empty, uninitialised store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the private key, parsed from a PEM blob (PKCS#1 or PKCS#8).
    pub fn set_private_key(&mut self, pem: &str) -> Result<(), Error> {
        let key = RsaPrivateKey::from_pkcs1_pem(pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(pem))
            .map_err(|e| Error::InvalidArgument(format!("invalid private key PEM: {e}")))?;
        self.private_key = Some(key);
        Ok(())
    }

    /// Install a keypair generated elsewhere (e.g. the Certificate Factory).
    pub fn set_private_key_value(&mut self, key: RsaPrivateKey) {
        self.private_key = Some(key);
    }

    /// Replace the certificate, stored verbatim as PEM. When a private key
    /// is already loaded, the certificate's public key must match it.
    pub fn set_certificate(&mut self, pem: &str) -> Result<(), Error> {
        let (_, cert) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("invalid certificate PEM: {e}")))?;
        let parsed = cert
            .parse_x509()
            .map_err(|e| Error::InvalidArgument(format!("invalid X.509 certificate: {e}")))?;

        if let Some(private_key) = &self.private_key {
            let cert_spki = parsed.public_key().raw;
            let expected = private_key
                .to_public_key()
                .to_pkcs1_der()
                .map_err(|e| Error::CryptoFault(format!("re-encoding public key failed: {e}")))?;
            // x509-parser exposes the raw SubjectPublicKeyInfo bitstring,
            // which for RSA keys is the PKCS#1 DER encoding.
            if cert_spki != expected.as_bytes() {
                return Err(Error::InvalidArgument(
                    "certificate public key does not match the loaded private key".to_string(),
                ));
            }
        }

        self.certificate_pem = Some(pem.to_string());
        Ok(())
    }

    /// Replace the symmetric key. `bits` must be a multiple of 8 and match
    /// `bytes.len() * 8`.
    pub fn set_symmetric_key(&mut self, bytes: &[u8], bits: usize) -> Result<(), Error> {
        if bits % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "symmetric key bit length {bits} is not a multiple of 8"
            )));
        }
        if bytes.len() * 8 != bits {
            return Err(Error::InvalidArgument(format!(
                "symmetric key of {} bytes does not match declared length of {} bits",
                bytes.len(),
                bits
            )));
        }
        self.symmetric_key = Some(Zeroizing::new(bytes.to_vec()));
        Ok(())
    }

    /// Private key as a PKCS#1 PEM blob.
    pub fn get_private_key(&self) -> Result<Vec<u8>, Error> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::NotReady("private key not set".to_string()))?;
        let pem = key
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::CryptoFault(format!("encoding private key failed: {e}")))?;
        Ok(pem.as_bytes().to_vec())
    }

    /// RSA public key (derived from the private key) as a PKCS#1 PEM blob.
    pub fn get_public_key(&self) -> Result<Vec<u8>, Error> {
        let key = self
            .private_key
            .as_ref()
            .ok_or_else(|| Error::NotReady("private key not set".to_string()))?;
        let pem = key
            .to_public_key()
            .to_pkcs1_pem(LineEnding::LF)
            .map_err(|e| Error::CryptoFault(format!("encoding public key failed: {e}")))?;
        Ok(pem.into_bytes())
    }

    /// The stored X.509 certificate as PEM bytes.
    pub fn get_certificate(&self) -> Result<Vec<u8>, Error> {
        self.certificate_pem
            .as_ref()
            .map(|s| s.as_bytes().to_vec())
            .ok_or_else(|| Error::NotReady("certificate not set".to_string()))
    }

    /// The raw symmetric key bytes, optionally base64-wrapped.
    pub fn get_symmetric_key(&self, base64_wrap: bool) -> Result<Vec<u8>, Error> {
        let key = self
            .symmetric_key
            .as_ref()
            .ok_or_else(|| Error::NotReady("symmetric key not set".to_string()))?;
        if base64_wrap {
            Ok(crate::base64::encode(key).into_bytes())
        } else {
            Ok(key.to_vec())
        }
    }

    /// The RSA public key extracted from the certificate, if one is loaded,
    /// else from the private key.
    pub fn public_key_from_certificate(&self) -> Result<RsaPublicKey, Error> {
        let pem = self
            .certificate_pem
            .as_ref()
            .ok_or_else(|| Error::NotReady("certificate not set".to_string()))?;
        let (_, cert) = x509_parser::pem::parse_x509_pem(pem.as_bytes())
            .map_err(|e| Error::InvalidArgument(format!("invalid certificate PEM: {e}")))?;
        let parsed = cert
            .parse_x509()
            .map_err(|e| Error::InvalidArgument(format!("invalid X.509 certificate: {e}")))?;
        RsaPublicKey::from_pkcs1_der(parsed.public_key().raw)
            .or_else(|_| {
                rsa::pkcs8::DecodePublicKey::from_public_key_der(parsed.public_key().raw)
            })
            .map_err(|e| Error::CryptoFault(format!("certificate public key is not RSA: {e}")))
    }

    /// The loaded private key, if any.
    pub fn private_key(&self) -> Result<&RsaPrivateKey, Error> {
        self.private_key
            .as_ref()
            .ok_or_else(|| Error::NotReady("private key not set".to_string()))
    }

    /// Whether a private key has been loaded or generated.
    pub fn has_private_key(&self) -> bool {
        self.private_key.is_some()
    }

    /// Whether a certificate has been loaded.
    pub fn has_certificate(&self) -> bool {
        self.certificate_pem.is_some()
    }

    /// Whether a symmetric key has been loaded or generated.
    pub fn has_symmetric_key(&self) -> bool {
        self.symmetric_key.is_some()
    }

    /// Generate a fresh RSA keypair via the platform CSPRNG, replacing any
    /// existing key.
    pub fn generate_keypair(&mut self, bits: usize) -> Result<(), Error> {
        let bits = if bits == 0 { DEFAULT_RSA_BITS } else { bits };
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, bits)
            .map_err(|e| Error::CryptoFault(format!("RSA key generation failed: {e}")))?;
        self.private_key = Some(key);
        Ok(())
    }

    /// Generate a fresh symmetric key via the platform CSPRNG, replacing
    /// any existing key.
    pub fn generate_symmetric_key(&mut self, bits: usize) -> Result<(), Error> {
        let bits = if bits == 0 {
            DEFAULT_SYMMETRIC_KEY_BYTES * 8
        } else {
            bits
        };
        if bits % 8 != 0 {
            return Err(Error::InvalidArgument(format!(
                "symmetric key bit length {bits} is not a multiple of 8"
            )));
        }
        let mut bytes = vec![0u8; bits / 8];
        rand::thread_rng().fill_bytes(&mut bytes);
        self.symmetric_key = Some(Zeroizing::new(bytes));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn getters_on_unset_fields_return_not_ready() {
        let km = KeyMaterial::new();
        assert!(matches!(km.get_private_key(), Err(Error::NotReady(_))));
        assert!(matches!(km.get_certificate(), Err(Error::NotReady(_))));
        assert!(matches!(
            km.get_symmetric_key(false),
            Err(Error::NotReady(_))
        ));
    }

    #[test]
    fn generate_keypair_then_get_public_key() {
        let mut km = KeyMaterial::new();
        km.generate_keypair(2048).unwrap();
        let pem = km.get_public_key().unwrap();
        assert!(String::from_utf8(pem).unwrap().contains("PUBLIC KEY"));
    }

    #[test]
    fn symmetric_key_length_mismatch_is_rejected() {
        let mut km = KeyMaterial::new();
        assert!(km.set_symmetric_key(&[0u8; 16], 256).is_err());
        assert!(km.set_symmetric_key(&[0u8; 32], 256).is_ok());
    }

    #[test]
    fn symmetric_key_base64_wrapping() {
        let mut km = KeyMaterial::new();
        km.generate_symmetric_key(256).unwrap();
        let raw = km.get_symmetric_key(false).unwrap();
        assert_eq!(raw.len(), 32);
        let wrapped = km.get_symmetric_key(true).unwrap();
        let decoded = crate::base64::decode(&String::from_utf8(wrapped).unwrap()).unwrap();
        assert_eq!(decoded, raw);
    }
}
