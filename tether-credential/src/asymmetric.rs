//! RSA-OAEP encrypt/decrypt and RSA-SHA256 sign/verify (§4.3).

use crate::error::Error;
use rsa::pkcs1v15::{Signature, SigningKey, VerifyingKey};
use rsa::sha2::Sha256;
use rsa::signature::{RandomizedSigner, SignatureEncoding, Verifier};
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};

/// OAEP overhead for SHA-256: `2 * hash_len + 2` bytes (RFC 8017 §7.1.1).
const OAEP_SHA256_OVERHEAD: usize = 2 * 32 + 2;

/// Maximum plaintext length that fits a single RSA-OAEP-SHA256 operation
/// for a given modulus size in bytes.
pub fn max_plaintext_len(modulus_len_bytes: usize) -> usize {
    modulus_len_bytes.saturating_sub(OAEP_SHA256_OVERHEAD)
}

/// Encrypt `plaintext` with RSA-OAEP-SHA256 under `public_key`.
pub fn encrypt(public_key: &RsaPublicKey, plaintext: &[u8]) -> Result<Vec<u8>, Error> {
    let modulus_len = public_key.size();
    if plaintext.len() > max_plaintext_len(modulus_len) {
        return Err(Error::InvalidArgument(format!(
            "plaintext of {} bytes exceeds RSA-OAEP limit of {} bytes for a {}-byte modulus",
            plaintext.len(),
            max_plaintext_len(modulus_len),
            modulus_len
        )));
    }

    let mut rng = rand::thread_rng();
    public_key
        .encrypt(&mut rng, Oaep::new::<Sha256>(), plaintext)
        .map_err(|e| Error::CryptoFault(format!("RSA-OAEP encrypt failed: {e}")))
}

/// Decrypt `ciphertext` with RSA-OAEP-SHA256 under `private_key`.
pub fn decrypt(private_key: &RsaPrivateKey, ciphertext: &[u8]) -> Result<Vec<u8>, Error> {
    private_key
        .decrypt(Oaep::new::<Sha256>(), ciphertext)
        .map_err(|e| Error::CryptoFault(format!("RSA-OAEP decrypt failed: {e}")))
}

/// Sign `data` with RSA-PKCS#1v1.5-SHA256 under `private_key`.
pub fn sign(private_key: &RsaPrivateKey, data: &[u8]) -> Result<Vec<u8>, Error> {
    let signing_key = SigningKey::<Sha256>::new(private_key.clone());
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, data);
    Ok(signature.to_vec())
}

/// Verify `signature` over `data` under `public_key`. Never errors on a
/// mismatch; returns `false` instead, per the facade's `authentic: bool`
/// contract.
pub fn verify(public_key: &RsaPublicKey, signature: &[u8], data: &[u8]) -> bool {
    let Ok(signature) = Signature::try_from(signature) else {
        return false;
    };
    let verifying_key = VerifyingKey::<Sha256>::new(public_key.clone());
    verifying_key.verify(data, &signature).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rsa::traits::PublicKeyParts;

    fn test_keypair() -> (RsaPrivateKey, RsaPublicKey) {
        let mut rng = rand::thread_rng();
        let private = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let public = private.to_public_key();
        (private, public)
    }

    #[test]
    fn encrypt_decrypt_round_trip() {
        let (private, public) = test_keypair();
        let max_len = max_plaintext_len(public.size());
        let plaintext: Vec<u8> = (0..max_len).map(|i| (i % 251) as u8).collect();
        let ciphertext = encrypt(&public, &plaintext).unwrap();
        let decrypted = decrypt(&private, &ciphertext).unwrap();
        assert_eq!(decrypted, plaintext);
    }

    #[test]
    fn encrypt_rejects_oversized_input() {
        let (_, public) = test_keypair();
        let too_big = vec![0u8; public.size()];
        assert!(matches!(
            encrypt(&public, &too_big),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn sign_verify_round_trip() {
        let (private, public) = test_keypair();
        let data = b"hello world";
        let signature = sign(&private, data).unwrap();
        assert!(verify(&public, &signature, data));
        assert!(!verify(&public, &signature, b"hello world!"));
    }
}
