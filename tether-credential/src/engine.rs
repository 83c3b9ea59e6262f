//! Credential Engine Facade (§4.6) — the synchronous operation table
//! that `tether-session`'s handshake and the CLI front matter drive.

use crate::certificate::{self, CertificateRequest, Issuer};
use crate::error::Error;
use crate::key_material::KeyMaterial;
use crate::{asymmetric, symmetric};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey};
use rsa::pkcs8::DecodePrivateKey;
use rsa::RsaPrivateKey;
use serde::Deserialize;

/// The KeyMaterial namespace operations address by id.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyId {
    PrivateKey,
    PublicKey,
    SecretKey,
}

impl KeyId {
    /// `CERTIFICATE` is an alias of `PUBLIC_KEY` in the facade's id space.
    pub const CERTIFICATE: KeyId = KeyId::PublicKey;
}

/// The blob kind passed to `configure`.
pub enum ConfigureKind<'a> {
    /// A raw PEM blob: a private key or a certificate, auto-detected by
    /// its PEM header.
    SslPem(&'a str),
    /// The full JSON configuration object (§4.6's schema).
    Json(&'a [u8]),
    /// Raw (not base64) symmetric key bytes.
    SecretKey(&'a [u8]),
    /// A CA keypair + certificate this engine signs subordinate
    /// certificates with during `prepare`.
    BindAuthenticator { private_key_pem: &'a str, certificate_pem: &'a str },
}

#[derive(Debug, PartialEq, Eq)]
enum State {
    Idle,
    Active,
}

#[derive(Deserialize, Default)]
struct SslSection {
    passphrase: Option<String>,
    private_key: Option<String>,
    certificate: Option<String>,
    alternative_name: Option<String>,
    bits: Option<usize>,
    serial: Option<i64>,
    days: Option<i64>,
    is_ca: Option<i32>,
    enable_base64: Option<bool>,
}

#[derive(Deserialize, Default)]
struct SecretKeySection {
    key: Option<String>,
    key_bits: Option<usize>,
}

#[derive(Deserialize, Default)]
struct JsonConfig {
    ssl: Option<SslSection>,
    secret_key: Option<SecretKeySection>,
}

struct FactoryParams {
    bits: usize,
    serial: i64,
    days: i64,
    is_ca: i32,
    alternative_name: Option<String>,
    enable_base64: bool,
}

impl Default for FactoryParams {
    fn default() -> Self {
        Self {
            bits: 0,
            serial: 0,
            days: 0,
            is_ca: -1,
            alternative_name: None,
            // §4.5: "if enableBase64 < 0 default to true." FactoryParams
            // has no tri-state for this field, so the default is the
            // resolved `true` directly; `configure_json` overwrites it
            // only when the JSON explicitly sets `enable_base64`.
            enable_base64: true,
        }
    }
}

struct Authenticator {
    private_key: RsaPrivateKey,
    certificate_pem: String,
}

/// The Credential Engine. Owns key material, factory defaults gathered
/// from `configure`, and an optional issuer used to sign subordinate
/// certificates.
pub struct CredentialEngine {
    state: State,
    key_material: KeyMaterial,
    factory_params: FactoryParams,
    authenticator: Option<Authenticator>,
    pending_result: Option<Vec<u8>>,
}

impl Default for CredentialEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl CredentialEngine {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            key_material: KeyMaterial::new(),
            factory_params: FactoryParams::default(),
            authenticator: None,
            pending_result: None,
        }
    }

    /// Direct access for collaborators (e.g. the handshake) that need the
    /// raw key material rather than the facade's id-addressed surface.
    pub fn key_material(&self) -> &KeyMaterial {
        &self.key_material
    }

    /// Mutable variant of [`Self::key_material`], for collaborators that
    /// lazily generate material (e.g. the handshake drawing a session key
    /// on first use) outside the `encrypt`/`decrypt`/`prepare` surface.
    pub fn key_material_mut(&mut self) -> &mut KeyMaterial {
        &mut self.key_material
    }

    fn require_active(&self) -> Result<(), Error> {
        if self.state != State::Active {
            return Err(Error::SequenceError(
                "operation requires the engine to be activated first".to_string(),
            ));
        }
        Ok(())
    }

    /// Load configuration material. Always permitted, even before
    /// `activate`.
    pub fn configure(&mut self, kind: ConfigureKind<'_>) -> Result<(), Error> {
        match kind {
            ConfigureKind::SslPem(pem) => self.configure_pem(pem),
            ConfigureKind::Json(blob) => self.configure_json(blob),
            ConfigureKind::SecretKey(bytes) => {
                self.key_material.set_symmetric_key(bytes, bytes.len() * 8)
            }
            ConfigureKind::BindAuthenticator {
                private_key_pem,
                certificate_pem,
            } => self.configure_authenticator(private_key_pem, certificate_pem),
        }
    }

    fn configure_pem(&mut self, pem: &str) -> Result<(), Error> {
        if pem.contains("BEGIN CERTIFICATE") {
            self.key_material.set_certificate(pem)
        } else {
            self.key_material.set_private_key(pem)
        }
    }

    fn configure_authenticator(&mut self, private_key_pem: &str, certificate_pem: &str) -> Result<(), Error> {
        let private_key = RsaPrivateKey::from_pkcs1_pem(private_key_pem)
            .or_else(|_| RsaPrivateKey::from_pkcs8_pem(private_key_pem))
            .map_err(|e| Error::InvalidArgument(format!("invalid authenticator private key: {e}")))?;
        self.authenticator = Some(Authenticator {
            private_key,
            certificate_pem: certificate_pem.to_string(),
        });
        Ok(())
    }

    fn configure_json(&mut self, blob: &[u8]) -> Result<(), Error> {
        let config: JsonConfig = serde_json::from_slice(blob)
            .map_err(|e| Error::InvalidArgument(format!("invalid JSON configuration: {e}")))?;

        if let Some(ssl) = config.ssl {
            if let Some(passphrase) = &ssl.passphrase {
                if !passphrase.is_empty() && ssl.private_key.is_some() {
                    return Err(Error::UnsupportedOperation(
                        "passphrase-protected private keys are not supported".to_string(),
                    ));
                }
            }
            if let Some(pem) = &ssl.private_key {
                self.key_material.set_private_key(pem)?;
            }
            if let Some(pem) = &ssl.certificate {
                self.key_material.set_certificate(pem)?;
            }
            if let Some(name) = ssl.alternative_name {
                self.factory_params.alternative_name = Some(name);
            }
            if let Some(bits) = ssl.bits {
                self.factory_params.bits = bits;
            }
            if let Some(serial) = ssl.serial {
                self.factory_params.serial = serial;
            }
            if let Some(days) = ssl.days {
                self.factory_params.days = days;
            }
            if let Some(is_ca) = ssl.is_ca {
                self.factory_params.is_ca = is_ca;
            }
            if let Some(enable_base64) = ssl.enable_base64 {
                self.factory_params.enable_base64 = enable_base64;
            }
        }

        if let Some(secret_key) = config.secret_key {
            if let Some(key) = secret_key.key {
                let bytes = crate::base64::decode(&key)
                    .map_err(|_| Error::InvalidArgument("secret_key.key is not valid base64".to_string()))?;
                let bits = secret_key.key_bits.unwrap_or(bytes.len() * 8);
                self.key_material.set_symmetric_key(&bytes, bits)?;
            }
        }

        Ok(())
    }

    /// `Idle|Configured` → `Active`. Errors if already active.
    pub fn activate(&mut self) -> Result<(), Error> {
        if self.state == State::Active {
            return Err(Error::AlreadyExists);
        }
        self.state = State::Active;
        log::info!("credential engine activated");
        Ok(())
    }

    /// Generates keypair, certificate, and secret key in sequence,
    /// skipping any step already satisfied by a prior `configure`. Fails
    /// only if a step that must run does.
    pub fn prepare(&mut self) -> Result<(), Error> {
        self.require_active()?;

        if !self.key_material.has_private_key() {
            log::debug!("generating {}-bit RSA keypair", self.factory_params.bits);
            self.key_material.generate_keypair(self.factory_params.bits)?;
        }

        if !self.key_material.has_certificate() {
            let (serial, days, is_ca) = CertificateRequest::normalized(
                self.factory_params.serial,
                self.factory_params.days,
                self.factory_params.is_ca,
            );
            let request = CertificateRequest {
                serial,
                days,
                is_ca,
                alternative_name: self.factory_params.alternative_name.clone(),
                subject_cn: None,
            };
            let subject_key = self.key_material.private_key()?.clone();
            let pem = match &self.authenticator {
                Some(authenticator) => certificate::issued_by(
                    &subject_key,
                    &request,
                    Issuer {
                        private_key: &authenticator.private_key,
                        certificate_pem: &authenticator.certificate_pem,
                    },
                )?,
                None => certificate::self_signed(&subject_key, &request)?,
            };
            self.key_material.set_certificate(&pem)?;
        }

        if !self.key_material.has_symmetric_key() {
            self.key_material.generate_symmetric_key(0)?;
        }

        Ok(())
    }

    /// Encrypt `data` under the key named by `id`, storing the result for
    /// a later `get_result`.
    pub fn encrypt(&mut self, id: KeyId, data: &[u8], iv: Option<&[u8]>) -> Result<(), Error> {
        self.require_active()?;
        let result = match id {
            KeyId::PrivateKey => {
                return Err(Error::InvalidArgument(
                    "encrypt is not defined for PRIVATE_KEY".to_string(),
                ))
            }
            KeyId::PublicKey => {
                let public_key = self.public_key_for_crypto()?;
                let ciphertext = asymmetric::encrypt(&public_key, data)?;
                if self.factory_params.enable_base64 {
                    crate::base64::encode(&ciphertext).into_bytes()
                } else {
                    ciphertext
                }
            }
            KeyId::SecretKey => {
                let iv = iv.ok_or_else(|| {
                    Error::InvalidArgument("encrypt with SECRET_KEY requires an IV".to_string())
                })?;
                let key = self.key_material.get_symmetric_key(false)?;
                symmetric::encrypt(&key, iv, data)?
            }
        };
        self.pending_result = Some(result);
        Ok(())
    }

    /// Decrypt `data` under the key named by `id`, storing the result for
    /// a later `get_result`.
    pub fn decrypt(&mut self, id: KeyId, data: &[u8], iv: Option<&[u8]>) -> Result<(), Error> {
        self.require_active()?;
        let result = match id {
            KeyId::PublicKey => {
                return Err(Error::InvalidArgument(
                    "decrypt is not defined for PUBLIC_KEY".to_string(),
                ))
            }
            KeyId::PrivateKey => {
                let private_key = self.key_material.private_key()?;
                let ciphertext = if self.factory_params.enable_base64 {
                    crate::base64::decode(
                        std::str::from_utf8(data).map_err(|e| {
                            Error::InvalidArgument(format!("base64 ciphertext is not UTF-8: {e}"))
                        })?,
                    )?
                } else {
                    data.to_vec()
                };
                asymmetric::decrypt(private_key, &ciphertext)?
            }
            KeyId::SecretKey => {
                let iv = iv.ok_or_else(|| {
                    Error::InvalidArgument("decrypt with SECRET_KEY requires an IV".to_string())
                })?;
                let key = self.key_material.get_symmetric_key(false)?;
                symmetric::decrypt(&key, iv, data)?
            }
        };
        self.pending_result = Some(result);
        Ok(())
    }

    /// The result of the last `encrypt`/`decrypt` call.
    pub fn get_result(&self) -> Result<&[u8], Error> {
        self.pending_result
            .as_deref()
            .ok_or_else(|| Error::NotReady("no pending crypto result".to_string()))
    }

    /// Fetch key material by id, base64-wrapped when `enable_base64` was
    /// set for SECRET_KEY.
    pub fn get_key(&self, id: KeyId) -> Result<Vec<u8>, Error> {
        match id {
            KeyId::PrivateKey => self.key_material.get_private_key(),
            KeyId::PublicKey => {
                if self.key_material.has_certificate() {
                    self.key_material.get_certificate()
                } else {
                    self.key_material.get_public_key()
                }
            }
            KeyId::SecretKey => self
                .key_material
                .get_symmetric_key(self.factory_params.enable_base64),
        }
    }

    /// Sign `data` with the loaded private key.
    pub fn sign(&self, data: &[u8]) -> Result<Vec<u8>, Error> {
        self.require_active()?;
        let private_key = self.key_material.private_key()?;
        asymmetric::sign(private_key, data)
    }

    /// Verify `signature` over `data`. Never errors on mismatch.
    pub fn verify(&self, signature: &[u8], data: &[u8]) -> Result<bool, Error> {
        self.require_active()?;
        let public_key = self.public_key_for_crypto()?;
        let ok = asymmetric::verify(&public_key, signature, data);
        if !ok {
            log::warn!("signature verification failed");
        }
        Ok(ok)
    }

    fn public_key_for_crypto(&self) -> Result<rsa::RsaPublicKey, Error> {
        if self.key_material.has_certificate() {
            self.key_material.public_key_from_certificate()
        } else {
            let private_key = self.key_material.private_key()?;
            Ok(private_key.to_public_key())
        }
    }

    /// `Active` → `Idle`, releasing no persistent resources (key material
    /// stays loaded so a subsequent `activate` can resume).
    pub fn deactivate(&mut self) -> Result<(), Error> {
        self.require_active()?;
        self.state = State::Idle;
        self.pending_result = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn operations_before_activate_return_sequence_error() {
        let mut engine = CredentialEngine::new();
        assert!(matches!(engine.prepare(), Err(Error::SequenceError(_))));
        assert!(matches!(
            engine.encrypt(KeyId::SecretKey, b"x", Some(&[0u8; 16])),
            Err(Error::SequenceError(_))
        ));
    }

    #[test]
    fn activate_twice_is_rejected() {
        let mut engine = CredentialEngine::new();
        engine.activate().unwrap();
        assert!(matches!(engine.activate(), Err(Error::AlreadyExists)));
    }

    #[test]
    fn prepare_generates_all_three_materials() {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();
        assert!(engine.get_key(KeyId::PrivateKey).is_ok());
        assert!(engine.get_key(KeyId::PublicKey).is_ok());
        assert!(engine.get_key(KeyId::SecretKey).is_ok());
    }

    #[test]
    fn encrypt_rejects_private_key_and_missing_iv() {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();

        assert!(matches!(
            engine.encrypt(KeyId::PrivateKey, b"x", None),
            Err(Error::InvalidArgument(_))
        ));
        assert!(matches!(
            engine.encrypt(KeyId::SecretKey, b"x", None),
            Err(Error::InvalidArgument(_))
        ));
    }

    #[test]
    fn encrypt_decrypt_round_trip_base64_enabled_by_default() {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();

        engine.encrypt(KeyId::PublicKey, b"hello world\0", None).unwrap();
        let ciphertext = engine.get_result().unwrap().to_vec();
        assert!(ciphertext.len() > 256);
        assert!(ciphertext.iter().all(|&b| b.is_ascii_graphic() || b == b'='));

        engine.decrypt(KeyId::PrivateKey, &ciphertext, None).unwrap();
        assert_eq!(engine.get_result().unwrap(), b"hello world\0");
    }

    #[test]
    fn encrypt_decrypt_round_trip_base64_disabled() {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048,"enable_base64":false}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();

        engine.encrypt(KeyId::PublicKey, b"hello world\0", None).unwrap();
        let ciphertext = engine.get_result().unwrap().to_vec();
        assert_eq!(ciphertext.len(), 256); // raw RSA output for a 2048-bit modulus

        engine.decrypt(KeyId::PrivateKey, &ciphertext, None).unwrap();
        assert_eq!(engine.get_result().unwrap(), b"hello world\0");
    }

    #[test]
    fn sign_and_verify_round_trip() {
        let mut engine = CredentialEngine::new();
        engine
            .configure(ConfigureKind::Json(br#"{"ssl":{"bits":2048}}"#))
            .unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();

        let signature = engine.sign(b"payload").unwrap();
        assert!(engine.verify(&signature, b"payload").unwrap());
        assert!(!engine.verify(&signature, b"tampered").unwrap());
    }

    #[test]
    fn prepare_skips_already_configured_private_key() {
        let mut engine = CredentialEngine::new();
        let mut rng = rand::thread_rng();
        let key = RsaPrivateKey::new(&mut rng, 2048).unwrap();
        let pem = key.to_pkcs1_pem(rsa::pkcs8::LineEnding::LF).unwrap();
        engine.configure(ConfigureKind::SslPem(&pem)).unwrap();
        engine.activate().unwrap();
        engine.prepare().unwrap();

        let stored = engine.get_key(KeyId::PrivateKey).unwrap();
        assert_eq!(stored, pem.as_bytes());
    }
}
