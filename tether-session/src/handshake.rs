//! Handshake Protocol (§4.7) — the client-side `Credential` sealing and
//! the server-side decrypt/validate/allocate sequence that bootstraps a
//! `SessionContext`.

use crate::error::{Error, Result};
use rand::RngCore;
use tether_credential::CredentialEngine;

/// Fixed width of the uuid field (36 ASCII characters + NUL terminator).
pub const UUID_FIELD_LEN: usize = 37;

/// The literal payload sent when neither side has an authenticator
/// configured ("insecured-but-encrypted" is not even attempted).
pub const INSECURE_PAYLOAD: &[u8] = b"insecure";

/// `{nonce, session_key_length, uuid, payload}` as defined in §3.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub nonce: u64,
    pub uuid: String,
    pub session_key: Vec<u8>,
}

impl Credential {
    /// Serialise to the fixed-layout wire form: 8-byte LE nonce, 4-byte
    /// LE signed session-key length, 37-byte uuid field, then the raw
    /// session key bytes.
    pub fn encode(&self) -> Result<Vec<u8>> {
        if self.uuid.len() >= UUID_FIELD_LEN {
            return Err(Error::InvalidArgument(format!(
                "uuid of {} bytes does not fit the {}-byte field",
                self.uuid.len(),
                UUID_FIELD_LEN
            )));
        }
        let mut out = Vec::with_capacity(8 + 4 + UUID_FIELD_LEN + self.session_key.len());
        out.extend_from_slice(&self.nonce.to_le_bytes());
        out.extend_from_slice(&(self.session_key.len() as i32).to_le_bytes());
        let mut uuid_field = vec![0u8; UUID_FIELD_LEN];
        uuid_field[..self.uuid.len()].copy_from_slice(self.uuid.as_bytes());
        out.extend_from_slice(&uuid_field);
        out.extend_from_slice(&self.session_key);
        Ok(out)
    }

    /// Parse the fixed-layout wire form produced by [`Credential::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let header_len = 8 + 4 + UUID_FIELD_LEN;
        if bytes.len() < header_len {
            return Err(Error::InvalidArgument(
                "credential blob is shorter than the fixed header".to_string(),
            ));
        }
        let nonce = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let session_key_length = i32::from_le_bytes(bytes[8..12].try_into().unwrap());
        if session_key_length < 0 {
            return Err(Error::InvalidArgument(
                "negative session_key_length in credential blob".to_string(),
            ));
        }
        let session_key_length = session_key_length as usize;
        let uuid_field = &bytes[12..12 + UUID_FIELD_LEN];
        let uuid_end = uuid_field.iter().position(|&b| b == 0).unwrap_or(uuid_field.len());
        let uuid = String::from_utf8(uuid_field[..uuid_end].to_vec())
            .map_err(|e| Error::InvalidArgument(format!("uuid field is not valid UTF-8: {e}")))?;
        let payload = &bytes[header_len..];
        if payload.len() < session_key_length {
            return Err(Error::InvalidArgument(
                "credential blob payload is shorter than the declared session key length".to_string(),
            ));
        }
        Ok(Self {
            nonce,
            uuid,
            session_key: payload[..session_key_length].to_vec(),
        })
    }
}

/// Draw a fresh 64-bit random nonce from the platform CSPRNG.
pub fn draw_nonce() -> u64 {
    rand::thread_rng().next_u64()
}

/// Client-side `ExchangeKey` (§4.7, steps 1-5).
///
/// `engine` is the device's own Credential Engine (used to obtain/
/// generate the session key and, in insecure-but-encrypted mode, its own
/// public certificate). `server_public_cert_pem` is the CA certificate
/// configured as `CA_AUTHENTICATOR`, if any; when `None` the device
/// falls back to its own certificate, and when `engine` has no
/// certificate at all the literal `"insecure"` is sent.
pub fn client_seal(
    engine: &mut CredentialEngine,
    uuid: &str,
    server_public_cert_pem: Option<&str>,
) -> Result<(u64, Vec<u8>)> {
    let nonce = draw_nonce();

    if !engine.key_material().has_symmetric_key() {
        engine.key_material_mut().generate_symmetric_key(0)?;
    }
    let session_key = engine.key_material().get_symmetric_key(false)?;

    let credential = Credential {
        nonce,
        uuid: uuid.to_string(),
        session_key,
    };
    let plaintext = credential.encode()?;

    let sealing_cert_pem = match server_public_cert_pem {
        Some(pem) => Some(pem.to_string()),
        None => {
            if engine.key_material().has_certificate() {
                Some(String::from_utf8(engine.key_material().get_certificate()?)
                    .map_err(|e| Error::InvalidArgument(format!("certificate PEM is not UTF-8: {e}")))?)
            } else {
                None
            }
        }
    };

    let Some(cert_pem) = sealing_cert_pem else {
        return Ok((nonce, INSECURE_PAYLOAD.to_vec()));
    };

    let public_key = tether_credential::certificate_public_key(&cert_pem)?;
    let ciphertext = tether_credential::asymmetric::encrypt(&public_key, &plaintext)?;
    Ok((nonce, ciphertext))
}

/// Outcome of a server-side `ExchangeKey` decrypt/validate pass.
pub struct ServerExchange {
    pub nonce: u64,
    pub session_key: Vec<u8>,
}

/// Server-side `ExchangeKey` (§4.7, steps 1-2). `engine` is `None` when
/// the edge has no authenticator configured, in which case any payload
/// (including the literal `"insecure"`) is accepted without decryption.
pub fn server_unseal(
    engine: Option<&CredentialEngine>,
    payload: &[u8],
    expected_uuid: &str,
) -> Result<ServerExchange> {
    let plaintext = match engine {
        None => payload.to_vec(),
        Some(engine) => {
            if payload == INSECURE_PAYLOAD {
                payload.to_vec()
            } else {
                let private_key = engine.key_material().private_key()?;
                tether_credential::asymmetric::decrypt(private_key, payload)?
            }
        }
    };

    if plaintext == INSECURE_PAYLOAD {
        return Err(Error::AuthFault(
            "peer sent the insecure literal but this edge requires a sealed credential".to_string(),
        ));
    }

    let credential = Credential::decode(&plaintext)?;
    if credential.uuid != expected_uuid {
        return Err(Error::AuthFault(format!(
            "uuid mismatch: expected {expected_uuid}, got {}",
            credential.uuid
        )));
    }

    Ok(ServerExchange {
        nonce: credential.nonce,
        session_key: credential.session_key,
    })
}

/// Allocates monotonically increasing decimal `peer_id` strings.
#[derive(Default)]
pub struct PeerIdAllocator {
    next: u64,
}

impl PeerIdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    /// Issue the next peer id as a decimal string, per §4.7 step 3.
    pub fn allocate(&mut self) -> String {
        let id = self.next;
        self.next = self.next.saturating_add(1);
        id.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credential_round_trips() {
        let credential = Credential {
            nonce: 42,
            uuid: "11111111-2222-3333-4444-555555555555".to_string(),
            session_key: vec![7u8; 32],
        };
        let encoded = credential.encode().unwrap();
        let decoded = Credential::decode(&encoded).unwrap();
        assert_eq!(credential, decoded);
    }

    #[test]
    fn oversized_uuid_is_rejected() {
        let credential = Credential {
            nonce: 0,
            uuid: "x".repeat(40),
            session_key: vec![],
        };
        assert!(credential.encode().is_err());
    }

    #[test]
    fn peer_id_allocator_is_monotonic_and_distinct() {
        let mut allocator = PeerIdAllocator::new();
        let a = allocator.allocate();
        let b = allocator.allocate();
        assert_ne!(a, b);
        assert_eq!(a, "1");
        assert_eq!(b, "2");
    }

    #[test]
    fn server_unseal_rejects_uuid_mismatch_in_insecure_mode() {
        let credential = Credential {
            nonce: 5,
            uuid: "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa".to_string(),
            session_key: vec![1, 2, 3],
        };
        let payload = credential.encode().unwrap();
        let result = server_unseal(None, &payload, "bbbbbbbb-bbbb-bbbb-bbbb-bbbbbbbbbbbb");
        assert!(matches!(result, Err(Error::AuthFault(_))));
    }

    #[test]
    fn server_unseal_accepts_matching_uuid_in_insecure_mode() {
        let credential = Credential {
            nonce: 5,
            uuid: "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa".to_string(),
            session_key: vec![1, 2, 3],
        };
        let payload = credential.encode().unwrap();
        let result = server_unseal(None, &payload, "aaaaaaaa-aaaa-aaaa-aaaa-aaaaaaaaaaaa").unwrap();
        assert_eq!(result.nonce, 5);
        assert_eq!(result.session_key, vec![1, 2, 3]);
    }
}
