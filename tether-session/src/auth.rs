//! Request Authenticator (§4.8) — per-RPC `{method_name, nonce, id}`
//! gRPC metadata, validated against the session map on the server and
//! advanced in lockstep on both sides.

use crate::error::{Error, Result};
use std::collections::HashMap;
use std::sync::Mutex;
use tonic::metadata::MetadataMap;
use tonic::Request;

const METADATA_METHOD_NAME: &str = "method_name";
const METADATA_NONCE: &str = "nonce";
const METADATA_ID: &str = "id";

/// Attach `{method_name, nonce, id}` metadata to an outgoing request, as
/// the client side of every RPC except `ExchangeKey`.
pub fn attach<T>(mut request: Request<T>, method_name: &str, peer_id: &str, nonce: u64) -> Request<T> {
    let metadata = request.metadata_mut();
    // ASCII-only identifiers; `parse().unwrap()` cannot fail for decimal
    // digits and the method names this crate generates.
    metadata.insert(METADATA_METHOD_NAME, method_name.parse().unwrap());
    metadata.insert(METADATA_ID, peer_id.parse().unwrap());
    metadata.insert(METADATA_NONCE, nonce.to_string().parse().unwrap());
    request
}

fn read_str<'a>(metadata: &'a MetadataMap, key: &str) -> Result<&'a str> {
    metadata
        .get(key)
        .ok_or_else(|| Error::AuthFault(format!("missing `{key}` metadata")))?
        .to_str()
        .map_err(|_| Error::AuthFault(format!("`{key}` metadata is not ASCII")))
}

/// One session's authenticated nonce state, keyed by `peer_id` on the
/// server (§3 `SessionContext.nonce`).
#[derive(Default)]
pub struct NonceTracker {
    current: Mutex<HashMap<String, u64>>,
}

impl NonceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the tracker for a freshly exchanged session (the nonce the
    /// client chose during `ExchangeKey`).
    pub fn register(&self, peer_id: &str, initial_nonce: u64) {
        self.current
            .lock()
            .unwrap()
            .insert(peer_id.to_string(), initial_nonce);
    }

    /// Drop a session's tracked nonce (on `Stop` or disconnect).
    pub fn forget(&self, peer_id: &str) {
        self.current.lock().unwrap().remove(peer_id);
    }

    /// Validate an incoming request's metadata against this tracker:
    /// `method_name` must be present, `id` must resolve to a known
    /// session, and `nonce` must equal `current + 1` exactly (no replay
    /// window). On success the tracked nonce is advanced by one.
    pub fn validate_and_advance<T>(&self, request: &Request<T>) -> Result<String> {
        let metadata = request.metadata();
        let _method_name = read_str(metadata, METADATA_METHOD_NAME)?;
        let peer_id = read_str(metadata, METADATA_ID)?.to_string();
        let nonce: u64 = read_str(metadata, METADATA_NONCE)?
            .parse()
            .map_err(|_| Error::AuthFault("`nonce` metadata is not a valid integer".to_string()))?;

        let mut sessions = self.current.lock().unwrap();
        let expected = sessions
            .get(&peer_id)
            .copied()
            .ok_or_else(|| Error::AuthFault(format!("unknown peer id {peer_id}")))?;

        let next = expected
            .checked_add(1)
            .ok_or_else(|| Error::AuthFault("session nonce counter overflowed".to_string()))?;

        if nonce != next {
            return Err(Error::AuthFault(format!(
                "nonce mismatch for peer {peer_id}: expected {next}, got {nonce}"
            )));
        }

        sessions.insert(peer_id.clone(), next);
        Ok(peer_id)
    }
}

/// Client-side nonce cursor: the value last used, bumped by one after
/// every successful send.
#[derive(Debug, Clone, Copy)]
pub struct ClientNonce(u64);

impl ClientNonce {
    pub fn starting_at(initial: u64) -> Self {
        Self(initial)
    }

    /// The nonce value to attach to the *next* outgoing request.
    pub fn next_value(&self) -> Result<u64> {
        self.0
            .checked_add(1)
            .ok_or_else(|| Error::AuthFault("client nonce counter overflowed".to_string()))
    }

    /// Advance past the value just sent.
    pub fn advance(&mut self) -> Result<()> {
        self.0 = self.next_value()?;
        Ok(())
    }

    pub fn current(&self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_nonce_advances_tracker() {
        let tracker = NonceTracker::new();
        tracker.register("1", 10);

        let mut request = Request::new(());
        request.metadata_mut().insert(METADATA_METHOD_NAME, "GetInfo".parse().unwrap());
        request.metadata_mut().insert(METADATA_ID, "1".parse().unwrap());
        request.metadata_mut().insert(METADATA_NONCE, "11".parse().unwrap());

        let peer_id = tracker.validate_and_advance(&request).unwrap();
        assert_eq!(peer_id, "1");

        // Replaying the same nonce is now rejected.
        assert!(tracker.validate_and_advance(&request).is_err());
    }

    #[test]
    fn unknown_peer_is_rejected() {
        let tracker = NonceTracker::new();
        let mut request = Request::new(());
        request.metadata_mut().insert(METADATA_METHOD_NAME, "GetInfo".parse().unwrap());
        request.metadata_mut().insert(METADATA_ID, "999".parse().unwrap());
        request.metadata_mut().insert(METADATA_NONCE, "1".parse().unwrap());
        assert!(matches!(
            tracker.validate_and_advance(&request),
            Err(Error::AuthFault(_))
        ));
    }

    #[test]
    fn client_nonce_advances_by_one() {
        let mut nonce = ClientNonce::starting_at(5);
        assert_eq!(nonce.next_value().unwrap(), 6);
        nonce.advance().unwrap();
        assert_eq!(nonce.current(), 6);
    }

    #[test]
    fn client_nonce_overflow_is_fatal() {
        let nonce = ClientNonce::starting_at(u64::MAX);
        assert!(nonce.next_value().is_err());
    }
}
