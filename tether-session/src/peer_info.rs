//! §3 data model types shared by the handshake, request authenticator,
//! and peer session state machine: `PeerInfo`, `SessionContext`, and the
//! `RuntimeInfo` supplement surfaced by `GetInfo`.

use crate::error::{Error, Result};
use crate::pipeline::PipelineHandle;
use std::collections::HashMap;
use std::sync::Mutex;

/// A runtime the edge can execute a model under (`GetInfo`'s
/// `runtimes[]`), e.g. `{name: "tflite", devices: ["cpu", "gpu0"]}`.
#[derive(Debug, Clone)]
pub struct RuntimeInfo {
    pub name: String,
    pub devices: Vec<String>,
}

/// Configuration supplied by discovery and consumed by the Peer Session
/// (§3 `PeerInfo`).
#[derive(Debug, Clone)]
pub struct PeerInfo {
    pub host: String,
    pub port: u16,
    pub uuid: String,
    pub runtimes: Vec<RuntimeInfo>,
    pub free_memory: u64,
    pub free_storage: u64,
}

impl PeerInfo {
    /// A client-side `PeerInfo` must carry `port > 0`.
    pub fn for_client(host: impl Into<String>, port: u16, uuid: impl Into<String>) -> Result<Self> {
        if port == 0 {
            return Err(Error::InvalidArgument(
                "a client-side PeerInfo must carry port > 0".to_string(),
            ));
        }
        Ok(Self {
            host: host.into(),
            port,
            uuid: uuid.into(),
            runtimes: Vec::new(),
            free_memory: 0,
            free_storage: 0,
        })
    }

    /// A server-side `PeerInfo` may carry `port == 0` to request OS
    /// assignment.
    pub fn for_server(host: impl Into<String>, port: u16, uuid: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port,
            uuid: uuid.into(),
            runtimes: Vec::new(),
            free_memory: 0,
            free_storage: 0,
        }
    }
}

/// Minimum accepted symmetric key length; key material beyond 30 bytes
/// is ignored, shorter keys are rejected (§3 `SessionContext`).
pub const SRTP_MASTER_KEY_LEN: usize = 30;

/// One per connected client, keyed by the server-assigned `peer_id`.
pub struct SessionContext {
    pub peer_id: String,
    pub nonce: u64,
    srtp_master_key: [u8; SRTP_MASTER_KEY_LEN],
    pub pipeline_handle: Option<PipelineHandle>,
    pub model_path: Option<String>,
    pub input_tensor_info: Vec<crate::tensor::TensorInfo>,
    pub output_tensor_info: Vec<crate::tensor::TensorInfo>,
}

impl SessionContext {
    /// Create a session context from a freshly exchanged key. Rejects
    /// session keys shorter than [`SRTP_MASTER_KEY_LEN`]; bytes beyond
    /// that length are ignored.
    pub fn new(peer_id: String, nonce: u64, session_key: &[u8]) -> Result<Self> {
        if session_key.len() < SRTP_MASTER_KEY_LEN {
            return Err(Error::InvalidArgument(format!(
                "session key of {} bytes is shorter than the {}-byte SRTP master key",
                session_key.len(),
                SRTP_MASTER_KEY_LEN
            )));
        }
        let mut srtp_master_key = [0u8; SRTP_MASTER_KEY_LEN];
        srtp_master_key.copy_from_slice(&session_key[..SRTP_MASTER_KEY_LEN]);
        Ok(Self {
            peer_id,
            nonce,
            srtp_master_key,
            pipeline_handle: None,
            model_path: None,
            input_tensor_info: Vec::new(),
            output_tensor_info: Vec::new(),
        })
    }

    /// The first 30 bytes of the exchanged session key, used as the
    /// SRTP master key.
    pub fn srtp_master_key(&self) -> &[u8; SRTP_MASTER_KEY_LEN] {
        &self.srtp_master_key
    }
}

/// Server-side map of active sessions, mutated only on the gRPC server's
/// tokio tasks (guarded by a `Mutex` rather than pinned to one OS thread,
/// per §5's note that RPC dispatch concurrency is orthogonal to the
/// single-threaded-cooperative rule governing the Credential Engine and
/// pipeline bridge).
#[derive(Default)]
pub struct SessionMap {
    sessions: Mutex<HashMap<String, SessionContext>>,
}

impl SessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, context: SessionContext) {
        self.sessions
            .lock()
            .unwrap()
            .insert(context.peer_id.clone(), context);
    }

    pub fn remove(&self, peer_id: &str) -> Option<SessionContext> {
        self.sessions.lock().unwrap().remove(peer_id)
    }

    pub fn contains(&self, peer_id: &str) -> bool {
        self.sessions.lock().unwrap().contains_key(peer_id)
    }

    /// Run `f` with exclusive access to one session's context, if it
    /// exists.
    pub fn with_mut<R>(&self, peer_id: &str, f: impl FnOnce(&mut SessionContext) -> R) -> Option<R> {
        self.sessions.lock().unwrap().get_mut(peer_id).map(f)
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_peer_info_rejects_zero_port() {
        assert!(PeerInfo::for_client("edge.local", 0, "uuid").is_err());
    }

    #[test]
    fn server_peer_info_allows_zero_port() {
        let info = PeerInfo::for_server("0.0.0.0", 0, "uuid");
        assert_eq!(info.port, 0);
    }

    #[test]
    fn session_context_rejects_short_key() {
        assert!(SessionContext::new("1".to_string(), 0, &[0u8; 29]).is_err());
    }

    #[test]
    fn session_context_truncates_key_beyond_srtp_length() {
        let key = vec![9u8; 32];
        let ctx = SessionContext::new("1".to_string(), 0, &key).unwrap();
        assert_eq!(ctx.srtp_master_key().len(), SRTP_MASTER_KEY_LEN);
        assert!(ctx.srtp_master_key().iter().all(|&b| b == 9));
    }

    #[test]
    fn session_map_round_trips() {
        let map = SessionMap::new();
        let ctx = SessionContext::new("7".to_string(), 3, &[1u8; 32]).unwrap();
        map.insert(ctx);
        assert!(map.contains("7"));
        map.with_mut("7", |ctx| ctx.nonce = 4);
        assert!(map.remove("7").is_some());
        assert!(!map.contains("7"));
    }
}
