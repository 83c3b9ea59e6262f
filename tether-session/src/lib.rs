//! Secured Peer Session (C7-C10): the Handshake Protocol, Request
//! Authenticator, Peer Session state machine, and Pipeline Bridge that
//! sit on top of the Credential Engine (`tether-credential`) and the
//! wire contract (`tether-proto`).

pub mod auth;
pub mod edge;
pub mod error;
pub mod handshake;
pub mod peer_info;
pub mod pipeline;
pub mod session;
pub mod tensor;

pub use error::{Error, Result};
pub use peer_info::{PeerInfo, RuntimeInfo, SessionContext, SessionMap};
pub use pipeline::{
    MediaKind, PipelineBridge, PipelineBridgeBuilder, PipelineEngine, PipelineHandle, Transport,
};
pub use session::{InputConfig, PeerSession, PipelineConfig, SessionState};
pub use tensor::{TensorInfo, TensorType};
