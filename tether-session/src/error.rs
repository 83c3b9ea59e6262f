//! Error taxonomy for the Secured Peer Session (§7), extending the
//! Credential Engine's taxonomy with the session-layer variants
//! (`AuthFault`, `TransportFault`, `NotFound`).

use thiserror::Error;

/// Errors produced by the handshake, request authenticator, peer session
/// state machine, or pipeline bridge.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad parameters or malformed wire data.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation attempted in the wrong session state.
    #[error("sequence error: {0}")]
    SequenceError(String),

    /// Model path missing on the server.
    #[error("not found: {0}")]
    NotFound(String),

    /// A gRPC call returned a non-OK status.
    #[error("transport fault: {0}")]
    TransportFault(String),

    /// Nonce or uuid mismatch, or a TLS handshake failure during activate.
    #[error("authentication fault: {0}")]
    AuthFault(String),

    /// The Credential Engine reported a crypto failure.
    #[error("cryptographic fault: {0}")]
    CryptoFault(String),

    /// Requested operation or transport is not supported.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Result type used throughout `tether-session`.
pub type Result<T> = std::result::Result<T, Error>;

impl From<tether_credential::Error> for Error {
    fn from(e: tether_credential::Error) -> Self {
        match e {
            tether_credential::Error::InvalidArgument(s) => Error::InvalidArgument(s),
            tether_credential::Error::SequenceError(s) => Error::SequenceError(s),
            tether_credential::Error::CryptoFault(s) => Error::CryptoFault(s),
            other => Error::CryptoFault(other.to_string()),
        }
    }
}

impl From<tonic::Status> for Error {
    fn from(status: tonic::Status) -> Self {
        Error::TransportFault(format!("{}: {}", status.code(), status.message()))
    }
}

impl Error {
    /// Errno-compatible code for the API boundary (§7).
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -22, // EINVAL
            Error::SequenceError(_) => -84,   // EILSEQ
            Error::NotFound(_) => -2,         // ENOENT
            Error::TransportFault(_) => -14,  // EFAULT
            Error::AuthFault(_) => -1,        // EPERM-ish; gRPC layer maps to Unauthenticated
            Error::CryptoFault(_) => -14,     // EFAULT
            Error::UnsupportedOperation(_) => -95, // ENOTSUP
        }
    }

    /// Maps to the gRPC status this error should surface as, for server
    /// handlers translating an internal `Error` into a wire response.
    pub fn grpc_status(&self) -> tonic::Status {
        match self {
            Error::AuthFault(msg) => tonic::Status::unauthenticated(msg.clone()),
            Error::NotFound(msg) => tonic::Status::not_found(msg.clone()),
            Error::InvalidArgument(msg) => tonic::Status::invalid_argument(msg.clone()),
            Error::SequenceError(msg) => tonic::Status::failed_precondition(msg.clone()),
            other => tonic::Status::internal(other.to_string()),
        }
    }
}
