//! Error taxonomy for the Credential Engine.
//!
//! Variants map 1:1 onto the errno-style codes the facade returns at its
//! API boundary (see `Error::code`).

use thiserror::Error;

/// Errors produced by any Credential Engine operation.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad parameters, malformed PEM/JSON, or wrong key-id for the operation.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A getter was called on a field that was never set.
    #[error("not ready: {0}")]
    NotReady(String),

    /// Operation attempted in the wrong facade state (e.g. before `activate`).
    #[error("sequence error: {0}")]
    SequenceError(String),

    /// `activate` called on an already-active engine.
    #[error("already active")]
    AlreadyExists,

    /// Allocation failure surfaced from a fallible buffer operation.
    #[error("out of memory")]
    OutOfMemory,

    /// An RSA/AES/X.509 backend primitive failed.
    #[error("cryptographic fault: {0}")]
    CryptoFault(String),

    /// Requested operation or key type is not supported.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),
}

/// Result type used throughout the Credential Engine.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Errno-compatible code for the API boundary (§7 of the spec).
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -libc_einval(),
            Error::NotReady(_) => -libc_einval(),
            Error::SequenceError(_) => -libc_eilseq(),
            Error::AlreadyExists => -libc_ealready(),
            Error::OutOfMemory => -libc_enomem(),
            Error::CryptoFault(_) => -libc_efault(),
            Error::UnsupportedOperation(_) => -libc_enotsup(),
        }
    }
}

// Rather than pull in the `libc` crate for half a dozen constants, the
// well-known POSIX errno values are spelled out here; they are stable
// across every target this crate supports (Linux, macOS).
const fn libc_einval() -> i32 {
    22
}
const fn libc_eilseq() -> i32 {
    84
}
const fn libc_ealready() -> i32 {
    114
}
const fn libc_enomem() -> i32 {
    12
}
const fn libc_efault() -> i32 {
    14
}
const fn libc_enotsup() -> i32 {
    95
}
