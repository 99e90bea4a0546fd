//! Error types for runtime operations.
//!
//! The runtime surfaces the closed wire error set as a Rust enum; portal
//! handlers translate any internal failure into one of these before
//! replying, so a client never sees a code outside this set.

use core::fmt;

use ibex_abi::error::ErrorCode;
use ibex_abi::wire::WireError;

/// Error type for runtime operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// Malformed or out-of-range arguments.
    ArgsInvalid,
    /// A fixed-size table or selector space is exhausted.
    Capacity,
    /// The named object does not exist.
    NotFound,
    /// The object already exists.
    Exists,
    /// The referenced capability was revoked or never existed.
    Abort,
    /// Unspecified failure.
    Failure,
}

impl Error {
    /// The wire code for this error.
    pub const fn code(self) -> ErrorCode {
        match self {
            Error::ArgsInvalid => ErrorCode::ArgsInvalid,
            Error::Capacity => ErrorCode::Capacity,
            Error::NotFound => ErrorCode::NotFound,
            Error::Exists => ErrorCode::Exists,
            Error::Abort => ErrorCode::Abort,
            Error::Failure => ErrorCode::Failure,
        }
    }

    /// Convert a wire code back into an error; `Success` maps to `None`.
    pub const fn from_code(code: ErrorCode) -> Option<Self> {
        match code {
            ErrorCode::Success => None,
            ErrorCode::ArgsInvalid => Some(Error::ArgsInvalid),
            ErrorCode::Capacity => Some(Error::Capacity),
            ErrorCode::NotFound => Some(Error::NotFound),
            ErrorCode::Exists => Some(Error::Exists),
            ErrorCode::Abort => Some(Error::Abort),
            ErrorCode::Failure => Some(Error::Failure),
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.code().fmt(f)
    }
}

impl From<WireError> for Error {
    fn from(_: WireError) -> Self {
        // A malformed word stream is always the sender's fault.
        Error::ArgsInvalid
    }
}

/// Result type alias using the runtime [`Error`].
pub type Result<T> = core::result::Result<T, Error>;
