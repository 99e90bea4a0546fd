//! Wire error codes.
//!
//! Every portal reply begins with one of these codes. The set is closed:
//! services translate internal failures into the nearest code rather than
//! inventing new ones.

use core::fmt;

use crate::wire::{Wire, WireError, WordReader, WordWriter};

/// Result code carried as the first untyped word of every portal reply.
#[repr(u64)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    /// Operation succeeded.
    Success = 0,
    /// Malformed or out-of-range arguments.
    ArgsInvalid = 1,
    /// A fixed-size table or selector space is exhausted.
    Capacity = 2,
    /// The named object does not exist.
    NotFound = 3,
    /// The object already exists.
    Exists = 4,
    /// The referenced capability was revoked or never existed.
    Abort = 5,
    /// Unspecified failure.
    Failure = 6,
}

impl ErrorCode {
    /// Convert a raw wire word back into a code.
    ///
    /// Unknown words collapse to [`ErrorCode::Failure`] so a corrupted reply
    /// never turns into a false success.
    pub const fn from_word(word: u64) -> Self {
        match word {
            0 => Self::Success,
            1 => Self::ArgsInvalid,
            2 => Self::Capacity,
            3 => Self::NotFound,
            4 => Self::Exists,
            5 => Self::Abort,
            _ => Self::Failure,
        }
    }

    /// The raw wire word for this code.
    pub const fn as_word(self) -> u64 {
        self as u64
    }

    /// Whether this code is [`ErrorCode::Success`].
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Success)
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::ArgsInvalid => "invalid arguments",
            Self::Capacity => "out of capacity",
            Self::NotFound => "not found",
            Self::Exists => "already exists",
            Self::Abort => "capability revoked",
            Self::Failure => "failure",
        };
        f.write_str(s)
    }
}

impl Wire for ErrorCode {
    fn put(&self, w: &mut WordWriter<'_>) {
        w.push(self.as_word());
    }

    fn get(r: &mut WordReader<'_>) -> Result<Self, WireError> {
        Ok(Self::from_word(r.pop()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn word_round_trip() {
        for code in [
            ErrorCode::Success,
            ErrorCode::ArgsInvalid,
            ErrorCode::Capacity,
            ErrorCode::NotFound,
            ErrorCode::Exists,
            ErrorCode::Abort,
            ErrorCode::Failure,
        ] {
            assert_eq!(ErrorCode::from_word(code.as_word()), code);
        }
    }

    #[test]
    fn unknown_word_is_failure() {
        assert_eq!(ErrorCode::from_word(0xdead), ErrorCode::Failure);
    }
}
