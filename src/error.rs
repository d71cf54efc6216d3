//! Error types and the last-error slot values.
//!
//! Every public bus call reports its outcome twice: as a typed `Result`, and
//! by writing the bus-wide error slot before returning. The slot exists so a
//! caller can query the most recent failure after the fact, the way the
//! classic errno contract works; the `Result` is the primary channel.

use core::fmt;

/// Code describing the outcome of the most recent bus call.
///
/// Stored in the bus error slot and overwritten by every public call
/// (except [`close`](crate::Bus::close), which is silent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorCode {
    /// The last call succeeded.
    #[default]
    None,
    /// The referenced channel id is out of range, vacated, or was closed.
    NoChannel,
    /// A non-blocking call found the channel full (send) or empty (recv).
    WouldBlock,
    /// Reserved for optional features absent in a given build.
    NotImplemented,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Self::None => "no error",
            Self::NoChannel => "no such channel",
            Self::WouldBlock => "operation would block",
            Self::NotImplemented => "not implemented",
        };
        f.write_str(text)
    }
}

/// Error returned by a failing bus operation.
///
/// The failure-only subset of [`ErrorCode`]: a returned error is never
/// `None`, so the success code has no variant here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BusError {
    /// The referenced channel id is out of range, vacated, or was closed.
    NoChannel,
    /// A non-blocking call found the channel full (send) or empty (recv).
    /// Blocking variants never surface this; they park and retry instead.
    WouldBlock,
    /// Reserved for optional features absent in a given build.
    NotImplemented,
}

impl BusError {
    /// The slot code corresponding to this error.
    #[must_use]
    pub const fn code(self) -> ErrorCode {
        match self {
            Self::NoChannel => ErrorCode::NoChannel,
            Self::WouldBlock => ErrorCode::WouldBlock,
            Self::NotImplemented => ErrorCode::NotImplemented,
        }
    }

    /// Returns true if this is the transient full/empty condition.
    #[must_use]
    pub const fn is_would_block(self) -> bool {
        matches!(self, Self::WouldBlock)
    }
}

impl fmt::Display for BusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoChannel => write!(f, "no such channel"),
            Self::WouldBlock => write!(f, "operation would block"),
            Self::NotImplemented => write!(f, "not implemented"),
        }
    }
}

impl std::error::Error for BusError {}

impl From<BusError> for ErrorCode {
    fn from(err: BusError) -> Self {
        err.code()
    }
}

/// A specialized `Result` type for bus operations.
pub type Result<T> = core::result::Result<T, BusError>;
