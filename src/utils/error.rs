//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;

/// Category of a `VeelaError`, used by callers to decide between rejecting
/// the input, retrying with a higher ballot, or escalating to an operator.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum ErrorKind {
    /// Malformed value bytes that cannot be encoded or decoded.
    Encoding,
    /// Input shorter than the fixed value header.
    TruncatedInput,
    /// Value header carries an unknown format version.
    UnsupportedVersion,
    /// Declared lengths or ranges fall outside the available bytes.
    OutOfBounds,

    /// Durable acceptor state violates an invariant.
    CorruptState,
    /// A term was started at an epoch other than the next free one.
    NonContiguousTerm,

    /// Promise ballot not higher than the current promise.
    StalePromiseRequest,
    /// Accept ballot lower than the current promise.
    StaleAcceptRequest,

    /// Acceptor ID already registered in the group.
    DuplicateAcceptor,
    /// Log path or registry entry does not exist.
    NotFound,
    /// Log path already in use.
    AlreadyExists,
    /// Log holds no record to recover from.
    EmptyLog,
    /// Operation on a closed acceptor or log handle.
    Closed,
    /// Instance epoch not covered by any live term.
    InstanceOutOfRange,
    /// Epoch arithmetic wrapped around.
    Overflow,

    /// Invalid configuration string.
    Config,
    /// Underlying I/O failure.
    Io,
    /// Anything else.
    Other,
}

/// Customized error type for Veela.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct VeelaError {
    kind: ErrorKind,
    msg: String,
}

impl VeelaError {
    /// Error of kind `Other` carrying given message.
    pub fn msg(msg: impl ToString) -> Self {
        VeelaError {
            kind: ErrorKind::Other,
            msg: msg.to_string(),
        }
    }

    /// Error of given kind carrying given message.
    pub fn new(kind: ErrorKind, msg: impl ToString) -> Self {
        VeelaError {
            kind,
            msg: msg.to_string(),
        }
    }

    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// True for durable-state violations after which the acceptor must stop
    /// serving and wait for manual recovery.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::CorruptState | ErrorKind::NonContiguousTerm | ErrorKind::Io
        )
    }

    /// True for ordinary protocol-level rejections; the proposer should
    /// retry with a higher ballot.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self.kind,
            ErrorKind::StalePromiseRequest | ErrorKind::StaleAcceptRequest
        )
    }
}

impl fmt::Display for VeelaError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for VeelaError {}

impl From<io::Error> for VeelaError {
    fn from(e: io::Error) -> Self {
        let kind = match e.kind() {
            io::ErrorKind::NotFound => ErrorKind::NotFound,
            io::ErrorKind::AlreadyExists => ErrorKind::AlreadyExists,
            _ => ErrorKind::Io,
        };
        VeelaError::new(kind, e)
    }
}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `VeelaError`.
macro_rules! impl_from_error {
    ($error:ty => $kind:ident) => {
        impl From<$error> for VeelaError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                VeelaError::new(ErrorKind::$kind, e)
            }
        }
    };
}

// Helper macro for saving boiler-plate `impl From<X<T>>`s for transparent
// conversion from various common generic error types to `VeelaError`.
macro_rules! impl_from_error_generic {
    ($error:ty => $kind:ident) => {
        impl<T> From<$error> for VeelaError {
            fn from(e: $error) -> VeelaError {
                VeelaError::new(ErrorKind::$kind, e)
            }
        }
    };
}

impl_from_error!(rmp_serde::encode::Error => Encoding);
impl_from_error!(rmp_serde::decode::Error => Encoding);
impl_from_error!(toml::de::Error => Config);
impl_from_error!(tokio::sync::oneshot::error::RecvError => Closed);
impl_from_error!(tokio::task::JoinError => Other);

impl_from_error_generic!(tokio::sync::mpsc::error::SendError<T> => Closed);

#[cfg(test)]
mod error_tests {
    use super::*;

    #[test]
    fn error_display() {
        let e = VeelaError::msg("what the heck?");
        assert_eq!(format!("{}", e), String::from("what the heck?"));
        assert_eq!(e.kind(), ErrorKind::Other);
    }

    #[test]
    fn from_io_error() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "oh no!");
        let e = VeelaError::from(io_error);
        assert!(e.msg.contains("oh no!"));
        assert_eq!(e.kind(), ErrorKind::NotFound);
        let io_error = io::Error::new(io::ErrorKind::BrokenPipe, "pipe");
        assert_eq!(VeelaError::from(io_error).kind(), ErrorKind::Io);
    }

    #[test]
    fn classification() {
        assert!(VeelaError::new(ErrorKind::CorruptState, "x").is_fatal());
        assert!(!VeelaError::new(ErrorKind::CorruptState, "x").is_rejection());
        assert!(VeelaError::new(ErrorKind::StaleAcceptRequest, "x")
            .is_rejection());
        assert!(!VeelaError::new(ErrorKind::EmptyLog, "x").is_fatal());
    }
}
