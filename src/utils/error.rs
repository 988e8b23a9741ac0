//! Customized unified error type.

use std::error;
use std::fmt;
use std::io;
use std::num;

use crate::rpc::{SessionId, Status, TxId};

/// Category of a `CurpError`, letting callers tell apart a node that could
/// not be reached from one that answered with a failure status.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    /// Transport-level failure: no response came back from the session.
    Unreachable(SessionId),

    /// The node replied with a failure status.
    Status(Status),

    /// Unsynced transaction prepares that crash recovery does not replay.
    PrepareNotRetried(Vec<TxId>),

    /// Locally enforced RPC timeout expired.
    Timeout,

    /// Anything else, carried only as a message.
    Other,
}

/// Customized error type for the tracker.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct CurpError {
    kind: ErrorKind,
    msg: String,
}

impl CurpError {
    pub fn msg(msg: impl ToString) -> Self {
        CurpError {
            kind: ErrorKind::Other,
            msg: msg.to_string(),
        }
    }

    pub fn with_kind(kind: ErrorKind, msg: impl ToString) -> Self {
        CurpError {
            kind,
            msg: msg.to_string(),
        }
    }

    pub fn unreachable(session: SessionId) -> Self {
        Self::with_kind(
            ErrorKind::Unreachable(session),
            format!("session {} unreachable", session),
        )
    }

    pub fn status(status: Status) -> Self {
        Self::with_kind(
            ErrorKind::Status(status),
            format!("rpc failed with status {:?}", status),
        )
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    /// True if the failure happened below the RPC layer, i.e., the request
    /// may never have reached its target.
    pub fn is_transport(&self) -> bool {
        matches!(self.kind, ErrorKind::Unreachable(_) | ErrorKind::Timeout)
    }
}

impl fmt::Display for CurpError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.msg) // do not display literal quotes
    }
}

impl error::Error for CurpError {}

// Helper macro for saving boiler-plate `impl From<X>`s for transparent
// conversion from various common error types to `CurpError`.
macro_rules! impl_from_error {
    ($error:ty) => {
        impl From<$error> for CurpError {
            fn from(e: $error) -> Self {
                // just store the source error's string representation
                CurpError::msg(e.to_string())
            }
        }
    };
}

impl_from_error!(io::Error);
impl_from_error!(num::ParseIntError);
impl_from_error!(toml::de::Error);
impl_from_error!(tokio::task::JoinError);

impl From<tokio::time::error::Elapsed> for CurpError {
    fn from(e: tokio::time::error::Elapsed) -> Self {
        CurpError::with_kind(ErrorKind::Timeout, e.to_string())
    }
}
