//! Error types for rdmalink.

use std::fmt;
use std::io;

use crate::cm::CmEvent;
use crate::endpoint::Status;
use crate::wire::MAGIC_LENGTH;

/// Error type for endpoint operations.
#[derive(Debug)]
pub enum Error {
    /// IO error from the socket, pipe, or a connection-manager call.
    Io(io::Error),
    /// The hello did not start with the expected magic.
    InvalidMagic { got: [u8; MAGIC_LENGTH] },
    /// A wire message was shorter than its fixed layout.
    Truncated { required: usize, available: usize },
    /// A CM event arrived that the current handshake state does not accept.
    Protocol { state: Status, event: CmEvent },
    /// The connection manager reported an error or an unknown event.
    Cm(CmEvent),
    /// A verbs post failed; the queue pair is unusable.
    PostFailed(io::Error),
    /// A work request completed with an error status.
    FailedCompletion,
    /// No registered memory block available for a receive slot.
    NoMemory,
    /// The send window is empty; retry after credits return.
    WindowFull,
    /// An incoming connect request was discarded at accept.
    Rejected(&'static str),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Io(e) => write!(f, "IO error: {}", e),
            Error::InvalidMagic { got } => {
                write!(f, "Invalid hello magic: expected \"RDMA\", got {:02x?}", got)
            }
            Error::Truncated { required, available } => {
                write!(
                    f,
                    "Message too short: required {} bytes, got {}",
                    required, available
                )
            }
            Error::Protocol { state, event } => {
                write!(f, "Unexpected CM event {:?} in state {:?}", event, state)
            }
            Error::Cm(event) => write!(f, "Connection manager reported {:?}", event),
            Error::PostFailed(e) => write!(f, "Fail to post work request: {}", e),
            Error::FailedCompletion => write!(f, "Work request completed with error"),
            Error::NoMemory => write!(f, "No registered memory block available"),
            Error::WindowFull => write!(f, "Send window exhausted"),
            Error::Rejected(reason) => write!(f, "Connect request rejected: {}", reason),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) | Error::PostFailed(e) => Some(e),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(e)
    }
}

/// Result type for endpoint operations.
pub type Result<T> = std::result::Result<T, Error>;
