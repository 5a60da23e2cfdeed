//! Per-logical-connection state on both ends of the tunnel.
//!
//! The client side tracks read/write progress in a [`Retrievers`] table;
//! the server side wraps live outbound sockets in a [`Sessions`] table.
//! Both tables are guarded by a single mutex each; completion signals
//! are delivered through one-shot channels with the table lock released.

mod addr;
mod retrievers;
mod session;
mod sessions;

pub use addr::Endpoint;
pub use retrievers::{Cancel, Cancels, PendingOp, Retrievers, Sink};
pub use sessions::Sessions;

pub(crate) use addr::build_endpoint;

use thiserror::Error;

use crate::protocol::{code, dial_code};

/// Session-layer errors. `try_again` marks the recoverable ones: they
/// indicate reordering or transient transport trouble, and the retry
/// loop takes another attempt without tearing the connection down.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SessionError {
    // Resource errors reported by the peer.
    #[error("resource not found")]
    NotFound,
    #[error("resource not ready")]
    NotReady,
    #[error("resource expired")]
    Expired,
    #[error("resource broken")]
    Broken,
    #[error("resource closed")]
    Closed,
    #[error("send failure")]
    SendFailure,
    #[error("unknown resource error")]
    Unknown,

    // Dial errors reported by the peer.
    #[error("dial rejected: invalid request")]
    DialInvalidRequest,
    #[error("dial failed: unreachable")]
    DialUnreachable,
    #[error("dial rejected: over capacity")]
    DialOverCapacity,
    #[error("dial rejected: already dialed")]
    DialAlreadyDialed,
    #[error("dial failed: internal failure")]
    DialInternalFailure,
    #[error("dial failed: unknown error")]
    DialUnknown,

    // Responses that arrived out of order within a concurrent batch.
    #[error("unexpected retrieve respond, retry")]
    RetrieveRespondRetry,
    #[error("unexpected resume respond, retry")]
    ResumeRespondRetry,
    #[error("unexpected send respond, retry")]
    SendRespondRetry,

    // Local table errors.
    #[error("undefined retriever")]
    Undefined,
    #[error("retriever is busy")]
    Busy,
    #[error("retriever table is full")]
    RetrieversFull,
    #[error("unable to mint a fresh id")]
    IdExhausted,
    #[error("failed to build request")]
    BuildFailed,

    // Requester transport errors.
    #[error("request body too large")]
    RequestBodyTooLarge,
    #[error("cipher failure")]
    CipherFailed,
    #[error("request left unresponded")]
    Unresponded,
    #[error("http respond carried no body")]
    NoRespondBody,
}

impl SessionError {
    /// Whether the top-level retry loop should take another attempt.
    pub fn try_again(self) -> bool {
        matches!(
            self,
            SessionError::Expired
                | SessionError::DialUnreachable
                | SessionError::DialOverCapacity
                | SessionError::RetrieveRespondRetry
                | SessionError::ResumeRespondRetry
                | SessionError::SendRespondRetry
                | SessionError::RequestBodyTooLarge
                | SessionError::CipherFailed
                | SessionError::Unresponded
                | SessionError::NoRespondBody
        )
    }

    /// Map a non-zero resource error code from a response header.
    pub fn from_resource_code(n: u8) -> SessionError {
        match n {
            code::NOT_FOUND => SessionError::NotFound,
            code::NOT_READY => SessionError::NotReady,
            code::EXPIRED => SessionError::Expired,
            code::BROKEN => SessionError::Broken,
            code::CLOSED => SessionError::Closed,
            code::SEND_FAILURE => SessionError::SendFailure,
            _ => SessionError::Unknown,
        }
    }

    /// Map a non-zero dial error code from a dial response header.
    pub fn from_dial_code(n: u8) -> SessionError {
        match n {
            dial_code::INVALID_REQUEST => SessionError::DialInvalidRequest,
            dial_code::UNREACHABLE => SessionError::DialUnreachable,
            dial_code::OVER_CAPACITY => SessionError::DialOverCapacity,
            dial_code::ALREADY_DIALED => SessionError::DialAlreadyDialed,
            dial_code::INTERNAL_FAILURE => SessionError::DialInternalFailure,
            _ => SessionError::DialUnknown,
        }
    }
}

/// Whether a resource error code leaves the peer state intact.
pub(crate) fn resource_code_recoverable(n: u8) -> bool {
    n == code::SUCCESS || SessionError::from_resource_code(n).try_again()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expired_is_the_only_recoverable_resource_code() {
        assert!(resource_code_recoverable(code::SUCCESS));
        assert!(resource_code_recoverable(code::EXPIRED));
        assert!(!resource_code_recoverable(code::NOT_FOUND));
        assert!(!resource_code_recoverable(code::NOT_READY));
        assert!(!resource_code_recoverable(code::BROKEN));
    }

    #[test]
    fn retryable_dial_codes() {
        assert!(SessionError::from_dial_code(dial_code::UNREACHABLE).try_again());
        assert!(SessionError::from_dial_code(dial_code::OVER_CAPACITY).try_again());
        assert!(!SessionError::from_dial_code(dial_code::ALREADY_DIALED).try_again());
        assert!(!SessionError::from_dial_code(dial_code::INVALID_REQUEST).try_again());
    }
}
