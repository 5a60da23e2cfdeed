//! Message dispatch: parse a concatenation of messages inside one
//! decrypted segment and route each to the owning side.
//!
//! A handler error aborts the segment on the server (a malformed
//! request is fatal to that HTTP turn) and is logged-and-continued on
//! the client, so one bad sub-response does not lose peers to the
//! other logical connections sharing the turn.

mod requester;
mod responder;

pub use requester::RequestDispatcher;
pub use responder::{Responder, SubResponseSink};

use thiserror::Error;

use crate::protocol::ProtocolError;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("response sink failed")]
    SinkFailed,
}
