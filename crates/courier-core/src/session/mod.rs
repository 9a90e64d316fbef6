//! The three roles a client can play against a [`MessageBus`](crate::bus::MessageBus).
//!
//! - `source` -- originates messages and receives their replies
//! - `intermediate` -- receives messages and forwards them (or replies) onward
//! - `destination` -- receives messages and answers every one of them

pub mod destination;
pub mod intermediate;
pub mod source;

use courier_types::{Error, ErrorCode};
use thiserror::Error;

pub use destination::DestinationSession;
pub use intermediate::IntermediateSession;
pub use source::{SourceSession, SourceSessionParams};

use crate::routable::Message;

/// A send the session refused.
///
/// When the message was not consumed it rides along, so the caller can try
/// again later without rebuilding it.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct SendRejected {
    error: Error,
    message: Option<Message>,
}

impl SendRejected {
    pub fn new(error: Error, message: Option<Message>) -> Self {
        Self { error, message }
    }

    pub fn error(&self) -> &Error {
        &self.error
    }

    pub fn code(&self) -> ErrorCode {
        self.error.code
    }

    pub fn message(&self) -> Option<&Message> {
        self.message.as_ref()
    }

    /// The refused message, if the session handed it back.
    pub fn into_message(self) -> Option<Message> {
        self.message
    }

    pub fn into_parts(self) -> (Error, Option<Message>) {
        (self.error, self.message)
    }
}

/// Outcome of `SourceSession::send`: `Ok` means the message was accepted and
/// exactly one reply will follow.
pub type SendResult = Result<(), SendRejected>;
