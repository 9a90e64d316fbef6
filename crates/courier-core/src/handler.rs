//! The two callback shapes every session client and collaborator implements.
//!
//! Handlers are synchronous. Deliveries mediated by the bus run on its single
//! delivery worker, so two handlers never run concurrently on that path.
//! Handlers must not block for long: they hold up every other delivery.

use crate::routable::{Message, Reply};

/// Receives messages.
pub trait MessageHandler: Send + Sync {
    fn handle_message(&self, msg: Message);
}

/// Receives replies.
///
/// Whoever holds a reply owes it to exactly one handler: the one popped off
/// the reply's call stack.
pub trait ReplyHandler: Send + Sync {
    fn handle_reply(&self, reply: Reply);
}

impl<F> MessageHandler for F
where
    F: Fn(Message) + Send + Sync,
{
    fn handle_message(&self, msg: Message) {
        self(msg)
    }
}

impl<F> ReplyHandler for F
where
    F: Fn(Reply) + Send + Sync,
{
    fn handle_reply(&self, reply: Reply) {
        self(reply)
    }
}
