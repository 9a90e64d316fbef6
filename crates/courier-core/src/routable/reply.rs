//! A response in progress.

use std::time::Duration;

use courier_types::{Error, ErrorCode};

use super::{Body, Message, Routable, RoutableState};

/// The answer to a [`Message`].
///
/// A reply without a body is an "empty reply", typically an acknowledgement
/// or a carrier for errors.
#[derive(Debug, Default)]
pub struct Reply {
    state: RoutableState,
    body: Option<Box<dyn Body>>,
    message: Option<Box<Message>>,
    errors: Vec<Error>,
    retry_delay: Option<Duration>,
}

impl Reply {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn new(body: impl Body) -> Self {
        Self::from_boxed(Box::new(body))
    }

    pub fn from_boxed(body: Box<dyn Body>) -> Self {
        Self {
            body: Some(body),
            ..Self::default()
        }
    }

    /// An empty reply that takes over the tracking state of `msg`.
    pub fn for_message(msg: &mut Message) -> Self {
        let mut reply = Self::empty();
        reply.swap_state_with_message(msg);
        reply
    }

    /// Build an error reply for `msg`, taking over its state and keeping the
    /// message attached so the caller gets it back.
    pub fn error_for(mut msg: Message, code: ErrorCode, text: impl Into<String>) -> Self {
        let mut reply = Self::for_message(&mut msg);
        reply.add_error(Error::new(code, text));
        reply.set_message(msg);
        reply
    }

    pub fn is_empty_reply(&self) -> bool {
        self.body.is_none()
    }

    pub fn body(&self) -> Option<&dyn Body> {
        self.body.as_deref()
    }

    pub fn take_body(&mut self) -> Option<Box<dyn Body>> {
        self.body.take()
    }

    pub fn protocol(&self) -> Option<&str> {
        self.body.as_ref().map(|b| b.protocol())
    }

    /// The message this reply answers, when it was handed back.
    pub fn message(&self) -> Option<&Message> {
        self.message.as_deref()
    }

    pub fn set_message(&mut self, msg: Message) {
        self.message = Some(Box::new(msg));
    }

    pub fn take_message(&mut self) -> Option<Message> {
        self.message.take().map(|m| *m)
    }

    pub fn add_error(&mut self, error: Error) {
        self.errors.push(error);
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    pub fn num_errors(&self) -> usize {
        self.errors.len()
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    pub fn has_fatal_errors(&self) -> bool {
        self.errors.iter().any(Error::is_fatal)
    }

    /// Resend delay requested by the replier; `None` defers to the retry policy.
    pub fn retry_delay(&self) -> Option<Duration> {
        self.retry_delay
    }

    pub fn set_retry_delay(&mut self, delay: Option<Duration>) {
        self.retry_delay = delay;
    }

    pub fn swap_state(&mut self, other: &mut Reply) {
        self.state.swap(&mut other.state);
    }

    /// Take over the tracking state of `msg` (and give it ours).
    pub fn swap_state_with_message(&mut self, msg: &mut Message) {
        self.state.swap(msg.state_mut());
    }
}

impl Routable for Reply {
    fn state(&self) -> &RoutableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RoutableState {
        &mut self.state
    }
}
