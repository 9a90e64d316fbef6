//! The units of traffic: messages and replies.
//!
//! Both carry a [`RoutableState`]: the call stack of reply handlers still
//! owed a reply, the diagnostic trace, and a transient context value that is
//! only meaningful between a `push_handler` and its matching `pop_handler`.
//!
//! - `call_stack` -- LIFO of (handler, context) frames
//! - `message` -- `Message`, a send in progress
//! - `reply` -- `Reply`, a response in progress

pub mod call_stack;
pub mod message;
pub mod reply;

use std::any::Any;
use std::fmt;
use std::sync::Arc;

use courier_types::Trace;

pub use call_stack::CallStack;
pub use message::Message;
pub use reply::Reply;

use crate::handler::ReplyHandler;

/// Opaque per-hop value stashed by whoever pushed a handler.
///
/// Contexts move between frames and routables; they are never copied.
#[derive(Debug, Default)]
pub enum Context {
    #[default]
    Empty,
    Value(u64),
    Any(Box<dyn Any + Send>),
}

impl Context {
    pub fn as_value(&self) -> Option<u64> {
        match self {
            Context::Value(v) => Some(*v),
            _ => None,
        }
    }

    pub fn is_empty(&self) -> bool {
        matches!(self, Context::Empty)
    }
}

/// Application payload of a message or reply.
///
/// The bus never looks inside a body; the body's protocol encodes it when it
/// crosses a network boundary.
pub trait Body: Any + Send + fmt::Debug {
    /// Name of the protocol that encodes this body.
    fn protocol(&self) -> &str;

    /// Protocol-specific type tag.
    fn kind(&self) -> u32;

    /// Size estimate used for admission control.
    fn approx_size(&self) -> u32 {
        1
    }

    fn as_any(&self) -> &dyn Any;
}

impl dyn Body {
    pub fn downcast_ref<T: Body>(&self) -> Option<&T> {
        self.as_any().downcast_ref::<T>()
    }
}

/// Tracking state shared by messages and replies.
#[derive(Debug, Default)]
pub struct RoutableState {
    pub(crate) call_stack: CallStack,
    pub(crate) trace: Trace,
    pub(crate) context: Context,
}

impl RoutableState {
    pub fn swap(&mut self, other: &mut RoutableState) {
        std::mem::swap(self, other);
    }
}

/// Behavior common to messages and replies.
pub trait Routable {
    fn state(&self) -> &RoutableState;

    fn state_mut(&mut self) -> &mut RoutableState;

    fn trace(&self) -> &Trace {
        &self.state().trace
    }

    fn trace_mut(&mut self) -> &mut Trace {
        &mut self.state_mut().trace
    }

    fn context(&self) -> &Context {
        &self.state().context
    }

    fn set_context(&mut self, context: Context) {
        self.state_mut().context = context;
    }

    fn take_context(&mut self) -> Context {
        std::mem::take(&mut self.state_mut().context)
    }

    fn call_stack(&self) -> &CallStack {
        &self.state().call_stack
    }

    /// Push `handler` with the current context, leaving the context empty.
    fn push_handler(&mut self, handler: Arc<dyn ReplyHandler>) {
        let state = self.state_mut();
        let context = std::mem::take(&mut state.context);
        state.call_stack.push(handler, context);
    }

    /// Pop the next handler, restoring the context it was pushed with.
    ///
    /// # Panics
    ///
    /// Panics if the call stack is empty; that means a reply was delivered
    /// more often than it was owed.
    fn pop_handler(&mut self) -> Arc<dyn ReplyHandler> {
        let state = self.state_mut();
        state.call_stack.pop(&mut state.context)
    }

    /// Drop all tracking state. Used when no reply will ever be delivered.
    fn discard(&mut self) {
        let state = self.state_mut();
        state.context = Context::Empty;
        state.call_stack.clear();
        state.trace.clear();
    }
}

/// Either kind of routable, for APIs that forward both.
#[derive(Debug)]
pub enum AnyRoutable {
    Message(Message),
    Reply(Reply),
}

impl From<Message> for AnyRoutable {
    fn from(msg: Message) -> Self {
        AnyRoutable::Message(msg)
    }
}

impl From<Reply> for AnyRoutable {
    fn from(reply: Reply) -> Self {
        AnyRoutable::Reply(reply)
    }
}
