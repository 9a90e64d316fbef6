//! LIFO record of the reply handlers a routable still owes.

use std::fmt;
use std::sync::Arc;

use super::Context;
use crate::handler::ReplyHandler;

struct Frame {
    handler: Arc<dyn ReplyHandler>,
    context: Context,
}

/// Stack of (handler, context) frames owned by exactly one routable.
#[derive(Default)]
pub struct CallStack {
    frames: Vec<Frame>,
}

impl CallStack {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, handler: Arc<dyn ReplyHandler>, context: Context) {
        self.frames.push(Frame { handler, context });
    }

    /// Pop the top frame, moving its context into `context`.
    ///
    /// # Panics
    ///
    /// Panics on an empty stack: an unbalanced pop is a programming error.
    pub fn pop(&mut self, context: &mut Context) -> Arc<dyn ReplyHandler> {
        let Some(frame) = self.frames.pop() else {
            panic!("pop from empty call stack: reply delivered more often than owed");
        };
        *context = frame.context;
        frame.handler
    }

    pub fn swap(&mut self, other: &mut CallStack) {
        std::mem::swap(&mut self.frames, &mut other.frames);
    }

    pub fn clear(&mut self) {
        self.frames.clear();
    }

    pub fn size(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }
}

impl fmt::Debug for CallStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallStack")
            .field("size", &self.frames.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routable::{Reply, Routable};
    use std::sync::Mutex;

    struct Named(&'static str, Arc<Mutex<Vec<&'static str>>>);

    impl ReplyHandler for Named {
        fn handle_reply(&self, _reply: Reply) {
            self.1.lock().unwrap().push(self.0);
        }
    }

    #[test]
    fn pops_in_reverse_order_and_restores_context() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut reply = Reply::empty();

        reply.set_context(Context::Value(1));
        reply.push_handler(Arc::new(Named("h1", log.clone())));
        assert!(reply.context().is_empty());
        reply.set_context(Context::Value(2));
        reply.push_handler(Arc::new(Named("h2", log.clone())));
        assert_eq!(reply.call_stack().size(), 2);

        let first = reply.pop_handler();
        assert_eq!(reply.context().as_value(), Some(2));
        first.handle_reply(Reply::empty());

        let second = reply.pop_handler();
        assert_eq!(reply.context().as_value(), Some(1));
        assert!(reply.call_stack().is_empty());
        second.handle_reply(reply);

        assert_eq!(*log.lock().unwrap(), vec!["h2", "h1"]);
    }

    #[test]
    #[should_panic(expected = "pop from empty call stack")]
    fn pop_empty_panics() {
        let mut reply = Reply::empty();
        let _ = reply.pop_handler();
    }

    #[test]
    fn swap_and_clear() {
        let mut a = CallStack::new();
        let mut b = CallStack::new();
        a.push(Arc::new(|_reply: Reply| {}), Context::Empty);
        a.swap(&mut b);
        assert!(a.is_empty());
        assert_eq!(b.size(), 1);
        b.clear();
        assert!(b.is_empty());
    }
}
