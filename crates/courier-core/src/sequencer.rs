//! Per-key ordering gate in front of a message handler.
//!
//! Messages carrying a sequence id are let through one at a time per id:
//! the next one is released when the reply to the previous one comes back.
//! Messages without a sequence id pass straight through.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, Weak};

use courier_types::TraceLevel;
use tracing::debug;

use crate::handler::{MessageHandler, ReplyHandler};
use crate::routable::{Context, Message, Reply, Routable};

pub struct Sequencer {
    me: Weak<Sequencer>,
    sender: Arc<dyn MessageHandler>,
    /// Sequence id -> messages waiting behind the one in flight. A present
    /// (possibly empty) entry means a message with that id is in flight.
    queues: Mutex<HashMap<u64, VecDeque<Message>>>,
}

impl Sequencer {
    pub fn new(sender: Arc<dyn MessageHandler>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sender,
            queues: Mutex::new(HashMap::new()),
        })
    }

    /// Number of sequence ids with a message in flight.
    pub fn num_in_flight(&self) -> usize {
        self.queues.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Number of messages held back behind in-flight ones.
    pub fn num_queued(&self) -> usize {
        self.queues
            .lock()
            .map(|q| q.values().map(VecDeque::len).sum())
            .unwrap_or(0)
    }

    /// Discard every queued message. They were never sent, so nobody is
    /// owed a reply through this sequencer.
    pub fn destroy(&self) {
        let drained: Vec<Message> = match self.queues.lock() {
            Ok(mut queues) => queues.drain().flat_map(|(_, q)| q).collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "discarding queued sequenced messages");
        }
        for mut msg in drained {
            msg.discard();
        }
    }

    fn sequenced_send(&self, mut msg: Message, seq_id: u64) {
        let Some(me) = self.me.upgrade() else {
            msg.discard();
            return;
        };
        msg.trace_mut().trace(
            TraceLevel::COMPONENT,
            format!("Sequencer sending message with sequence id '{seq_id}'."),
        );
        msg.set_context(Context::Value(seq_id));
        msg.push_handler(me);
        self.sender.handle_message(msg);
    }
}

impl MessageHandler for Sequencer {
    fn handle_message(&self, mut msg: Message) {
        let Some(seq_id) = msg.sequence_id() else {
            self.sender.handle_message(msg);
            return;
        };
        {
            let Ok(mut queues) = self.queues.lock() else {
                msg.discard();
                return;
            };
            if let Some(queue) = queues.get_mut(&seq_id) {
                msg.trace_mut().trace(
                    TraceLevel::COMPONENT,
                    format!("Sequencer queued message with sequence id '{seq_id}'."),
                );
                queue.push_back(msg);
                return;
            }
            queues.insert(seq_id, VecDeque::new());
        }
        self.sequenced_send(msg, seq_id);
    }
}

impl ReplyHandler for Sequencer {
    fn handle_reply(&self, mut reply: Reply) {
        let seq_id = reply.context().as_value().unwrap_or_default();
        reply.trace_mut().trace(
            TraceLevel::COMPONENT,
            format!("Sequencer received reply with sequence id '{seq_id}'."),
        );
        let next = match self.queues.lock() {
            Ok(mut queues) => match queues.get_mut(&seq_id).and_then(VecDeque::pop_front) {
                Some(msg) => Some(msg),
                None => {
                    queues.remove(&seq_id);
                    None
                }
            },
            Err(_) => None,
        };
        if let Some(msg) = next {
            self.sequenced_send(msg, seq_id);
        }
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }
}

impl Drop for Sequencer {
    fn drop(&mut self) {
        self.destroy();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple::SimpleMessage;
    use proptest::prelude::*;

    /// Downstream stand-in that parks every message it receives.
    #[derive(Default)]
    struct Parking {
        held: Mutex<Vec<Message>>,
    }

    impl MessageHandler for Parking {
        fn handle_message(&self, msg: Message) {
            self.held.lock().unwrap().push(msg);
        }
    }

    impl Parking {
        fn take(&self) -> Vec<Message> {
            std::mem::take(&mut *self.held.lock().unwrap())
        }
    }

    fn value_of(msg: &Message) -> String {
        msg.body().downcast_ref::<SimpleMessage>().unwrap().value().to_string()
    }

    /// Build a message whose final reply lands in `log`.
    fn tracked(value: &str, seq: Option<u64>, log: &Arc<Mutex<Vec<String>>>) -> Message {
        let mut msg = Message::new(SimpleMessage::new(value));
        msg.set_sequence_id(seq);
        let log = log.clone();
        let value = value.to_string();
        msg.push_handler(Arc::new(move |_reply: Reply| log.lock().unwrap().push(value.clone())));
        msg
    }

    fn answer(mut msg: Message) {
        let mut reply = Reply::for_message(&mut msg);
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }

    #[test]
    fn unsequenced_messages_pass_through() {
        let down = Arc::new(Parking::default());
        let seq = Sequencer::new(down.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        seq.handle_message(tracked("a", None, &log));
        seq.handle_message(tracked("b", None, &log));
        assert_eq!(down.take().len(), 2);
        assert_eq!(seq.num_in_flight(), 0);
    }

    #[test]
    fn same_key_waits_for_reply() {
        let down = Arc::new(Parking::default());
        let seq = Sequencer::new(down.clone());
        let log = Arc::new(Mutex::new(Vec::new()));

        seq.handle_message(tracked("a", Some(7), &log));
        seq.handle_message(tracked("b", Some(7), &log));
        seq.handle_message(tracked("c", Some(8), &log));

        let first = down.take();
        assert_eq!(first.iter().map(value_of).collect::<Vec<_>>(), vec!["a", "c"]);
        assert_eq!(seq.num_queued(), 1);

        let mut first = first.into_iter();
        answer(first.next().unwrap());
        let released = down.take();
        assert_eq!(released.len(), 1);
        assert_eq!(value_of(&released[0]), "b");

        answer(released.into_iter().next().unwrap());
        answer(first.next().unwrap());
        assert_eq!(seq.num_in_flight(), 0);
        assert_eq!(*log.lock().unwrap(), vec!["a", "b", "c"]);
    }

    #[test]
    fn destroy_discards_queued() {
        let down = Arc::new(Parking::default());
        let seq = Sequencer::new(down.clone());
        let log = Arc::new(Mutex::new(Vec::new()));
        seq.handle_message(tracked("a", Some(1), &log));
        seq.handle_message(tracked("b", Some(1), &log));
        seq.destroy();
        assert_eq!(seq.num_queued(), 0);
    }

    proptest! {
        #[test]
        fn replies_follow_send_order_per_key(
            n in 1usize..12,
            picks in proptest::collection::vec(any::<prop::sample::Index>(), 64),
        ) {
            let down = Arc::new(Parking::default());
            let seq = Sequencer::new(down.clone());
            let log = Arc::new(Mutex::new(Vec::new()));
            for i in 0..n {
                seq.handle_message(tracked(&i.to_string(), Some(42), &log));
            }

            // Reply to whatever is in flight, in arbitrary order.
            let mut in_flight = down.take();
            let mut picks = picks.into_iter().cycle();
            while !in_flight.is_empty() {
                let idx = picks.next().unwrap().index(in_flight.len());
                answer(in_flight.swap_remove(idx));
                in_flight.extend(down.take());
            }

            let expected: Vec<String> = (0..n).map(|i| i.to_string()).collect();
            prop_assert_eq!(&*log.lock().unwrap(), &expected);
        }
    }
}
