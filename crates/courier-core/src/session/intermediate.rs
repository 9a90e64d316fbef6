//! A named session that receives messages and passes them on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::debug;

use crate::bus::MessageBus;
use crate::handler::{MessageHandler, ReplyHandler};
use crate::routable::{AnyRoutable, Message, Reply, Routable};

pub struct IntermediateSession {
    me: Weak<IntermediateSession>,
    name: String,
    bus: Arc<MessageBus>,
    message_handler: Arc<dyn MessageHandler>,
    reply_handler: Arc<dyn ReplyHandler>,
    destroyed: AtomicBool,
}

impl IntermediateSession {
    pub(crate) fn new(
        bus: Arc<MessageBus>,
        name: &str,
        message_handler: Arc<dyn MessageHandler>,
        reply_handler: Arc<dyn ReplyHandler>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            name: name.to_string(),
            bus,
            message_handler,
            reply_handler,
            destroyed: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Address other buses use to reach this session.
    pub fn connection_spec(&self) -> String {
        format!("{}/{}", self.bus.connection_spec(), self.name)
    }

    /// Pass a routable on: a message continues along its route with this
    /// session waiting for the reply; a reply goes back to whoever is owed it.
    pub fn forward(&self, routable: impl Into<AnyRoutable>) {
        match routable.into() {
            AnyRoutable::Reply(mut reply) => {
                let handler = reply.pop_handler();
                handler.handle_reply(reply);
            }
            AnyRoutable::Message(mut msg) => {
                let Some(me) = self.me.upgrade() else {
                    msg.discard();
                    return;
                };
                msg.push_handler(me);
                self.bus.handle_message(msg);
            }
        }
    }

    /// Unregister from the bus and wait until no handler of this session is
    /// still running. Calling this from one of the session's handlers never
    /// returns.
    pub async fn close(&self) {
        self.bus.unregister_session(&self.name);
        self.bus.sync().await;
        self.destroyed.store(true, Ordering::Release);
        debug!(session = %self.name, "intermediate session closed");
    }
}

impl MessageHandler for IntermediateSession {
    fn handle_message(&self, msg: Message) {
        self.message_handler.handle_message(msg);
    }
}

impl ReplyHandler for IntermediateSession {
    fn handle_reply(&self, mut reply: Reply) {
        if self.destroyed.load(Ordering::Acquire) {
            reply.discard();
            return;
        }
        self.reply_handler.handle_reply(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBusParams;
    use crate::network::{LocalNetwork, LocalWire};
    use crate::session::SourceSessionParams;
    use crate::simple::{SimpleMessage, SimpleProtocol};
    use crate::throttle::AllPassThrottlePolicy;
    use courier_types::{Route, TraceLevel};
    use tokio::sync::mpsc;

    fn bus(wire: &Arc<LocalWire>, identity: &str) -> Arc<MessageBus> {
        let params = MessageBusParams::default().with_protocol(Arc::new(SimpleProtocol::new()));
        MessageBus::new(LocalNetwork::new(wire, identity), params).unwrap()
    }

    fn channel<T: Send + 'static>() -> (Arc<dyn Fn(T) + Send + Sync>, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(move |item: T| drop(tx.send(item))), rx)
    }

    #[tokio::test]
    async fn relays_message_and_reply() {
        let wire = LocalWire::new();
        let client = bus(&wire, "client");
        let relay = bus(&wire, "relay");
        let server = bus(&wire, "server");

        let (relay_msgs, mut relay_inbox) = channel::<Message>();
        let (relay_replies, mut relay_outbox) = channel::<Reply>();
        let hop = relay
            .create_intermediate_session(
                "hop",
                Arc::new(move |m: Message| relay_msgs(m)),
                Arc::new(move |r: Reply| relay_replies(r)),
            )
            .unwrap();
        assert_eq!(hop.connection_spec(), "relay/hop");

        let (server_msgs, mut server_inbox) = channel::<Message>();
        let dest = server
            .create_destination_session("inbox", Arc::new(move |m: Message| server_msgs(m)))
            .unwrap();

        let (replies, mut client_replies) = channel::<Reply>();
        let source = client
            .create_source_session(
                SourceSessionParams::new(Arc::new(move |r: Reply| replies(r)))
                    .with_throttle_policy(Box::new(AllPassThrottlePolicy)),
            )
            .unwrap();

        let mut msg = Message::new(SimpleMessage::new("via relay"))
            .with_route(Route::parse("relay/hop server/inbox").unwrap());
        msg.trace_mut().set_level(TraceLevel::MAX);
        source.send(msg).unwrap();

        let at_relay = relay_inbox.recv().await.unwrap();
        assert_eq!(at_relay.route().to_string(), "server/inbox");
        hop.forward(at_relay);

        let at_server = server_inbox.recv().await.unwrap();
        assert!(at_server.route().is_empty());
        dest.acknowledge(at_server);

        let back_at_relay = relay_outbox.recv().await.unwrap();
        assert!(!back_at_relay.has_errors());
        hop.forward(back_at_relay);

        let reply = client_replies.recv().await.unwrap();
        assert!(!reply.has_errors());
        let trace = reply.trace().to_string();
        assert!(trace.contains("received by 'relay'"), "{trace}");
        assert!(trace.contains("received by 'server'"), "{trace}");
        assert_eq!(relay.pending_count(), 0);

        hop.close().await;
        assert!(!relay.has_session("hop"));
        for b in [client, relay, server] {
            b.destroy().await;
        }
    }
}
