//! Owner of one outbound message while it is on the network.

use std::sync::{Arc, Mutex, Weak};

use courier_types::{Error, ErrorCode, Trace, TraceLevel};
use tokio::time::Instant;
use tracing::{Level, debug, trace};

use crate::bus::MessageBus;
use crate::handler::ReplyHandler;
use crate::network::NetworkOwner;
use crate::routable::{Message, Reply, Routable};

/// Target that turns on full routable tracing for messages that did not ask
/// for it. Their traces are logged here instead of returned.
pub const TRACE_TARGET: &str = "courier::trace";

/// Keeps the original message while a copy travels, so it can be resent or
/// handed back with its reply.
pub struct SendProxy {
    me: Weak<SendProxy>,
    bus: Arc<MessageBus>,
    msg: Mutex<Option<Message>>,
    log_trace: bool,
}

impl SendProxy {
    pub(crate) fn new(bus: Arc<MessageBus>, mut msg: Message) -> Arc<Self> {
        let log_trace = msg.trace().level() == 0 && tracing::enabled!(target: TRACE_TARGET, Level::TRACE);
        if log_trace {
            msg.trace_mut().set_level(TraceLevel::MAX);
        }
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            msg: Mutex::new(Some(msg)),
            log_trace,
        })
    }

    /// Resolve the next hop and put the message on the network.
    pub(crate) fn send(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let outcome = {
            let Ok(mut slot) = self.msg.lock() else {
                return;
            };
            let Some(msg) = slot.as_mut() else {
                return;
            };
            let resolved = if msg.deadline().is_some_and(|deadline| deadline <= Instant::now()) {
                Err(Error::new(ErrorCode::TIMEOUT, "Timed out before the message could be sent."))
            } else {
                self.bus.resolve(msg)
            };
            match resolved {
                Ok(resolution) => {
                    let retry = msg.retry();
                    msg.trace_mut().trace(
                        TraceLevel::SEND_RECEIVE,
                        format!("Sending message (retry {retry}) to '{}'.", resolution.recipient),
                    );
                    self.bus
                        .network()
                        .send(msg, &resolution.route, &resolution.recipient, me.clone());
                    Ok(())
                }
                Err(error) => Err(error),
            }
        };
        if let Err(error) = outcome {
            let mut reply = Reply::empty();
            reply.add_error(error);
            self.bus.deliver_reply(reply, me);
        }
    }

    pub(crate) fn resend(&self) {
        self.send();
    }

    /// Drop the message without a reply. Used when the bus goes away with
    /// the message still scheduled for retry.
    pub(crate) fn abort(&self) {
        if let Some(mut msg) = self.msg.lock().ok().and_then(|mut slot| slot.take()) {
            msg.discard();
        }
    }

    fn merge_trace(&self, msg: &mut Message, reply: &mut Reply) {
        if self.log_trace {
            msg.trace_mut().add_child(reply.trace_mut().take_root());
            msg.trace_mut().normalize();
            if reply.has_errors() {
                debug!(target: TRACE_TARGET, trace = %msg.trace(), "trace for reply with errors");
            } else {
                trace!(target: TRACE_TARGET, trace = %msg.trace(), "trace for reply");
            }
            *msg.trace_mut() = Trace::default();
        } else if msg.trace().level() > 0 && !reply.trace().is_empty() {
            msg.trace_mut().add_child(reply.trace_mut().take_root());
            msg.trace_mut().normalize();
        }
    }
}

impl ReplyHandler for SendProxy {
    fn handle_reply(&self, mut reply: Reply) {
        let Some(mut msg) = self.msg.lock().ok().and_then(|mut slot| slot.take()) else {
            reply.discard();
            return;
        };

        if let Some(resender) = self.bus.resender() {
            if resender.should_retry(&msg, &reply) {
                if let Some(delay) = resender.prepare_retry(&mut msg, &mut reply) {
                    if !self.log_trace && msg.trace().level() > 0 && !reply.trace().is_empty() {
                        msg.trace_mut().add_child(reply.trace_mut().take_root());
                    }
                    reply.discard();
                    if let Ok(mut slot) = self.msg.lock() {
                        *slot = Some(msg);
                    }
                    if let Some(me) = self.me.upgrade() {
                        resender.schedule(me, delay);
                    }
                    return;
                }
            }
        }

        self.merge_trace(&mut msg, &mut reply);
        reply.swap_state_with_message(&mut msg);
        reply.set_message(msg);
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBusParams;
    use crate::network::{LocalNetwork, LocalWire};
    use crate::resender::RetryTransientErrorsPolicy;
    use crate::session::{DestinationSession, SourceSession, SourceSessionParams};
    use crate::simple::{SimpleMessage, SimpleProtocol};
    use crate::throttle::AllPassThrottlePolicy;
    use courier_types::{HopSpec, RouteSpec, RoutingSpec, RoutingTableSpec};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn params() -> MessageBusParams {
        MessageBusParams::default()
            .with_protocol(Arc::new(SimpleProtocol::new()))
            .with_retry_policy(Some(Arc::new(RetryTransientErrorsPolicy::new(Duration::from_millis(10)))))
    }

    fn inbox(bus: &Arc<MessageBus>, name: &str) -> (Arc<DestinationSession>, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let session = bus
            .create_destination_session(name, Arc::new(move |m: Message| drop(tx.send(m))))
            .unwrap();
        (session, rx)
    }

    fn source(bus: &Arc<MessageBus>) -> (Arc<SourceSession>, mpsc::UnboundedReceiver<Reply>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let params = SourceSessionParams::new(Arc::new(move |r: Reply| drop(tx.send(r))))
            .with_throttle_policy(Box::new(AllPassThrottlePolicy));
        (bus.create_source_session(params).unwrap(), rx)
    }

    #[tokio::test]
    async fn transient_error_is_retried() {
        let wire = LocalWire::new();
        let client = MessageBus::new(LocalNetwork::new(&wire, "client"), params()).unwrap();
        let server = MessageBus::new(LocalNetwork::new(&wire, "server"), params()).unwrap();
        let (dest, mut received) = inbox(&server, "inbox");
        let (source, mut replies) = source(&client);

        source.send_to(Message::new(SimpleMessage::new("x")), "server/inbox").unwrap();

        let mut first = received.recv().await.unwrap();
        assert_eq!(first.retry(), 0);
        let mut busy = Reply::for_message(&mut first);
        busy.add_error(Error::new(ErrorCode::SESSION_BUSY, "try later"));
        dest.reply(busy);

        let second = received.recv().await.unwrap();
        assert_eq!(second.retry(), 1);
        dest.acknowledge(second);

        let reply = replies.recv().await.unwrap();
        assert!(!reply.has_errors());
        assert_eq!(reply.message().unwrap().retry(), 1);
        assert_eq!(client.resender().unwrap().num_scheduled(), 0);
        client.destroy().await;
        server.destroy().await;
    }

    #[tokio::test]
    async fn fatal_error_is_not_retried() {
        let wire = LocalWire::new();
        let client = MessageBus::new(LocalNetwork::new(&wire, "client"), params()).unwrap();
        let server = MessageBus::new(LocalNetwork::new(&wire, "server"), params()).unwrap();
        let (dest, mut received) = inbox(&server, "inbox");
        let (source, mut replies) = source(&client);

        source.send_to(Message::new(SimpleMessage::new("x")), "server/inbox").unwrap();
        let mut msg = received.recv().await.unwrap();
        let mut failed = Reply::for_message(&mut msg);
        failed.add_error(Error::new(ErrorCode::APP_FATAL_ERROR, "no"));
        dest.reply(failed);

        let reply = replies.recv().await.unwrap();
        assert!(reply.has_fatal_errors());
        assert_eq!(reply.message().unwrap().retry(), 0);
        client.destroy().await;
        server.destroy().await;
    }

    #[tokio::test]
    async fn routes_through_the_routing_table() {
        let wire = LocalWire::new();
        let routing = RoutingSpec::default().with_table(
            RoutingTableSpec::new("Simple")
                .with_hop(
                    HopSpec::new("spread", "[RoundRobin]")
                        .with_recipient("server/a")
                        .with_recipient("server/b"),
                )
                .with_route(RouteSpec::new("default").with_hop("spread")),
        );
        let mut client_params = params();
        client_params.routing = routing;
        let client = MessageBus::new(LocalNetwork::new(&wire, "client"), client_params).unwrap();
        let server = MessageBus::new(LocalNetwork::new(&wire, "server"), params()).unwrap();
        let (a, mut at_a) = inbox(&server, "a");
        let (b, mut at_b) = inbox(&server, "b");
        let (source, mut replies) = source(&client);

        source.send_to(Message::new(SimpleMessage::new("1")), "default").unwrap();
        source.send_to(Message::new(SimpleMessage::new("2")), "default").unwrap();
        a.acknowledge(at_a.recv().await.unwrap());
        b.acknowledge(at_b.recv().await.unwrap());
        assert!(!replies.recv().await.unwrap().has_errors());
        assert!(!replies.recv().await.unwrap().has_errors());

        source.send_to(Message::new(SimpleMessage::new("3")), "[Missing]").unwrap();
        assert_eq!(replies.recv().await.unwrap().errors()[0].code, ErrorCode::UNKNOWN_POLICY);
        client.destroy().await;
        server.destroy().await;
    }

    #[tokio::test]
    async fn destroy_fails_outstanding_sends() {
        let wire = LocalWire::new();
        let client = MessageBus::new(LocalNetwork::new(&wire, "client"), params()).unwrap();
        let server = MessageBus::new(LocalNetwork::new(&wire, "server"), params()).unwrap();
        let (_dest, mut received) = inbox(&server, "inbox");
        let (source, mut replies) = source(&client);

        source.send_to(Message::new(SimpleMessage::new("x")), "server/inbox").unwrap();
        let _held = received.recv().await.unwrap();
        client.destroy().await;

        let reply = replies.recv().await.unwrap();
        assert_eq!(reply.errors()[0].code, ErrorCode::NETWORK_SHUTDOWN);
        assert_eq!(source.pending_count(), 0);
        server.destroy().await;
    }
}
