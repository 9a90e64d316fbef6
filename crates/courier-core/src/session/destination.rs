//! A named session at the end of a route. Every message it receives must be
//! answered, through [`DestinationSession::reply`] or
//! [`DestinationSession::acknowledge`].

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::bus::MessageBus;
use crate::handler::MessageHandler;
use crate::routable::{Message, Reply, Routable};

pub struct DestinationSession {
    name: String,
    bus: Arc<MessageBus>,
    message_handler: Arc<dyn MessageHandler>,
}

impl fmt::Debug for DestinationSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestinationSession").field("name", &self.name).finish_non_exhaustive()
    }
}

impl DestinationSession {
    pub(crate) fn new(bus: Arc<MessageBus>, name: &str, message_handler: Arc<dyn MessageHandler>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            bus,
            message_handler,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection_spec(&self) -> String {
        format!("{}/{}", self.bus.connection_spec(), self.name)
    }

    /// Send `reply` back. It must have taken over the state of the message
    /// it answers (see `Reply::for_message`).
    pub fn reply(&self, mut reply: Reply) {
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }

    /// Answer `msg` with an empty reply.
    pub fn acknowledge(&self, mut msg: Message) {
        let reply = Reply::for_message(&mut msg);
        self.reply(reply);
    }

    /// Unregister from the bus and wait until no handler of this session is
    /// still running. Calling this from the message handler never returns.
    pub async fn close(&self) {
        self.bus.unregister_session(&self.name);
        self.bus.sync().await;
        debug!(session = %self.name, "destination session closed");
    }
}

impl MessageHandler for DestinationSession {
    fn handle_message(&self, msg: Message) {
        self.message_handler.handle_message(msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::MessageBusParams;
    use crate::network::{LocalNetwork, LocalWire};
    use crate::session::SourceSessionParams;
    use crate::simple::{SimpleMessage, SimpleProtocol, SimpleReply};
    use crate::throttle::AllPassThrottlePolicy;
    use courier_types::{Error, ErrorCode, Route};
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn replies_with_body_and_errors_from_inside_the_handler() {
        let wire = LocalWire::new();
        let params = || MessageBusParams::default().with_protocol(Arc::new(SimpleProtocol::new()));
        let client = MessageBus::new(LocalNetwork::new(&wire, "client"), params().with_retry_policy(None)).unwrap();
        let server = MessageBus::new(LocalNetwork::new(&wire, "server"), params()).unwrap();

        // The handler needs the session to answer through; hand it over after creation.
        let slot: Arc<Mutex<Option<Arc<DestinationSession>>>> = Arc::new(Mutex::new(None));
        let inner = slot.clone();
        let echo = server
            .create_destination_session(
                "echo",
                Arc::new(move |mut msg: Message| {
                    let session = inner.lock().unwrap().clone().unwrap();
                    let value = msg.body().downcast_ref::<SimpleMessage>().unwrap().value().to_string();
                    let mut reply = Reply::new(SimpleReply::new(value.to_uppercase()));
                    reply.swap_state_with_message(&mut msg);
                    if value == "bad" {
                        reply.add_error(Error::new(ErrorCode::APP_FATAL_ERROR, "refused"));
                    }
                    session.reply(reply);
                }),
            )
            .unwrap();
        *slot.lock().unwrap() = Some(echo.clone());

        let (tx, mut replies) = mpsc::unbounded_channel();
        let source = client
            .create_source_session(
                SourceSessionParams::new(Arc::new(move |r: Reply| drop(tx.send(r))))
                    .with_throttle_policy(Box::new(AllPassThrottlePolicy)),
            )
            .unwrap();
        let route = || Route::parse("server/echo").unwrap();
        source.send(Message::new(SimpleMessage::new("good")).with_route(route())).unwrap();
        let ok = replies.recv().await.unwrap();
        assert_eq!(ok.body().unwrap().downcast_ref::<SimpleReply>().unwrap().value(), "GOOD");

        source.send(Message::new(SimpleMessage::new("bad")).with_route(route())).unwrap();
        let failed = replies.recv().await.unwrap();
        assert!(failed.has_fatal_errors());
        assert_eq!(failed.errors()[0].message, "refused");

        echo.close().await;
        assert!(!server.has_session("echo"));
        source.send(Message::new(SimpleMessage::new("late")).with_route(route())).unwrap();
        assert_eq!(replies.recv().await.unwrap().errors()[0].code, ErrorCode::UNKNOWN_SESSION);

        slot.lock().unwrap().take();
        client.destroy().await;
        server.destroy().await;
    }
}
