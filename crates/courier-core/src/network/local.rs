//! In-process transport.
//!
//! Several buses in one process share a [`LocalWire`]; each owns a
//! [`LocalNetwork`] registered on the wire under an identity. Service
//! addresses take the form `<identity>/<session>`.
//!
//! Bodies still cross the wire encoded: the sender's protocol encodes, the
//! receiver's decodes, exactly as they would between processes.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use courier_types::{Error, ErrorCode, Route, TraceLevel, TraceNode};
use dashmap::{DashMap, DashSet};
use semver::Version;
use tracing::{debug, warn};

use super::{Network, NetworkOwner};
use crate::handler::ReplyHandler;
use crate::routable::{Context, Message, Reply, Routable};

/// Version stamped on everything a local network encodes.
const WIRE_VERSION: Version = Version::new(1, 0, 0);

/// Shared medium connecting local networks by identity.
#[derive(Default)]
pub struct LocalWire {
    nodes: DashMap<String, Weak<LocalNetwork>>,
    next_request: AtomicU64,
}

impl LocalWire {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn identities(&self) -> Vec<String> {
        self.nodes.iter().map(|n| n.key().clone()).collect()
    }

    fn lookup(&self, identity: &str) -> Option<Arc<LocalNetwork>> {
        self.nodes.get(identity).and_then(|n| n.value().upgrade())
    }

    fn next_request_id(&self) -> u64 {
        self.next_request.fetch_add(1, Ordering::Relaxed)
    }
}

/// A reply on its way back across the wire.
struct WireReply {
    body: Option<(String, Vec<u8>)>,
    errors: Vec<Error>,
    retry_delay: Option<Duration>,
    trace: String,
}

pub struct LocalNetwork {
    me: Weak<LocalNetwork>,
    identity: String,
    wire: Arc<LocalWire>,
    owner: OnceLock<Weak<dyn NetworkOwner>>,
    sessions: DashSet<String>,
    /// Requests sent from here: request id -> handler owed the reply.
    outgoing: DashMap<u64, Arc<dyn ReplyHandler>>,
    /// Requests received here: request id -> network that sent them.
    incoming: DashMap<u64, Weak<LocalNetwork>>,
    shut_down: AtomicBool,
}

impl LocalNetwork {
    /// Create a network and register it on `wire` under `identity`,
    /// replacing any network that held the identity before.
    pub fn new(wire: &Arc<LocalWire>, identity: impl Into<String>) -> Arc<Self> {
        let identity = identity.into();
        let network = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            identity: identity.clone(),
            wire: wire.clone(),
            owner: OnceLock::new(),
            sessions: DashSet::new(),
            outgoing: DashMap::new(),
            incoming: DashMap::new(),
            shut_down: AtomicBool::new(false),
        });
        wire.nodes.insert(identity, Arc::downgrade(&network));
        network
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.contains(name)
    }

    pub fn num_outstanding(&self) -> usize {
        self.outgoing.len()
    }

    fn owner(&self) -> Option<Arc<dyn NetworkOwner>> {
        self.owner.get().and_then(Weak::upgrade)
    }

    fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Hand `handler` an error reply through our owner.
    fn fail(&self, handler: Arc<dyn ReplyHandler>, code: ErrorCode, text: String, service: &str) {
        let mut reply = Reply::empty();
        reply.add_error(Error::new(code, text).with_service(service));
        match self.owner() {
            Some(owner) => owner.deliver_reply(reply, handler),
            None => reply.discard(),
        }
    }

    /// Accept request `id` from `from`, bound for local `session`.
    fn receive(&self, id: u64, from: &Arc<LocalNetwork>, source: &Message, route: &Route, bytes: &[u8], session: &str) {
        let fail_back = |code: ErrorCode, text: String| {
            from.complete(
                id,
                WireReply {
                    body: None,
                    errors: vec![Error::new(code, text).with_service(self.identity.clone())],
                    retry_delay: None,
                    trace: String::new(),
                },
            );
        };

        if self.is_shut_down() {
            return fail_back(ErrorCode::NETWORK_SHUTDOWN, format!("Network '{}' is shut down.", self.identity));
        }
        let (Some(owner), Some(me)) = (self.owner(), self.me.upgrade()) else {
            return fail_back(ErrorCode::NETWORK_ERROR, format!("Network '{}' is not attached.", self.identity));
        };
        let Some(protocol) = owner.protocol(source.protocol()) else {
            return fail_back(
                ErrorCode::UNKNOWN_PROTOCOL,
                format!("Protocol '{}' is not known by '{}'.", source.protocol(), self.identity),
            );
        };
        let body = match protocol.decode(&WIRE_VERSION, bytes) {
            Ok(body) => body,
            Err(e) => return fail_back(ErrorCode::DECODE_ERROR, e.to_string()),
        };

        let mut msg = Message::from_boxed(body).with_route(route.clone());
        msg.set_retry(source.retry());
        msg.set_retry_enabled(source.retry_enabled());
        msg.set_bucket_sequence(source.bucket_sequence());
        msg.set_approx_size(source.approx_size());
        msg.set_time_remaining(source.time_remaining_now());
        msg.set_time_received_now();
        msg.trace_mut().set_level(source.trace().level());
        msg.trace_mut().trace(
            TraceLevel::SEND_RECEIVE,
            format!("Message received by '{}' for session '{session}'.", self.identity),
        );

        self.incoming.insert(id, Arc::downgrade(from));
        msg.set_context(Context::Value(id));
        msg.push_handler(me);
        owner.deliver_message(msg, session);
    }

    /// Finish request `id` sent from here.
    fn complete(&self, id: u64, wire: WireReply) {
        let Some((_, handler)) = self.outgoing.remove(&id) else {
            debug!(id, "reply for unknown request dropped");
            return;
        };
        let Some(owner) = self.owner() else {
            return;
        };

        let mut reply = match wire.body {
            None => Reply::empty(),
            Some((protocol_name, bytes)) => {
                let decoded = owner
                    .protocol(&protocol_name)
                    .ok_or_else(|| format!("Protocol '{protocol_name}' is not known by '{}'.", self.identity))
                    .and_then(|p| p.decode(&WIRE_VERSION, &bytes).map_err(|e| e.to_string()));
                match decoded {
                    Ok(body) => Reply::from_boxed(body),
                    Err(text) => {
                        let mut reply = Reply::empty();
                        reply.add_error(Error::new(ErrorCode::DECODE_ERROR, text));
                        reply
                    }
                }
            }
        };
        for error in wire.errors {
            reply.add_error(error);
        }
        reply.set_retry_delay(wire.retry_delay);
        if !wire.trace.is_empty() {
            match TraceNode::decode(&wire.trace) {
                Ok(node) => reply.trace_mut().add_child(node),
                Err(e) => warn!(error = %e, "dropping undecodable reply trace"),
            }
        }
        owner.deliver_reply(reply, handler);
    }
}

impl Network for LocalNetwork {
    fn attach(&self, owner: Weak<dyn NetworkOwner>) {
        if self.owner.set(owner).is_err() {
            warn!(identity = %self.identity, "network already attached; ignoring");
        }
    }

    fn wait_until_ready(&self, _timeout: Duration) -> bool {
        self.owner.get().is_some()
    }

    fn register_session(&self, name: &str) {
        self.sessions.insert(name.to_string());
    }

    fn unregister_session(&self, name: &str) {
        self.sessions.remove(name);
    }

    fn connection_spec(&self) -> String {
        self.identity.clone()
    }

    fn send(&self, msg: &Message, route: &Route, recipient: &str, handler: Arc<dyn ReplyHandler>) {
        if self.is_shut_down() {
            return self.fail(
                handler,
                ErrorCode::NETWORK_SHUTDOWN,
                format!("Network '{}' is shut down.", self.identity),
                recipient,
            );
        }
        let Some((identity, session)) = recipient.split_once('/') else {
            return self.fail(
                handler,
                ErrorCode::NO_ADDRESS_FOR_SERVICE,
                format!("'{recipient}' is not a service address."),
                recipient,
            );
        };
        let Some(peer) = self.wire.lookup(identity) else {
            return self.fail(
                handler,
                ErrorCode::NO_ADDRESS_FOR_SERVICE,
                format!("No address for service '{recipient}'."),
                recipient,
            );
        };
        let (Some(owner), Some(me)) = (self.owner(), self.me.upgrade()) else {
            return;
        };
        let Some(protocol) = owner.protocol(msg.protocol()) else {
            return self.fail(
                handler,
                ErrorCode::UNKNOWN_PROTOCOL,
                format!("Protocol '{}' is not known.", msg.protocol()),
                recipient,
            );
        };
        let bytes = match protocol.encode(&WIRE_VERSION, msg.body()) {
            Ok(bytes) => bytes,
            Err(e) => return self.fail(handler, ErrorCode::ENCODE_ERROR, e.to_string(), recipient),
        };

        let id = self.wire.next_request_id();
        self.outgoing.insert(id, handler);
        peer.receive(id, &me, msg, route, &bytes, session);
    }

    fn sync(&self) {}

    fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.wire
            .nodes
            .remove_if(&self.identity, |_, node| node.as_ptr() == self.me.as_ptr());
        self.incoming.clear();

        let ids: Vec<u64> = self.outgoing.iter().map(|e| *e.key()).collect();
        for id in ids {
            if let Some((_, handler)) = self.outgoing.remove(&id) {
                self.fail(
                    handler,
                    ErrorCode::NETWORK_SHUTDOWN,
                    format!("Network '{}' shut down before a reply arrived.", self.identity),
                    &self.identity,
                );
            }
        }
        debug!(identity = %self.identity, "local network shut down");
    }
}

impl ReplyHandler for LocalNetwork {
    /// A local session answered a request some other network sent us.
    fn handle_reply(&self, mut reply: Reply) {
        let id = reply.context().as_value().unwrap_or(u64::MAX);
        let sender = self.incoming.remove(&id).and_then(|(_, from)| from.upgrade());
        let Some(sender) = sender else {
            reply.discard();
            return;
        };

        let mut errors = reply.errors().to_vec();
        let body = match reply.take_body() {
            None => None,
            Some(body) => {
                let encoded = self
                    .owner()
                    .and_then(|owner| owner.protocol(body.protocol()))
                    .ok_or_else(|| format!("Protocol '{}' is not known.", body.protocol()))
                    .and_then(|p| p.encode(&WIRE_VERSION, body.as_ref()).map_err(|e| e.to_string()));
                match encoded {
                    Ok(bytes) => Some((body.protocol().to_string(), bytes)),
                    Err(text) => {
                        errors.push(Error::new(ErrorCode::ENCODE_ERROR, text).with_service(self.identity.clone()));
                        None
                    }
                }
            }
        };
        let trace = if reply.trace().is_empty() {
            String::new()
        } else {
            reply.trace().root().encode()
        };
        let wire = WireReply {
            body,
            errors,
            retry_delay: reply.retry_delay(),
            trace,
        };
        reply.discard();
        sender.complete(id, wire);
    }
}
