//! The central message bus.
//!
//! A `MessageBus` owns the delivery worker, the session registry, the
//! protocol repository and the routing tables of one process-local endpoint.
//! Outbound messages (from source and intermediate sessions) are wrapped in a
//! [`SendProxy`] and resolved against the routing tables; inbound messages
//! (from the network) pass a bus-wide admission check before they reach the
//! named session through the [`Messenger`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use arc_swap::ArcSwap;
use courier_types::config::BusConfig;
use courier_types::{Error, ErrorCode, RoutingSpec};
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::handler::{MessageHandler, ReplyHandler};
use crate::messenger::Messenger;
use crate::network::{Network, NetworkOwner};
use crate::protocol::{Protocol, ProtocolRepository};
use crate::proxy::SendProxy;
use crate::resender::{ResendTask, Resender, RetryPolicy, RetryTransientErrorsPolicy};
use crate::routable::{Context, Message, Reply, Routable};
use crate::routing::{self, Resolution, RoutingTable};
use crate::session::{
    DestinationSession, IntermediateSession, SourceSession, SourceSessionParams,
};

/// How often blocked senders are polled.
const BLOCKED_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// How long construction waits for the network.
const NETWORK_READY_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from setting up or reconfiguring a bus.
#[derive(Debug, Error)]
pub enum BusError {
    /// Another session already uses the name.
    #[error("session name '{0}' is already in use")]
    DuplicateSession(String),

    /// The routing spec failed verification.
    #[error("invalid routing spec: {}", .0.join("; "))]
    InvalidRouting(Vec<String>),

    /// The network did not become ready in time.
    #[error("network not ready after {0:?}")]
    NetworkNotReady(Duration),

    /// The bus has been destroyed.
    #[error("message bus is destroyed")]
    Destroyed,
}

/// Something with queued sends the bus should poll until they are gone.
pub trait BlockedSender: Send + Sync {
    /// Try to make progress. Returns `false` once nothing is left to send.
    fn try_send(&self) -> bool;
}

/// Construction parameters for [`MessageBus`].
pub struct MessageBusParams {
    /// Maximum unreplied inbound messages across all sessions (0 = unlimited).
    pub max_pending_count: u32,
    /// Maximum total size of unreplied inbound messages (0 = unlimited).
    pub max_pending_size: u64,
    /// Retry policy for transient errors; `None` disables resending.
    pub retry_policy: Option<Arc<dyn RetryPolicy>>,
    pub protocols: Vec<Arc<dyn Protocol>>,
    pub routing: RoutingSpec,
}

impl Default for MessageBusParams {
    fn default() -> Self {
        Self {
            max_pending_count: 2048,
            max_pending_size: 100 * 1024 * 1024,
            retry_policy: Some(Arc::new(RetryTransientErrorsPolicy::default())),
            protocols: Vec::new(),
            routing: RoutingSpec::default(),
        }
    }
}

impl MessageBusParams {
    pub fn from_config(config: &BusConfig) -> Self {
        let retry_policy: Option<Arc<dyn RetryPolicy>> = if config.retry.enabled {
            Some(Arc::new(RetryTransientErrorsPolicy::from_config(&config.retry)))
        } else {
            None
        };
        Self {
            max_pending_count: config.bus.max_pending_count,
            max_pending_size: config.bus.max_pending_size,
            retry_policy,
            protocols: Vec::new(),
            routing: config.routing.clone(),
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<dyn Protocol>) -> Self {
        self.protocols.push(protocol);
        self
    }

    pub fn with_retry_policy(mut self, policy: Option<Arc<dyn RetryPolicy>>) -> Self {
        self.retry_policy = policy;
        self
    }
}

#[derive(Debug, Default)]
struct Pending {
    count: u32,
    size: u64,
}

pub struct MessageBus {
    me: Weak<MessageBus>,
    network: Arc<dyn Network>,
    messenger: Messenger,
    resender: Option<Arc<Resender>>,
    protocols: ProtocolRepository,
    tables: ArcSwap<HashMap<String, Arc<RoutingTable>>>,
    sessions: DashMap<String, Arc<dyn MessageHandler>>,
    max_pending_count: AtomicU32,
    max_pending_size: AtomicU64,
    pending: Mutex<Pending>,
    blocked: Mutex<Vec<Weak<dyn BlockedSender>>>,
    shutdown: CancellationToken,
    poller: Mutex<Option<JoinHandle<()>>>,
    destroyed: AtomicBool,
}

impl MessageBus {
    /// Create a bus on top of `network`.
    ///
    /// Must be called inside a Tokio runtime: the delivery worker and the
    /// blocked-sender poller are spawned here.
    pub fn new(network: Arc<dyn Network>, params: MessageBusParams) -> Result<Arc<Self>, BusError> {
        let messenger = Messenger::start();
        let resender = params.retry_policy.map(|policy| Arc::new(Resender::new(policy)));
        if let Some(resender) = &resender {
            messenger.add_recurrent_task(Box::new(ResendTask(resender.clone())));
        }
        let protocols = ProtocolRepository::new();
        for protocol in params.protocols {
            protocols.put_protocol(protocol);
        }

        let bus = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            network,
            messenger,
            resender,
            protocols,
            tables: ArcSwap::from_pointee(HashMap::new()),
            sessions: DashMap::new(),
            max_pending_count: AtomicU32::new(params.max_pending_count),
            max_pending_size: AtomicU64::new(params.max_pending_size),
            pending: Mutex::new(Pending::default()),
            blocked: Mutex::new(Vec::new()),
            shutdown: CancellationToken::new(),
            poller: Mutex::new(None),
            destroyed: AtomicBool::new(false),
        });

        let owner: Weak<dyn NetworkOwner> = bus.me.clone();
        bus.network.attach(owner);
        if !bus.network.wait_until_ready(NETWORK_READY_TIMEOUT) {
            return Err(BusError::NetworkNotReady(NETWORK_READY_TIMEOUT));
        }
        if !params.routing.tables.is_empty() {
            bus.setup_routing(&params.routing)?;
        }

        let poller = tokio::spawn(poll_blocked_senders(bus.me.clone(), bus.shutdown.clone()));
        if let Ok(mut slot) = bus.poller.lock() {
            *slot = Some(poller);
        }
        debug!(connection = %bus.network.connection_spec(), "message bus started");
        Ok(bus)
    }

    pub fn network(&self) -> &Arc<dyn Network> {
        &self.network
    }

    pub fn resender(&self) -> Option<&Arc<Resender>> {
        self.resender.as_ref()
    }

    pub(crate) fn messenger(&self) -> &Messenger {
        &self.messenger
    }

    pub fn protocols(&self) -> &ProtocolRepository {
        &self.protocols
    }

    pub fn put_protocol(&self, protocol: Arc<dyn Protocol>) {
        self.protocols.put_protocol(protocol);
    }

    pub fn connection_spec(&self) -> String {
        self.network.connection_spec()
    }

    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    // -- Sessions ------------------------------------------------------------

    pub fn create_source_session(&self, params: SourceSessionParams) -> Result<Arc<SourceSession>, BusError> {
        let bus = self.live()?;
        Ok(SourceSession::new(bus, params))
    }

    pub fn create_intermediate_session(
        &self,
        name: &str,
        message_handler: Arc<dyn MessageHandler>,
        reply_handler: Arc<dyn ReplyHandler>,
    ) -> Result<Arc<IntermediateSession>, BusError> {
        let bus = self.live()?;
        let session = IntermediateSession::new(bus, name, message_handler, reply_handler);
        self.register_session(name, session.clone())?;
        Ok(session)
    }

    pub fn create_destination_session(
        &self,
        name: &str,
        message_handler: Arc<dyn MessageHandler>,
    ) -> Result<Arc<DestinationSession>, BusError> {
        let bus = self.live()?;
        let session = DestinationSession::new(bus, name, message_handler);
        self.register_session(name, session.clone())?;
        Ok(session)
    }

    fn register_session(&self, name: &str, handler: Arc<dyn MessageHandler>) -> Result<(), BusError> {
        match self.sessions.entry(name.to_string()) {
            Entry::Occupied(_) => return Err(BusError::DuplicateSession(name.to_string())),
            Entry::Vacant(slot) => {
                slot.insert(handler);
            }
        }
        self.network.register_session(name);
        debug!(session = %name, "session registered");
        Ok(())
    }

    /// Remove a named session. Inbound messages for it fail with
    /// `UNKNOWN_SESSION` from now on.
    pub fn unregister_session(&self, name: &str) {
        if self.sessions.remove(name).is_some() {
            self.network.unregister_session(name);
            debug!(session = %name, "session unregistered");
        }
    }

    pub fn has_session(&self, name: &str) -> bool {
        self.sessions.contains_key(name)
    }

    fn live(&self) -> Result<Arc<MessageBus>, BusError> {
        if self.is_destroyed() {
            return Err(BusError::Destroyed);
        }
        self.me.upgrade().ok_or(BusError::Destroyed)
    }

    // -- Routing -------------------------------------------------------------

    /// Replace every routing table at once.
    pub fn setup_routing(&self, spec: &RoutingSpec) -> Result<(), BusError> {
        let problems = spec.verify();
        if !problems.is_empty() {
            return Err(BusError::InvalidRouting(problems));
        }
        let tables: HashMap<String, Arc<RoutingTable>> = spec
            .tables
            .iter()
            .map(|t| (t.protocol.clone(), Arc::new(RoutingTable::from_spec(t))))
            .collect();
        for name in tables.keys() {
            if !self.protocols.has_protocol(name) {
                warn!(protocol = %name, "routing table for unregistered protocol");
            }
        }
        debug!(tables = tables.len(), "routing tables replaced");
        self.tables.store(Arc::new(tables));
        Ok(())
    }

    pub fn routing_table(&self, protocol: &str) -> Option<Arc<RoutingTable>> {
        self.tables.load().get(protocol).cloned()
    }

    /// Resolve where `msg` goes next.
    pub fn resolve(&self, msg: &Message) -> Result<Resolution, Error> {
        let protocol = msg.protocol();
        if !self.protocols.has_protocol(protocol) {
            return Err(Error::new(
                ErrorCode::UNKNOWN_PROTOCOL,
                format!("Protocol '{protocol}' is not supported."),
            ));
        }
        let tables = self.tables.load();
        let table = tables.get(protocol).map(Arc::as_ref);
        routing::resolve(table, msg, |name, param| {
            self.protocols.get_routing_policy(protocol, name, param)
        })
    }

    // -- Admission control ---------------------------------------------------

    pub fn set_max_pending_count(&self, count: u32) {
        self.max_pending_count.store(count, Ordering::Relaxed);
    }

    pub fn set_max_pending_size(&self, size: u64) {
        self.max_pending_size.store(size, Ordering::Relaxed);
    }

    pub fn pending_count(&self) -> u32 {
        self.pending.lock().map(|p| p.count).unwrap_or(0)
    }

    pub fn pending_size(&self) -> u64 {
        self.pending.lock().map(|p| p.size).unwrap_or(0)
    }

    fn check_pending(&self, size: u64) -> bool {
        let max_count = self.max_pending_count.load(Ordering::Relaxed);
        let max_size = self.max_pending_size.load(Ordering::Relaxed);
        let Ok(mut pending) = self.pending.lock() else {
            return false;
        };
        if (max_count > 0 && pending.count >= max_count) || (max_size > 0 && pending.size >= max_size) {
            return false;
        }
        pending.count += 1;
        pending.size += size;
        true
    }

    fn release_pending(&self, size: u64) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.count = pending.count.saturating_sub(1);
            pending.size = pending.size.saturating_sub(size);
        }
    }

    /// Answer `msg` with an error right away.
    fn deliver_error(&self, msg: Message, code: ErrorCode, text: String) {
        let mut reply = Reply::error_for(msg, code, text);
        let handler = reply.pop_handler();
        self.messenger.deliver_reply(handler, reply);
    }

    // -- Blocked senders -----------------------------------------------------

    /// Poll `sender` from the background loop until it reports nothing left.
    pub fn register_blocked_sender(&self, sender: &Arc<dyn BlockedSender>) {
        let weak = Arc::downgrade(sender);
        if let Ok(mut blocked) = self.blocked.lock() {
            if !blocked.iter().any(|b| Weak::ptr_eq(b, &weak)) {
                blocked.push(weak);
            }
        }
    }

    fn poll_blocked(&self) {
        let senders: Vec<Arc<dyn BlockedSender>> = match self.blocked.lock() {
            Ok(mut blocked) => std::mem::take(&mut *blocked)
                .iter()
                .filter_map(Weak::upgrade)
                .collect(),
            Err(_) => return,
        };
        let keep: Vec<Arc<dyn BlockedSender>> = senders.into_iter().filter(|s| s.try_send()).collect();
        for sender in &keep {
            self.register_blocked_sender(sender);
        }
    }

    // -- Lifecycle -----------------------------------------------------------

    /// Wait until the network and the delivery worker have caught up with
    /// everything handed to them before this call.
    ///
    /// Calling this from a message or reply handler never returns.
    pub async fn sync(&self) {
        self.messenger.sync().await;
        self.network.sync();
        self.messenger.sync().await;
    }

    /// Shut the bus down. Replies still queued for delivery are delivered;
    /// anything scheduled for retry is discarded.
    pub async fn destroy(&self) {
        if self.destroyed.swap(true, Ordering::AcqRel) {
            return;
        }
        debug!(connection = %self.network.connection_spec(), "destroying message bus");
        self.shutdown.cancel();
        let poller = self.poller.lock().ok().and_then(|mut p| p.take());
        if let Some(poller) = poller {
            let _ = poller.await;
        }
        self.protocols.clear_policy_cache();
        self.network.shutdown();
        self.messenger.destroy().await;
        if let Some(resender) = &self.resender {
            resender.destroy();
        }
        self.sessions.clear();
        if let Ok(mut blocked) = self.blocked.lock() {
            blocked.clear();
        }
    }
}

async fn poll_blocked_senders(bus: Weak<MessageBus>, shutdown: CancellationToken) {
    let mut interval = tokio::time::interval(BLOCKED_POLL_INTERVAL);
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            _ = interval.tick() => {}
        }
        let Some(bus) = bus.upgrade() else {
            break;
        };
        bus.poll_blocked();
    }
}

impl Drop for MessageBus {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Outbound: messages from source and intermediate sessions.
impl MessageHandler for MessageBus {
    fn handle_message(&self, mut msg: Message) {
        if self.resender.is_some() && msg.bucket_sequence().is_some() {
            return self.deliver_error(
                msg,
                ErrorCode::SEQUENCE_ERROR,
                "Bucket sequencing is not supported when resending is enabled.".to_string(),
            );
        }
        let Some(me) = self.me.upgrade() else {
            msg.discard();
            return;
        };
        SendProxy::new(me, msg).send();
    }
}

/// Reverses the admission accounting of an inbound message.
impl ReplyHandler for MessageBus {
    fn handle_reply(&self, mut reply: Reply) {
        if self.is_destroyed() {
            reply.discard();
            return;
        }
        let size = reply.context().as_value().unwrap_or(0);
        self.release_pending(size);
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }
}

impl NetworkOwner for MessageBus {
    fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>> {
        self.protocols.get_protocol(name)
    }

    fn deliver_message(&self, mut msg: Message, session: &str) {
        let Some(handler) = self.sessions.get(session).map(|h| h.value().clone()) else {
            return self.deliver_error(
                msg,
                ErrorCode::UNKNOWN_SESSION,
                format!("Session '{session}' does not exist."),
            );
        };
        let size = u64::from(msg.approx_size());
        if !self.check_pending(size) {
            return self.deliver_error(
                msg,
                ErrorCode::SESSION_BUSY,
                format!("Session '{session}' is busy, try again later."),
            );
        }
        let Some(me) = self.me.upgrade() else {
            msg.discard();
            return;
        };
        msg.set_context(Context::Value(size));
        msg.push_handler(me);
        self.messenger.deliver_message(handler, msg);
    }

    fn deliver_reply(&self, reply: Reply, handler: Arc<dyn ReplyHandler>) {
        self.messenger.deliver_reply(handler, reply);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
