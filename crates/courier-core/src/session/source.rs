//! Originating side of the bus.
//!
//! A source session admits messages through its throttle policy, orders them
//! through a [`Sequencer`], and hands them to the bus. Every accepted message
//! yields exactly one reply to the session's reply handler.
//!
//! Sends refused for lack of room can instead wait in the session
//! ([`SourceSession::send_blocking`]). Waiting messages are drained by
//! whoever gets the drain token first: a reply coming back, or the bus's
//! blocked-sender poller.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use courier_types::config::{SourceConfig, ThrottleConfig};
use courier_types::{Error, ErrorCode, Route};
use tokio::sync::{Notify, oneshot};
use tokio::time::Instant;
use tracing::debug;

use super::{SendRejected, SendResult};
use crate::bus::{BlockedSender, MessageBus};
use crate::handler::{MessageHandler, ReplyHandler};
use crate::routable::{Message, Reply, Routable};
use crate::sequencer::Sequencer;
use crate::throttle::{ThrottlePolicy, throttle_policy_from_config};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(180);

pub struct SourceSessionParams {
    reply_handler: Arc<dyn ReplyHandler>,
    throttle: Box<dyn ThrottlePolicy>,
    timeout: Duration,
}

impl SourceSessionParams {
    /// Defaults: dynamic throttling and a 180 second message timeout.
    pub fn new(reply_handler: Arc<dyn ReplyHandler>) -> Self {
        Self {
            reply_handler,
            throttle: throttle_policy_from_config(&ThrottleConfig::default()),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn from_config(config: &SourceConfig, reply_handler: Arc<dyn ReplyHandler>) -> Self {
        Self {
            reply_handler,
            throttle: throttle_policy_from_config(&config.throttle),
            timeout: Duration::from_millis(config.timeout_ms),
        }
    }

    pub fn with_throttle_policy(mut self, policy: Box<dyn ThrottlePolicy>) -> Self {
        self.throttle = policy;
        self
    }

    /// Timeout given to messages sent without one.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

struct BlockedMessage {
    id: u64,
    msg: Message,
    done: oneshot::Sender<SendResult>,
}

struct State {
    closed: bool,
    pending: u32,
    throttle: Box<dyn ThrottlePolicy>,
    blocked: VecDeque<BlockedMessage>,
}

pub struct SourceSession {
    me: Weak<SourceSession>,
    bus: Arc<MessageBus>,
    sequencer: Arc<Sequencer>,
    reply_handler: Arc<dyn ReplyHandler>,
    timeout: Duration,
    state: Mutex<State>,
    /// Held by whoever is draining the blocked queue.
    draining: AtomicBool,
    /// Signalled when a closing session has no pending messages left.
    drained: Notify,
    next_blocked_id: AtomicU64,
}

impl SourceSession {
    pub(crate) fn new(bus: Arc<MessageBus>, params: SourceSessionParams) -> Arc<Self> {
        let sender: Arc<dyn MessageHandler> = bus.clone();
        let sequencer = Sequencer::new(sender);
        let session = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            bus,
            sequencer,
            reply_handler: params.reply_handler,
            timeout: params.timeout,
            state: Mutex::new(State {
                closed: false,
                pending: 0,
                throttle: params.throttle,
                blocked: VecDeque::new(),
            }),
            draining: AtomicBool::new(false),
            drained: Notify::new(),
            next_blocked_id: AtomicU64::new(0),
        });
        debug!(timeout = ?session.timeout, "source session opened");
        session
    }

    /// Send `msg`, or refuse it right away.
    ///
    /// A refused message is handed back inside the error unless the refusal
    /// consumed it.
    pub fn send(&self, mut msg: Message) -> SendResult {
        self.stamp(&mut msg);
        self.send_internal(msg)
    }

    /// Send `msg` along `route`, given in route text form.
    pub fn send_to(&self, mut msg: Message, route: &str) -> SendResult {
        match Route::parse(route) {
            Ok(route) => {
                msg.set_route(route);
                self.send(msg)
            }
            Err(e) => Err(SendRejected::new(
                Error::new(ErrorCode::ILLEGAL_ROUTE, e.to_string()),
                Some(msg),
            )),
        }
    }

    /// Send `msg`, waiting for room if the throttle policy refuses it.
    ///
    /// If the message expires while waiting, a `TIMEOUT` reply carrying the
    /// message goes to the reply handler and the call fails with `TIMEOUT`.
    pub async fn send_blocking(&self, mut msg: Message) -> SendResult {
        self.stamp(&mut msg);
        let deadline = msg.deadline().unwrap_or_else(|| Instant::now() + self.timeout);
        let rejected = match self.send_internal(msg) {
            Ok(()) => return Ok(()),
            Err(rejected) => rejected,
        };
        if rejected.code() != ErrorCode::SEND_QUEUE_FULL {
            return Err(rejected);
        }
        let (error, msg) = rejected.into_parts();
        let Some(msg) = msg else {
            return Err(SendRejected::new(error, None));
        };

        let id = self.next_blocked_id.fetch_add(1, Ordering::Relaxed);
        let (done_tx, mut done_rx) = oneshot::channel();
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(Self::closed_rejection(msg));
            };
            if state.closed {
                return Err(Self::closed_rejection(msg));
            }
            state.blocked.push_back(BlockedMessage {
                id,
                msg,
                done: done_tx,
            });
        }
        if let Some(me) = self.me.upgrade() {
            let sender: Arc<dyn BlockedSender> = me;
            self.bus.register_blocked_sender(&sender);
        }
        // A reply may have freed room before the message was queued.
        self.send_blocked_messages();

        tokio::select! {
            result = &mut done_rx => return result.unwrap_or_else(|_| Err(Self::abandoned())),
            _ = tokio::time::sleep_until(deadline) => {}
        }

        let expired = self.state.lock().ok().and_then(|mut state| {
            let index = state.blocked.iter().position(|b| b.id == id)?;
            state.blocked.remove(index)
        });
        match expired {
            Some(blocked) => Err(self.expire(blocked.msg)),
            // Someone is sending it right now; their verdict stands.
            None => done_rx.await.unwrap_or_else(|_| Err(Self::abandoned())),
        }
    }

    /// Stop accepting messages and wait for every pending reply.
    ///
    /// Messages still waiting in `send_blocking` are refused with
    /// `SEND_QUEUE_CLOSED`. Calling this from the session's reply handler
    /// never returns.
    pub async fn close(&self) {
        let blocked = match self.state.lock() {
            Ok(mut state) => {
                state.closed = true;
                std::mem::take(&mut state.blocked)
            }
            Err(_) => VecDeque::new(),
        };
        for BlockedMessage { msg, done, .. } in blocked {
            let _ = done.send(Err(Self::closed_rejection(msg)));
        }

        loop {
            let notified = self.drained.notified();
            let pending = self.pending_count();
            if pending == 0 {
                break;
            }
            debug!(pending, "source session waiting for replies before closing");
            notified.await;
        }
        self.sequencer.destroy();
        debug!("source session closed");
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().map(|s| s.closed).unwrap_or(true)
    }

    /// Messages accepted and not yet replied to.
    pub fn pending_count(&self) -> u32 {
        self.state.lock().map(|s| s.pending).unwrap_or(0)
    }

    /// Messages waiting in `send_blocking` for room.
    pub fn num_blocked(&self) -> usize {
        self.state.lock().map(|s| s.blocked.len()).unwrap_or(0)
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn stamp(&self, msg: &mut Message) {
        if msg.time_remaining().is_zero() {
            msg.set_time_remaining(self.timeout);
        }
        msg.set_time_received_now();
    }

    fn send_internal(&self, mut msg: Message) -> SendResult {
        let Some(me) = self.me.upgrade() else {
            return Err(Self::closed_rejection(msg));
        };
        {
            let Ok(mut state) = self.state.lock() else {
                return Err(Self::closed_rejection(msg));
            };
            if state.closed {
                return Err(Self::closed_rejection(msg));
            }
            let pending = state.pending;
            if !state.throttle.can_send(&msg, pending) {
                return Err(SendRejected::new(
                    Error::new(
                        ErrorCode::SEND_QUEUE_FULL,
                        format!("Too much pending data ({pending} messages)."),
                    ),
                    Some(msg),
                ));
            }
            msg.push_handler(self.reply_handler.clone());
            state.throttle.process_message(&mut msg);
            msg.push_handler(me);
            state.pending += 1;
        }
        self.sequencer.handle_message(msg);
        Ok(())
    }

    /// Send waiting messages until one is refused or none are left. Returns
    /// whether any are still waiting.
    fn send_blocked_messages(&self) -> bool {
        if self.draining.swap(true, Ordering::AcqRel) {
            return true;
        }
        loop {
            let next = self.state.lock().ok().and_then(|mut s| s.blocked.pop_front());
            let Some(BlockedMessage { id, msg, done }) = next else {
                break;
            };
            if msg.is_expired() {
                let _ = done.send(Err(self.expire(msg)));
                continue;
            }
            match self.send_internal(msg) {
                Ok(()) => {
                    let _ = done.send(Ok(()));
                }
                Err(rejected) if rejected.code() == ErrorCode::SEND_QUEUE_FULL => {
                    match rejected.into_parts() {
                        (_, Some(msg)) => {
                            if let Ok(mut state) = self.state.lock() {
                                state.blocked.push_front(BlockedMessage { id, msg, done });
                            }
                        }
                        (error, None) => {
                            let _ = done.send(Err(SendRejected::new(error, None)));
                        }
                    }
                    break;
                }
                Err(rejected) => {
                    let _ = done.send(Err(rejected));
                }
            }
        }
        self.draining.store(false, Ordering::Release);
        self.num_blocked() > 0
    }

    /// Give up on a waiting message: its reply handler gets a `TIMEOUT` reply.
    fn expire(&self, msg: Message) -> SendRejected {
        let error = Error::new(ErrorCode::TIMEOUT, "Timed out waiting for room in the send queue.");
        let mut reply = Reply::empty();
        reply.add_error(error.clone());
        reply.set_message(msg);
        self.bus.messenger().deliver_reply(self.reply_handler.clone(), reply);
        SendRejected::new(error, None)
    }

    fn closed_rejection(msg: Message) -> SendRejected {
        SendRejected::new(
            Error::new(ErrorCode::SEND_QUEUE_CLOSED, "Source session is closed."),
            Some(msg),
        )
    }

    fn abandoned() -> SendRejected {
        SendRejected::new(
            Error::new(ErrorCode::SEND_ABORTED, "Blocked send was abandoned."),
            None,
        )
    }
}

impl ReplyHandler for SourceSession {
    fn handle_reply(&self, mut reply: Reply) {
        let drained = match self.state.lock() {
            Ok(mut state) => {
                state.pending = state.pending.saturating_sub(1);
                state.throttle.process_reply(&mut reply);
                state.closed && state.pending == 0
            }
            Err(_) => false,
        };
        self.send_blocked_messages();
        if drained {
            self.drained.notify_waiters();
        }
        let handler = reply.pop_handler();
        handler.handle_reply(reply);
    }
}

impl BlockedSender for SourceSession {
    fn try_send(&self) -> bool {
        self.send_blocked_messages()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
