//! Client-side retry of messages whose replies carry transient errors.
//!
//! A [`SendProxy`] that gets a retryable reply parks itself here instead of
//! passing the reply on. The bus runs [`Resender::resend_scheduled`] as a
//! recurrent messenger task, which sends every proxy whose delay has passed.

use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use courier_types::config::RetryConfig;
use courier_types::{Error, ErrorCode, TraceLevel};
use tokio::time::Instant;
use tracing::debug;

use crate::messenger::Task;
use crate::proxy::SendProxy;
use crate::routable::{Message, Reply, Routable};

/// Upper bound on the back-off of [`RetryTransientErrorsPolicy`].
const MAX_RETRY_DELAY: Duration = Duration::from_secs(10);

/// Decides which failures are worth a resend, and when.
pub trait RetryPolicy: Send + Sync {
    fn can_retry(&self, code: ErrorCode) -> bool;

    /// Delay before attempt number `retry` (1 for the first resend).
    fn retry_delay(&self, retry: u32) -> Duration;
}

/// Retries transient errors with exponential back-off.
#[derive(Debug)]
pub struct RetryTransientErrorsPolicy {
    enabled: AtomicBool,
    base_delay: Duration,
}

impl RetryTransientErrorsPolicy {
    pub fn new(base_delay: Duration) -> Self {
        Self {
            enabled: AtomicBool::new(true),
            base_delay,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        let policy = Self::new(Duration::from_millis(config.base_delay_ms));
        policy.set_enabled(config.enabled);
        policy
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }
}

impl Default for RetryTransientErrorsPolicy {
    fn default() -> Self {
        Self::new(Duration::from_secs(1))
    }
}

impl RetryPolicy for RetryTransientErrorsPolicy {
    fn can_retry(&self, code: ErrorCode) -> bool {
        self.is_enabled() && code.is_transient()
    }

    fn retry_delay(&self, retry: u32) -> Duration {
        if retry == 0 {
            return Duration::ZERO;
        }
        let factor = 1u32.checked_shl(retry - 1).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

struct Entry {
    due: Instant,
    seq: u64,
    proxy: Arc<SendProxy>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.due == other.due && self.seq == other.seq
    }
}

impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        (self.due, self.seq).cmp(&(other.due, other.seq))
    }
}

pub struct Resender {
    policy: Arc<dyn RetryPolicy>,
    queue: Mutex<BinaryHeap<Reverse<Entry>>>,
    next_seq: AtomicU64,
}

impl Resender {
    pub fn new(policy: Arc<dyn RetryPolicy>) -> Self {
        Self {
            policy,
            queue: Mutex::new(BinaryHeap::new()),
            next_seq: AtomicU64::new(0),
        }
    }

    /// Whether `reply` to `msg` is worth another attempt: retries allowed,
    /// time left, and every error retryable.
    pub fn should_retry(&self, msg: &Message, reply: &Reply) -> bool {
        if !msg.retry_enabled() || !reply.has_errors() || msg.is_expired() {
            return false;
        }
        reply.errors().iter().all(|e| self.policy.can_retry(e.code))
    }

    /// Bump the attempt counter of `msg` and work out the delay. Returns
    /// `None`, with a `TIMEOUT` error added to `reply`, when the message
    /// would expire before the delay passes.
    pub fn prepare_retry(&self, msg: &mut Message, reply: &mut Reply) -> Option<Duration> {
        let retry = msg.retry() + 1;
        let delay = reply
            .retry_delay()
            .unwrap_or_else(|| self.policy.retry_delay(retry));
        if msg.time_remaining_now() <= delay {
            reply.add_error(Error::new(ErrorCode::TIMEOUT, "Timeout exceeded by resender, giving up."));
            return None;
        }
        msg.set_retry(retry);
        msg.trace_mut().trace(
            TraceLevel::COMPONENT,
            format!("Message scheduled for retry {retry} in {:.3} seconds.", delay.as_secs_f64()),
        );
        Some(delay)
    }

    pub fn schedule(&self, proxy: Arc<SendProxy>, delay: Duration) {
        let entry = Entry {
            due: Instant::now() + delay,
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            proxy,
        };
        if let Ok(mut queue) = self.queue.lock() {
            queue.push(Reverse(entry));
        }
    }

    pub fn num_scheduled(&self) -> usize {
        self.queue.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Resend every proxy that is due.
    pub fn resend_scheduled(&self) {
        let now = Instant::now();
        let due: Vec<Arc<SendProxy>> = {
            let Ok(mut queue) = self.queue.lock() else {
                return;
            };
            let mut due = Vec::new();
            while queue.peek().is_some_and(|Reverse(e)| e.due <= now) {
                if let Some(Reverse(entry)) = queue.pop() {
                    due.push(entry.proxy);
                }
            }
            due
        };
        for proxy in due {
            proxy.resend();
        }
    }

    /// Give up on everything scheduled; the messages are discarded.
    pub fn destroy(&self) {
        let drained: Vec<Reverse<Entry>> = match self.queue.lock() {
            Ok(mut queue) => queue.drain().collect(),
            Err(_) => return,
        };
        if !drained.is_empty() {
            debug!(count = drained.len(), "resender aborting scheduled retries");
        }
        for Reverse(entry) in drained {
            entry.proxy.abort();
        }
    }
}

/// Messenger task driving [`Resender::resend_scheduled`].
pub(crate) struct ResendTask(pub(crate) Arc<Resender>);

impl Task for ResendTask {
    fn run(&mut self) {
        self.0.resend_scheduled();
    }
}
