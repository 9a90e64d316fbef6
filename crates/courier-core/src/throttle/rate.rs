use std::sync::Arc;

use super::{StaticThrottlePolicy, ThrottlePolicy};
use crate::routable::{Message, Reply};
use crate::timer::Timer;

const DEFAULT_PERIOD_MILLIS: u64 = 1000;

/// Static limits plus a send budget refilled at the start of every period.
///
/// Unused budget does not carry over: entering a new period resets the
/// allotment, however many periods went by.
pub struct RateThrottlingPolicy {
    base: StaticThrottlePolicy,
    timer: Arc<dyn Timer>,
    desired_rate: f64,
    period_millis: u64,
    current_period: Option<u64>,
    allotted: f64,
}

impl RateThrottlingPolicy {
    /// `desired_rate` is in messages per second.
    pub fn new(desired_rate: f64, timer: Arc<dyn Timer>) -> Self {
        Self::with_period(desired_rate, timer, DEFAULT_PERIOD_MILLIS)
    }

    pub fn with_period(desired_rate: f64, timer: Arc<dyn Timer>, period_millis: u64) -> Self {
        Self {
            base: StaticThrottlePolicy::new(),
            timer,
            desired_rate,
            period_millis: period_millis.max(1),
            current_period: None,
            allotted: 0.0,
        }
    }

    pub fn set_max_pending_count(&mut self, count: u32) {
        self.base.set_max_pending_count(count);
    }

    pub fn set_max_pending_size(&mut self, size: u64) {
        self.base.set_max_pending_size(size);
    }

    pub fn desired_rate(&self) -> f64 {
        self.desired_rate
    }
}

impl ThrottlePolicy for RateThrottlingPolicy {
    fn can_send(&mut self, msg: &Message, pending: u32) -> bool {
        if !self.base.can_send(msg, pending) {
            return false;
        }
        let period = self.timer.millis() / self.period_millis;
        if self.current_period.is_none_or(|current| current < period) {
            self.allotted = self.desired_rate * self.period_millis as f64 / 1000.0;
            self.current_period = Some(period);
        }
        if self.allotted > 0.0 {
            self.allotted -= 1.0;
            return true;
        }
        false
    }

    fn process_message(&mut self, msg: &mut Message) {
        self.base.process_message(msg);
    }

    fn process_reply(&mut self, reply: &mut Reply) {
        self.base.process_reply(reply);
    }
}
