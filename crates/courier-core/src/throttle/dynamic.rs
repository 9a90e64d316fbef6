//! Adaptive window throttling.
//!
//! The window grows while measured throughput keeps rising and backs off once
//! more concurrency stops paying for itself. Throughput is sampled every
//! `resize_rate * window_size` sent messages as successful replies per
//! millisecond.
//!
//! The window is a float so the policy can tell 1.1 from 1.9: a fractional
//! window admits one extra message for a matching share of each resize
//! period (the `carry`).

use std::sync::Arc;

use courier_types::config::DynamicThrottleConfig;
use tracing::debug;

use super::{StaticThrottlePolicy, ThrottlePolicy};
use crate::routable::{Message, Reply};
use crate::timer::Timer;

/// Idle time after which the window is pulled back toward what is pending.
const IDLE_TIME_MILLIS: u64 = 60_000;

pub struct DynamicThrottlePolicy {
    base: StaticThrottlePolicy,
    timer: Arc<dyn Timer>,
    num_sent: u32,
    num_ok: u32,
    resize_rate: f64,
    resize_time: u64,
    time_of_last_message: u64,
    efficiency_threshold: f64,
    window_size_increment: f64,
    window_size: f64,
    min_window_size: f64,
    decrement_factor: f64,
    max_window_size: f64,
    window_size_backoff: f64,
    weight: f64,
    local_max_throughput: f64,
    max_throughput: f64,
}

impl DynamicThrottlePolicy {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        let now = timer.millis();
        Self {
            base: StaticThrottlePolicy::new(),
            timer,
            num_sent: 0,
            num_ok: 0,
            resize_rate: 3.0,
            resize_time: now,
            time_of_last_message: now,
            efficiency_threshold: 1.0,
            window_size_increment: 20.0,
            window_size: 20.0,
            min_window_size: 20.0,
            decrement_factor: 2.0,
            max_window_size: f64::from(i32::MAX),
            window_size_backoff: 0.9,
            weight: 1.0,
            local_max_throughput: 0.0,
            max_throughput: 0.0,
        }
    }

    pub fn from_config(config: &DynamicThrottleConfig, timer: Arc<dyn Timer>) -> Self {
        let mut policy = Self::new(timer);
        policy.set_window_size_increment(config.window_size_increment);
        policy.set_min_window_size(config.min_window_size);
        policy.set_max_window_size(config.max_window_size);
        policy.set_window_size_backoff(config.window_size_backoff);
        policy.set_window_size_decrement_factor(config.decrement_factor);
        policy.set_resize_rate(config.resize_rate);
        policy.set_efficiency_threshold(config.efficiency_threshold);
        policy.set_weight(config.weight);
        policy.set_max_throughput(config.max_throughput);
        if config.max_pending_count > 0 {
            policy.set_max_pending_count(config.max_pending_count);
        }
        policy
    }

    pub fn window_size(&self) -> f64 {
        self.window_size
    }

    pub fn min_window_size(&self) -> f64 {
        self.min_window_size
    }

    pub fn max_window_size(&self) -> f64 {
        self.max_window_size
    }

    /// Also caps the window at `count`.
    pub fn set_max_pending_count(&mut self, count: u32) {
        self.base.set_max_pending_count(count);
        self.max_window_size = f64::from(count);
    }

    pub fn set_max_pending_size(&mut self, size: u64) {
        self.base.set_max_pending_size(size);
    }

    pub fn set_window_size_increment(&mut self, increment: f64) {
        self.window_size_increment = increment;
        self.window_size = self.window_size.max(increment);
    }

    pub fn set_min_window_size(&mut self, size: f64) {
        self.min_window_size = size;
        self.window_size = self.window_size.max(size);
    }

    pub fn set_max_window_size(&mut self, size: f64) {
        self.max_window_size = size;
    }

    /// Clamped to `[0, 1]`.
    pub fn set_window_size_backoff(&mut self, backoff: f64) {
        self.window_size_backoff = backoff.clamp(0.0, 1.0);
    }

    pub fn set_window_size_decrement_factor(&mut self, factor: f64) {
        self.decrement_factor = factor;
    }

    /// At least 2.
    pub fn set_resize_rate(&mut self, rate: f64) {
        self.resize_rate = rate.max(2.0);
    }

    pub fn set_efficiency_threshold(&mut self, threshold: f64) {
        self.efficiency_threshold = threshold;
    }

    /// Stored as the square root, so competing policies settle at windows
    /// roughly proportional to their configured weights.
    pub fn set_weight(&mut self, weight: f64) {
        self.weight = weight.max(0.0).sqrt();
    }

    /// Messages per millisecond; 0 disables the cap.
    pub fn set_max_throughput(&mut self, throughput: f64) {
        self.max_throughput = throughput;
    }

    fn resize(&mut self) {
        let now = self.timer.millis();
        let elapsed = now.saturating_sub(self.resize_time).max(1) as f64;
        self.resize_time = now;

        let throughput = f64::from(self.num_ok) / elapsed;
        self.num_sent = 0;
        self.num_ok = 0;

        if self.max_throughput > 0.0 && throughput > self.max_throughput * 0.95 {
            // Close enough to the cap; hold.
        } else if throughput > 0.0 && throughput >= self.local_max_throughput {
            self.local_max_throughput = throughput;
            self.window_size += self.weight * self.window_size_increment;
            debug!(
                window = self.window_size,
                throughput, "new local max throughput, growing window"
            );
        } else {
            let efficiency = self.efficiency(throughput);
            if efficiency < self.efficiency_threshold {
                self.window_size = (self.window_size * self.window_size_backoff)
                    .min(self.window_size - self.decrement_factor * self.window_size_increment);
                self.local_max_throughput = 0.0;
                debug!(window = self.window_size, efficiency, "backing off window");
            } else {
                self.window_size += self.weight * self.window_size_increment;
                debug!(window = self.window_size, efficiency, "growing window");
            }
        }
        self.window_size = self.window_size.max(self.min_window_size).min(self.max_window_size);
    }

    /// Where on the throughput curve the current window sits: the
    /// throughput-to-window ratio scaled by a power of ten to land near 2.
    fn efficiency(&self, throughput: f64) -> f64 {
        let ratio = throughput / self.window_size;
        if !ratio.is_finite() || ratio <= 0.0 {
            return 0.0;
        }
        let mut period = 1.0;
        while ratio * period < 2.0 {
            period *= 10.0;
        }
        while ratio * period > 2.0 {
            period *= 0.1;
        }
        ratio * period
    }
}

impl ThrottlePolicy for DynamicThrottlePolicy {
    fn can_send(&mut self, msg: &Message, pending: u32) -> bool {
        if !self.base.can_send(msg, pending) {
            return false;
        }
        let now = self.timer.millis();
        if now.saturating_sub(self.time_of_last_message) > IDLE_TIME_MILLIS {
            self.window_size = self
                .min_window_size
                .max(self.window_size.min(f64::from(pending) + self.window_size_increment));
        }
        self.time_of_last_message = now;

        let floored = self.window_size.floor();
        let carry = f64::from(self.num_sent)
            < self.window_size * self.resize_rate * (self.window_size - floored);
        f64::from(pending) < floored + if carry { 1.0 } else { 0.0 }
    }

    fn process_message(&mut self, msg: &mut Message) {
        self.base.process_message(msg);
        self.num_sent += 1;
        if f64::from(self.num_sent) < self.window_size * self.resize_rate {
            return;
        }
        self.resize();
    }

    fn process_reply(&mut self, reply: &mut Reply) {
        self.base.process_reply(reply);
        if !reply.has_errors() {
            self.num_ok += 1;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routable::Routable;
    use crate::simple::SimpleMessage;
    use crate::timer::ManualTimer;
    use courier_types::{Error, ErrorCode};
    use proptest::prelude::*;

    fn policy(timer: &Arc<ManualTimer>) -> DynamicThrottlePolicy {
        let mut p = DynamicThrottlePolicy::new(timer.clone());
        p.set_window_size_increment(5.0);
        p.set_min_window_size(5.0);
        p.set_max_window_size(200.0);
        p
    }

    /// Send until the window is full, then reply to everything with the given
    /// per-batch latency. Returns the number of messages sent.
    fn round(p: &mut DynamicThrottlePolicy, timer: &ManualTimer, latency_ms: u64, ok: bool) -> u32 {
        let mut replies = Vec::new();
        let mut pending = 0;
        loop {
            let mut msg = Message::new(SimpleMessage::new("x"));
            if !p.can_send(&msg, pending) {
                break;
            }
            p.process_message(&mut msg);
            let mut reply = Reply::empty();
            reply.set_context(msg.take_context());
            if !ok {
                reply.add_error(Error::new(ErrorCode::SESSION_BUSY, "busy"));
            }
            replies.push(reply);
            pending += 1;
        }
        timer.advance(latency_ms);
        for mut reply in replies {
            p.process_reply(&mut reply);
        }
        pending
    }

    #[test]
    fn starts_at_increment_and_admits_window() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = policy(&timer);
        assert!((p.window_size() - 5.0).abs() < f64::EPSILON);
        let msg = Message::new(SimpleMessage::new("x"));
        assert!(p.can_send(&msg, 4));
        assert!(!p.can_send(&msg, 5));
    }

    #[test]
    fn grows_while_throughput_rises() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = policy(&timer);
        let start = p.window_size();
        // Constant latency: a bigger window yields more throughput.
        for _ in 0..20 {
            round(&mut p, &timer, 10, true);
        }
        assert!(p.window_size() > start);
    }

    #[test]
    fn failures_drive_window_to_minimum() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = policy(&timer);
        for _ in 0..20 {
            round(&mut p, &timer, 10, true);
        }
        for _ in 0..50 {
            round(&mut p, &timer, 10, false);
        }
        assert!((p.window_size() - p.min_window_size()).abs() < f64::EPSILON);
    }

    #[test]
    fn idle_resets_window_toward_pending() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = policy(&timer);
        for _ in 0..20 {
            round(&mut p, &timer, 10, true);
        }
        assert!(p.window_size() > 10.0);

        timer.advance(IDLE_TIME_MILLIS + 1);
        let msg = Message::new(SimpleMessage::new("x"));
        p.can_send(&msg, 0);
        assert!((p.window_size() - 5.0).abs() < f64::EPSILON);
    }

    #[test]
    fn max_pending_count_caps_window() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = policy(&timer);
        p.set_max_pending_count(8);
        for _ in 0..50 {
            round(&mut p, &timer, 10, true);
        }
        assert!(p.window_size() <= 8.0);
        let msg = Message::new(SimpleMessage::new("x"));
        assert!(!p.can_send(&msg, 8));
    }

    #[test]
    fn setters_clamp() {
        let timer = Arc::new(ManualTimer::new(0));
        let mut p = DynamicThrottlePolicy::new(timer);
        p.set_window_size_backoff(1.5);
        assert!((p.window_size_backoff - 1.0).abs() < f64::EPSILON);
        p.set_resize_rate(0.5);
        assert!((p.resize_rate - 2.0).abs() < f64::EPSILON);
        p.set_weight(4.0);
        assert!((p.weight - 2.0).abs() < f64::EPSILON);
    }

    proptest! {
        #[test]
        fn window_stays_within_bounds(
            rounds in proptest::collection::vec((1u64..500, any::<bool>()), 1..60),
        ) {
            let timer = Arc::new(ManualTimer::new(0));
            let mut p = policy(&timer);
            for (latency, ok) in rounds {
                round(&mut p, &timer, latency, ok);
                prop_assert!(p.window_size() >= p.min_window_size());
                prop_assert!(p.window_size() <= p.max_window_size());
            }
        }
    }
}
