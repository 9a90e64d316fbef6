//! Admission control for source sessions.
//!
//! A source session consults its [`ThrottlePolicy`] under its own lock
//! before accepting a send. Policies never block or do I/O; they only
//! observe the three calls below.
//!
//! - [`AllPassThrottlePolicy`] -- admits everything
//! - [`StaticThrottlePolicy`] -- fixed pending count / size limits
//! - [`DynamicThrottlePolicy`] -- adaptive window tuned by measured throughput
//! - [`RateThrottlingPolicy`] -- per-second token budget on top of static limits

pub mod dynamic;
pub mod rate;
pub mod static_policy;

use std::sync::Arc;

use courier_types::config::ThrottleConfig;

pub use dynamic::DynamicThrottlePolicy;
pub use rate::RateThrottlingPolicy;
pub use static_policy::StaticThrottlePolicy;

use crate::routable::{Message, Reply};
use crate::timer::{SystemTimer, Timer};

/// Admission-control strategy owned by exactly one source session.
pub trait ThrottlePolicy: Send {
    /// Whether `msg` may be sent now, given `pending` unreplied messages.
    fn can_send(&mut self, msg: &Message, pending: u32) -> bool;

    /// Called once for every accepted message, before it leaves the session.
    fn process_message(&mut self, msg: &mut Message);

    /// Called once for every reply to an accepted message.
    fn process_reply(&mut self, reply: &mut Reply);
}

/// Admits every message.
#[derive(Debug, Default, Clone, Copy)]
pub struct AllPassThrottlePolicy;

impl ThrottlePolicy for AllPassThrottlePolicy {
    fn can_send(&mut self, _msg: &Message, _pending: u32) -> bool {
        true
    }

    fn process_message(&mut self, _msg: &mut Message) {}

    fn process_reply(&mut self, _reply: &mut Reply) {}
}

/// Build the policy a configuration names, reading time from the system clock.
pub fn throttle_policy_from_config(config: &ThrottleConfig) -> Box<dyn ThrottlePolicy> {
    throttle_policy_with_timer(config, Arc::new(SystemTimer))
}

/// Build the policy a configuration names, reading time from `timer`.
pub fn throttle_policy_with_timer(config: &ThrottleConfig, timer: Arc<dyn Timer>) -> Box<dyn ThrottlePolicy> {
    match config {
        ThrottleConfig::AllPass => Box::new(AllPassThrottlePolicy),
        ThrottleConfig::Static {
            max_pending_count,
            max_pending_size,
        } => Box::new(
            StaticThrottlePolicy::new()
                .with_max_pending_count(*max_pending_count)
                .with_max_pending_size(*max_pending_size),
        ),
        ThrottleConfig::Dynamic(knobs) => Box::new(DynamicThrottlePolicy::from_config(knobs, timer)),
        ThrottleConfig::Rate {
            desired_rate,
            max_pending_count,
        } => {
            let mut policy = RateThrottlingPolicy::new(*desired_rate, timer);
            policy.set_max_pending_count(*max_pending_count);
            Box::new(policy)
        }
    }
}
