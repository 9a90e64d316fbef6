use crate::routable::{Context, Message, Reply, Routable};

use super::ThrottlePolicy;

/// Fixed limits on the number and total size of pending messages.
///
/// A limit of 0 disables that check. The size of every accepted message is
/// stashed in its context so the matching reply can give it back.
#[derive(Debug, Default, Clone)]
pub struct StaticThrottlePolicy {
    max_pending_count: u32,
    max_pending_size: u64,
    pending_size: u64,
}

impl StaticThrottlePolicy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pending_count(mut self, count: u32) -> Self {
        self.max_pending_count = count;
        self
    }

    pub fn with_max_pending_size(mut self, size: u64) -> Self {
        self.max_pending_size = size;
        self
    }

    pub fn max_pending_count(&self) -> u32 {
        self.max_pending_count
    }

    pub fn set_max_pending_count(&mut self, count: u32) {
        self.max_pending_count = count;
    }

    pub fn max_pending_size(&self) -> u64 {
        self.max_pending_size
    }

    pub fn set_max_pending_size(&mut self, size: u64) {
        self.max_pending_size = size;
    }

    /// Total approximate size of the messages still awaiting replies.
    pub fn pending_size(&self) -> u64 {
        self.pending_size
    }
}

impl ThrottlePolicy for StaticThrottlePolicy {
    fn can_send(&mut self, _msg: &Message, pending: u32) -> bool {
        if self.max_pending_count > 0 && pending >= self.max_pending_count {
            return false;
        }
        if self.max_pending_size > 0 && self.pending_size >= self.max_pending_size {
            return false;
        }
        true
    }

    fn process_message(&mut self, msg: &mut Message) {
        let size = u64::from(msg.approx_size());
        msg.set_context(Context::Value(size));
        self.pending_size += size;
    }

    fn process_reply(&mut self, reply: &mut Reply) {
        let size = reply.context().as_value().unwrap_or(0);
        self.pending_size = self.pending_size.saturating_sub(size);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::simple::SimpleMessage;

    /// Drive one accepted send through the policy, the way a source session does.
    fn accept(policy: &mut StaticThrottlePolicy, msg: &mut Message) -> Reply {
        policy.process_message(msg);
        let mut reply = Reply::empty();
        reply.set_context(msg.take_context());
        reply
    }

    #[test]
    fn count_limit_blocks_then_releases() {
        let mut policy = StaticThrottlePolicy::new().with_max_pending_count(3);
        let mut pending = 0;
        let mut replies = Vec::new();
        for _ in 0..3 {
            let mut msg = Message::new(SimpleMessage::new("x"));
            assert!(policy.can_send(&msg, pending));
            replies.push(accept(&mut policy, &mut msg));
            pending += 1;
        }
        let probe = Message::new(SimpleMessage::new("x"));
        assert!(!policy.can_send(&probe, pending));

        let mut reply = replies.pop().unwrap();
        policy.process_reply(&mut reply);
        pending -= 1;
        assert!(policy.can_send(&probe, pending));
    }

    #[test]
    fn size_limit_tracks_stashed_sizes() {
        let mut policy = StaticThrottlePolicy::new().with_max_pending_size(10);
        let mut msg = Message::new(SimpleMessage::new("x"));
        msg.set_approx_size(10);
        let mut reply = accept(&mut policy, &mut msg);
        assert_eq!(policy.pending_size(), 10);
        assert!(!policy.can_send(&msg, 1));

        policy.process_reply(&mut reply);
        assert_eq!(policy.pending_size(), 0);
        assert!(policy.can_send(&msg, 0));
    }

    #[test]
    fn zero_limits_are_unlimited() {
        let mut policy = StaticThrottlePolicy::new();
        let msg = Message::new(SimpleMessage::new("x"));
        assert!(policy.can_send(&msg, 1_000_000));
    }

    #[test]
    fn reply_without_context_is_harmless() {
        let mut policy = StaticThrottlePolicy::new();
        let mut reply = Reply::empty();
        policy.process_reply(&mut reply);
        assert_eq!(policy.pending_size(), 0);
    }
}
