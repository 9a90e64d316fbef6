//! A send in progress.

use std::time::Duration;

use courier_types::Route;
use tokio::time::Instant;

use super::{Body, Routable, RoutableState};

/// A message on its way to a destination.
///
/// Deadline accounting: `time_remaining` is the budget the message had when
/// it was received (or sent) at `time_received`. [`Message::time_remaining_now`]
/// subtracts the time elapsed since, so it never under-estimates.
#[derive(Debug)]
pub struct Message {
    state: RoutableState,
    body: Box<dyn Body>,
    route: Route,
    time_received: Option<Instant>,
    time_remaining: Duration,
    retry_enabled: bool,
    retry: u32,
    sequence_id: Option<u64>,
    bucket_sequence: Option<u64>,
    approx_size: u32,
}

impl Message {
    pub fn new(body: impl Body) -> Self {
        Self::from_boxed(Box::new(body))
    }

    pub fn from_boxed(body: Box<dyn Body>) -> Self {
        let approx_size = body.approx_size();
        Self {
            state: RoutableState::default(),
            body,
            route: Route::new(),
            time_received: None,
            time_remaining: Duration::ZERO,
            retry_enabled: true,
            retry: 0,
            sequence_id: None,
            bucket_sequence: None,
            approx_size,
        }
    }

    pub fn with_route(mut self, route: Route) -> Self {
        self.route = route;
        self
    }

    pub fn with_sequence_id(mut self, id: u64) -> Self {
        self.sequence_id = Some(id);
        self
    }

    pub fn with_time_remaining(mut self, remaining: Duration) -> Self {
        self.time_remaining = remaining;
        self
    }

    pub fn body(&self) -> &dyn Body {
        self.body.as_ref()
    }

    pub fn into_body(self) -> Box<dyn Body> {
        self.body
    }

    pub fn protocol(&self) -> &str {
        self.body.protocol()
    }

    pub fn kind(&self) -> u32 {
        self.body.kind()
    }

    pub fn route(&self) -> &Route {
        &self.route
    }

    pub fn route_mut(&mut self) -> &mut Route {
        &mut self.route
    }

    pub fn set_route(&mut self, route: Route) {
        self.route = route;
    }

    pub fn time_received(&self) -> Option<Instant> {
        self.time_received
    }

    pub fn set_time_received(&mut self, at: Instant) {
        self.time_received = Some(at);
    }

    pub fn set_time_received_now(&mut self) {
        self.time_received = Some(Instant::now());
    }

    /// The budget as of `time_received`; zero means unset.
    pub fn time_remaining(&self) -> Duration {
        self.time_remaining
    }

    pub fn set_time_remaining(&mut self, remaining: Duration) {
        self.time_remaining = remaining;
    }

    /// The budget left right now.
    pub fn time_remaining_now(&self) -> Duration {
        match self.time_received {
            Some(received) => self.time_remaining.saturating_sub(received.elapsed()),
            None => self.time_remaining,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.time_remaining_now().is_zero()
    }

    /// The instant the message expires, once it has been received.
    pub fn deadline(&self) -> Option<Instant> {
        self.time_received.map(|received| received + self.time_remaining)
    }

    pub fn retry_enabled(&self) -> bool {
        self.retry_enabled
    }

    pub fn set_retry_enabled(&mut self, enabled: bool) {
        self.retry_enabled = enabled;
    }

    /// Number of resend attempts made so far.
    pub fn retry(&self) -> u32 {
        self.retry
    }

    pub fn set_retry(&mut self, retry: u32) {
        self.retry = retry;
    }

    /// Messages sharing a sequence id are delivered one at a time, in order.
    pub fn sequence_id(&self) -> Option<u64> {
        self.sequence_id
    }

    pub fn set_sequence_id(&mut self, id: Option<u64>) {
        self.sequence_id = id;
    }

    /// Bucket ordering key, honored by the receiving side.
    pub fn bucket_sequence(&self) -> Option<u64> {
        self.bucket_sequence
    }

    pub fn set_bucket_sequence(&mut self, bucket: Option<u64>) {
        self.bucket_sequence = bucket;
    }

    pub fn approx_size(&self) -> u32 {
        self.approx_size
    }

    pub fn set_approx_size(&mut self, size: u32) {
        self.approx_size = size;
    }

    /// Exchange tracking state, route, timing and retry fields with
    /// `other`. Bodies stay where they are.
    pub fn swap_state(&mut self, other: &mut Message) {
        self.state.swap(&mut other.state);
        std::mem::swap(&mut self.route, &mut other.route);
        std::mem::swap(&mut self.time_received, &mut other.time_received);
        std::mem::swap(&mut self.time_remaining, &mut other.time_remaining);
        std::mem::swap(&mut self.retry_enabled, &mut other.retry_enabled);
        std::mem::swap(&mut self.retry, &mut other.retry);
    }
}

impl Routable for Message {
    fn state(&self) -> &RoutableState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RoutableState {
        &mut self.state
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routable::Context;
    use crate::simple::SimpleMessage;

    #[test]
    fn defaults() {
        let msg = Message::new(SimpleMessage::new("x"));
        assert_eq!(msg.approx_size(), 1);
        assert!(msg.retry_enabled());
        assert_eq!(msg.retry(), 0);
        assert!(msg.route().is_empty());
        assert_eq!(msg.protocol(), "Simple");
        assert!(msg.deadline().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn time_remaining_counts_down() {
        let mut msg = Message::new(SimpleMessage::new("x"));
        msg.set_time_remaining(Duration::from_millis(100));
        msg.set_time_received_now();
        assert!(!msg.is_expired());

        tokio::time::advance(Duration::from_millis(60)).await;
        assert_eq!(msg.time_remaining_now(), Duration::from_millis(40));

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(msg.is_expired());
        assert_eq!(msg.time_remaining_now(), Duration::ZERO);
    }

    #[test]
    fn swap_state_leaves_bodies() {
        let mut a = Message::new(SimpleMessage::new("a"))
            .with_route(Route::parse("dst/session").unwrap());
        a.set_retry(3);
        a.set_context(Context::Value(9));
        let mut b = Message::new(SimpleMessage::new("b"));

        a.swap_state(&mut b);
        assert!(a.route().is_empty());
        assert_eq!(b.route().to_string(), "dst/session");
        assert_eq!(b.retry(), 3);
        assert_eq!(b.context().as_value(), Some(9));
        assert_eq!(
            a.body().downcast_ref::<SimpleMessage>().unwrap().value(),
            "a"
        );
    }

    #[test]
    fn discard_clears_tracking_state() {
        let mut msg = Message::new(SimpleMessage::new("x"));
        msg.trace_mut().set_level(9);
        msg.trace_mut().trace(1, "note");
        msg.push_handler(std::sync::Arc::new(|_r: crate::routable::Reply| {}));
        msg.set_context(Context::Value(4));
        msg.discard();
        assert!(msg.call_stack().is_empty());
        assert!(msg.trace().is_empty());
        assert!(msg.context().is_empty());
    }
}
