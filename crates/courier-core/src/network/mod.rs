//! The transport seam between message buses.
//!
//! A [`Network`] carries encoded messages to other buses and their replies
//! back. The bus that owns a network implements [`NetworkOwner`] so the
//! network can hand it inbound traffic.
//!
//! - `local` -- in-process transport wiring several buses together

pub mod local;

use std::sync::{Arc, Weak};
use std::time::Duration;

use courier_types::Route;

pub use local::{LocalNetwork, LocalWire};

use crate::handler::ReplyHandler;
use crate::protocol::Protocol;
use crate::routable::{Message, Reply};

/// What a network needs from the bus it serves.
pub trait NetworkOwner: Send + Sync {
    /// The protocol registered under `name`.
    fn protocol(&self, name: &str) -> Option<Arc<dyn Protocol>>;

    /// Hand an inbound message to the local session called `session`.
    fn deliver_message(&self, msg: Message, session: &str);

    /// Hand a reply to `handler` through the owner's delivery worker.
    fn deliver_reply(&self, reply: Reply, handler: Arc<dyn ReplyHandler>);
}

pub trait Network: Send + Sync {
    /// Bind this network to its owning bus. Called once, before any traffic.
    fn attach(&self, owner: Weak<dyn NetworkOwner>);

    /// Whether the network became able to send within `timeout`.
    fn wait_until_ready(&self, timeout: Duration) -> bool;

    fn register_session(&self, name: &str);

    fn unregister_session(&self, name: &str);

    /// Address other buses use to reach this one.
    fn connection_spec(&self) -> String;

    /// Send `msg` to `recipient`, which will continue along `route`. The
    /// reply, including any transport error, is handed to `handler` through
    /// the owner.
    fn send(&self, msg: &Message, route: &Route, recipient: &str, handler: Arc<dyn ReplyHandler>);

    /// Wait for the network's internal work to settle.
    fn sync(&self);

    /// Stop carrying traffic. Outstanding requests fail with
    /// `NETWORK_SHUTDOWN`.
    fn shutdown(&self);
}
