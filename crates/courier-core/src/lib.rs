//! The Courier message bus runtime.
//!
//! A process talks to the bus through sessions: a [`SourceSession`] sends
//! messages and receives their replies, an [`IntermediateSession`] relays
//! them, a [`DestinationSession`] answers them. Every accepted message gets
//! exactly one reply, delivered through the bus's single [`Messenger`]
//! worker so handlers never run concurrently with one another.
//!
//! Transport, payload encoding and routing policies plug in through the
//! [`Network`], [`Protocol`] and [`RoutingPolicy`] traits. [`LocalNetwork`]
//! and [`SimpleProtocol`] wire buses together inside one process.

pub mod bus;
pub mod config;
pub mod handler;
pub mod messenger;
pub mod network;
pub mod protocol;
pub mod proxy;
pub mod resender;
pub mod routable;
pub mod routing;
pub mod sequencer;
pub mod session;
pub mod simple;
pub mod throttle;
pub mod timer;

pub use bus::{BlockedSender, BusError, MessageBus, MessageBusParams};
pub use handler::{MessageHandler, ReplyHandler};
pub use messenger::{Messenger, Task};
pub use network::{LocalNetwork, LocalWire, Network, NetworkOwner};
pub use protocol::{CodecError, Protocol, ProtocolRepository, RoutingPolicy};
pub use proxy::SendProxy;
pub use resender::{Resender, RetryPolicy, RetryTransientErrorsPolicy};
pub use routable::{AnyRoutable, Body, CallStack, Context, Message, Reply, Routable};
pub use routing::{Resolution, RoutingTable};
pub use sequencer::Sequencer;
pub use session::{
    DestinationSession, IntermediateSession, SendRejected, SendResult, SourceSession, SourceSessionParams,
};
pub use simple::{SimpleMessage, SimpleProtocol, SimpleReply};
pub use throttle::{
    AllPassThrottlePolicy, DynamicThrottlePolicy, RateThrottlingPolicy, StaticThrottlePolicy, ThrottlePolicy,
};
pub use timer::{ManualTimer, SystemTimer, Timer};
