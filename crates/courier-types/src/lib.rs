//! Shared domain types for the Courier message bus.
//!
//! This crate holds the data that travels with routables or configures the
//! bus: error codes, diagnostic traces, routes, routing specs, and the bus
//! configuration file model.
//!
//! Zero infrastructure dependencies -- only serde and thiserror.

pub mod config;
pub mod error;
pub mod route;
pub mod routing_spec;
pub mod trace;

pub use error::{Error, ErrorCode};
pub use route::{Hop, HopDirective, Route, RouteParseError};
pub use routing_spec::{HopSpec, RouteSpec, RoutingSpec, RoutingTableSpec};
pub use trace::{Trace, TraceDecodeError, TraceLevel, TraceNode};
