//! Logging and trace export setup for Courier binaries.
//!
//! Library crates only emit `tracing` events; installing a subscriber is
//! left to the process, through [`tracing_setup::init_tracing`].

pub mod tracing_setup;
