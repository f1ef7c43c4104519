//! Replays pre-authored byte sequences, malformed HTTP included, to clients
//! under test, one test case per dispatch and in a reproducible order.

mod activity;
mod connection;
mod emitter;
mod errors;
mod launch;
mod sequencer;
mod server;
mod sniffer;
mod store;

pub mod config;

pub use activity::*;
pub use connection::ConnectionOutcome;
pub use emitter::*;
pub use errors::*;
pub use launch::launch;
pub use sequencer::*;
pub use server::*;
pub use sniffer::*;
pub use store::*;
