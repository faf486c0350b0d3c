//! Shared wire protocol for `signalroom`: JSON signaling messages exchanged
//! between the relay server and its clients.

pub mod codec;
pub mod signal;

pub use signal::{Signal, SignalKind};
