//! Session implementations.

pub mod loopback;

pub use loopback::{LoopbackConnector, LoopbackHub, LoopbackRoom, LoopbackSession};
