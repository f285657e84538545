//! Relay WebSocket Transport
//!
//! A single logical connection to the relay server with automatic
//! reconnect. Two outbound paths with different durability semantics:
//! binary frames (raw PTY output) are lossy by design and dropped while
//! disconnected; text frames (transcript lines) go through a bounded FIFO
//! retry queue that drains on reconnect.

mod client;

pub use client::{InjectFn, WsClient, WsClientOptions, WsMode};
