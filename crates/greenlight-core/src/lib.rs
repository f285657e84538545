//! Greenlight core - PTY session relay for Claude Code
//!
//! Hosts an interactive child program inside a pseudo-terminal while
//! mirroring the session to a remote relay over WebSocket, and brokers
//! permission decisions for tool-use events via a short-lived hook process.
//!
//! # Components
//! - `pty`: PTY transport (raw mode, winsize) and the relay fabric
//! - `ws`: reconnecting WebSocket client with a bounded text retry queue
//! - `bridge`: tails the local bridge file onto the WebSocket
//! - `stream`: detached transcript streamer (bridge or HTTP mode)
//! - `hook`: converts one hook event on stdin into one decision on stdout
//! - `enroll`: idempotent session enrollment against the relay

pub mod bridge;
pub mod enroll;
pub mod hook;
pub mod http;
pub mod pty;
pub mod sessions;
pub mod settings;
pub mod spawn;
pub mod stream;
pub mod tail;
pub mod ws;

#[cfg(test)]
pub(crate) mod testutil;

pub use settings::Settings;
