//! PTY Module - pseudo-terminal transport and relay fabric
//!
//! # Components
//! - `transport`: PTY pair allocation, window size, raw-mode switching
//! - `relay`: child process lifecycle and the I/O tasks around the master

mod relay;
mod transport;

pub use relay::{BridgeHandle, PtyWriter, Relay, RelayOptions};
pub use transport::{
    get_winsize, open_pty, restore_termios, set_raw, set_winsize, PtyPair, RawModeGuard,
};
