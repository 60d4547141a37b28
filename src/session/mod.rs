mod client;
mod frame;
mod server;

pub use client::{send_frame, spawn_send};
pub use frame::Frame;
pub use server::{status_listener, ControlServer};

use std::net::Ipv4Addr;
use std::time::Duration;
use std::{error, fmt};

use tokio::sync::mpsc;

/// Default TCP port peer daemons exchange control frames on
pub const CONTROL_PORT: u16 = 3912;
/// Default TCP port answering liveness probes
pub const STATUS_PORT: u16 = 51819;
/// A control frame is a single short ASCII line
pub const MAX_FRAME_LEN: usize = 1024;
/// Deadline for one outbound advertisement (connect, write, drain)
pub const SEND_TIMEOUT: Duration = Duration::from_secs(45);

/// Work handed from connection handlers to the reconciliation loop.
/// The channel serializes concurrent handlers into a single consumer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    /// A remote claimed a client; `host` is the claimant's source address
    AddRoute {
        ip: Ipv4Addr,
        age: u64,
        host: Ipv4Addr,
    },
}

pub type CommandTx = mpsc::UnboundedSender<Command>;
pub type CommandRx = mpsc::UnboundedReceiver<Command>;

#[derive(Debug)]
pub enum FrameError {
    /// Frame bytes were not valid UTF-8
    Encoding,
    /// Recognized command carrying a malformed field [field, value]
    Field(&'static str, String),
    /// First token is not a known command
    UnknownCommand(String),
    /// Recognized command with fields missing
    Truncated,
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use FrameError::*;
        match self {
            Encoding => write!(f, "frame is not valid UTF-8"),
            Field(field, value) => write!(f, "invalid {}: '{}'", field, value),
            UnknownCommand(command) => write!(f, "unknown command '{}'", command),
            Truncated => write!(f, "frame is missing fields"),
        }
    }
}

impl error::Error for FrameError {}
