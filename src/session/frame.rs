use std::fmt;
use std::net::Ipv4Addr;
use std::str;

use super::FrameError;

/// A control-protocol frame: one comma-delimited ASCII line per connection.
/// There is deliberately no host field in `Update`; the claimant is always
/// the connection's source address.
#[derive(Clone, Debug, Hash, PartialEq, Eq)]
pub enum Frame {
    /// Ask the receiver to re-advertise every client it terminates
    Refresh,
    /// Claim that `ip` is currently reachable through the sender
    Update { ip: Ipv4Addr, age: u64 },
}

impl Frame {
    /// Decode raw bytes read from the socket. Surrounding whitespace is
    /// trimmed; fields past the last expected one are ignored.
    pub fn decode(data: &[u8]) -> Result<Frame, FrameError> {
        let text = str::from_utf8(data).map_err(|_| FrameError::Encoding)?;
        let mut fields = text.trim().split(',');
        match fields.next() {
            Some("refresh") => Ok(Frame::Refresh),
            Some("update") => {
                let ip = fields.next().ok_or(FrameError::Truncated)?;
                let age = fields.next().ok_or(FrameError::Truncated)?;
                let ip = ip
                    .parse()
                    .map_err(|_| FrameError::Field("ip", ip.to_string()))?;
                let age = age
                    .parse()
                    .map_err(|_| FrameError::Field("age", age.to_string()))?;
                Ok(Frame::Update { ip, age })
            }
            Some(other) => Err(FrameError::UnknownCommand(other.to_string())),
            None => Err(FrameError::Truncated),
        }
    }
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Frame::Refresh => write!(f, "refresh"),
            Frame::Update { ip, age } => write!(f, "update,{},{}", ip, age),
        }
    }
}
