use std::io;
use std::net::Ipv4Addr;

use log::{trace, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;

use super::{Frame, MAX_FRAME_LEN, SEND_TIMEOUT};

/// Push one frame to a peer daemon and hang up.
///
/// Advertisements are best-effort: a failed or timed-out send is only
/// logged, since the periodic resync re-delivers everything anyway.
pub async fn send_frame(dest: Ipv4Addr, port: u16, frame: Frame) {
    trace!("Sending '{}' to {}:{}", frame, dest, port);
    if let Err(err) = try_send(dest, port, &frame).await {
        warn!("Failed to send '{}' to {}: {}", frame, dest, err);
    }
}

/// Fire-and-forget variant used for concurrent fan-out
pub fn spawn_send(dest: Ipv4Addr, port: u16, frame: Frame) {
    tokio::spawn(send_frame(dest, port, frame));
}

async fn try_send(dest: Ipv4Addr, port: u16, frame: &Frame) -> io::Result<()> {
    timeout(SEND_TIMEOUT, async {
        let mut stream = TcpStream::connect((dest, port)).await?;
        stream.write_all(frame.to_string().as_bytes()).await?;
        // The receiver never sends a body; drain so the remote closes first
        let mut sink = [0u8; MAX_FRAME_LEN];
        let _ = stream.read(&mut sink).await;
        Ok(())
    })
    .await
    .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "send deadline elapsed"))?
}
