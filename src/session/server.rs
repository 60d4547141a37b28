use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use futures::future;
use log::{debug, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use super::{client, Command, CommandTx, Frame, MAX_FRAME_LEN};
use crate::rib::RouteTable;

/// Accepts control connections from peer daemons and turns their frames
/// into queued route updates or refresh replies.
///
/// Handlers never mutate the route table; updates go through the command
/// channel so the reconciliation loop stays the single writer.
pub struct ControlServer {
    listener: TcpListener,
    table: Arc<Mutex<RouteTable>>,
    commands: CommandTx,
    /// Port refresh replies are sent back to (the shared control port)
    reply_port: u16,
}

impl ControlServer {
    pub fn new(
        listener: TcpListener,
        table: Arc<Mutex<RouteTable>>,
        commands: CommandTx,
        reply_port: u16,
    ) -> Self {
        Self {
            listener,
            table,
            commands,
            reply_port,
        }
    }

    pub async fn run(self) {
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    debug!("Incoming control connection from {}", addr);
                    let table = Arc::clone(&self.table);
                    let commands = self.commands.clone();
                    let reply_port = self.reply_port;
                    tokio::spawn(handle_connection(
                        stream, addr, table, commands, reply_port,
                    ));
                }
                Err(err) => warn!("Failed to accept control connection: {}", err),
            }
        }
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    addr: SocketAddr,
    table: Arc<Mutex<RouteTable>>,
    commands: CommandTx,
    reply_port: u16,
) {
    let source = match addr.ip() {
        IpAddr::V4(ip) => ip,
        IpAddr::V6(_) => {
            warn!("Dropping control connection from non-IPv4 source {}", addr);
            return;
        }
    };
    let mut buf = [0u8; MAX_FRAME_LEN];
    let len = match stream.read(&mut buf).await {
        Ok(len) => len,
        Err(err) => {
            warn!("Error in data from {}: {}", source, err);
            return;
        }
    };
    match Frame::decode(&buf[..len]) {
        Ok(Frame::Update { ip, age }) => {
            // Never applied inline: ordering comes from the single consumer
            let _ = commands.send(Command::AddRoute {
                ip,
                age,
                host: source,
            });
        }
        Ok(Frame::Refresh) => {
            let local = { table.lock().await.local_routes() };
            debug!("Re-advertising {} local routes to {}", local.len(), source);
            let sends = local
                .into_iter()
                .map(|(ip, age)| client::send_frame(source, reply_port, Frame::Update { ip, age }));
            future::join_all(sends).await;
        }
        Err(err) => warn!("Bad frame from {}: {}", source, err),
    }
}

/// Liveness probe endpoint: accept, drain one read, hang up.
/// No response and no side effects; its only job is to prove the daemon
/// is still scheduling accepts.
pub async fn status_listener(listener: TcpListener) {
    loop {
        match listener.accept().await {
            Ok((mut stream, _)) => {
                tokio::spawn(async move {
                    let mut sink = [0u8; MAX_FRAME_LEN];
                    let _ = stream.read(&mut sink).await;
                });
            }
            Err(err) => warn!("Failed to accept status connection: {}", err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rib::Upstream;
    use std::collections::HashSet;
    use std::net::Ipv4Addr;
    use tokio::io::AsyncWriteExt;
    use tokio::sync::mpsc;

    async fn start_server(
        table: Arc<Mutex<RouteTable>>,
        reply_port: u16,
    ) -> (u16, super::super::CommandRx) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(ControlServer::new(listener, table, tx, reply_port).run());
        (port, rx)
    }

    async fn send_line(port: u16, line: &[u8]) {
        let mut stream = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        stream.write_all(line).await.unwrap();
        stream.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_update_frame_is_queued_with_source_host() {
        let table = Arc::new(Mutex::new(RouteTable::default()));
        let (port, mut rx) = start_server(table, 0).await;

        send_line(port, b"update,10.0.0.5,12").await;

        let command = rx.recv().await.unwrap();
        assert_eq!(
            command,
            Command::AddRoute {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                age: 12,
                host: Ipv4Addr::LOCALHOST,
            }
        );
    }

    #[tokio::test]
    async fn test_malformed_frames_are_dropped() {
        let table = Arc::new(Mutex::new(RouteTable::default()));
        let (port, mut rx) = start_server(table, 0).await;

        send_line(port, b"update,not-an-ip,12").await;
        send_line(port, b"withdraw,10.0.0.5,9").await;
        send_line(port, &[0xff, 0xfe]).await;
        send_line(port, b"update,10.0.0.6,7").await;

        // Only the valid frame made it through
        let command = rx.recv().await.unwrap();
        assert_eq!(
            command,
            Command::AddRoute {
                ip: Ipv4Addr::new(10, 0, 0, 6),
                age: 7,
                host: Ipv4Addr::LOCALHOST,
            }
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_refresh_replays_each_local_route_once() {
        let mut seed = RouteTable::default();
        seed.observe(Ipv4Addr::new(10, 0, 0, 5), 12, Upstream::Local)
            .unwrap();
        seed.observe(Ipv4Addr::new(10, 0, 0, 6), 3, Upstream::Local)
            .unwrap();
        seed.observe(
            Ipv4Addr::new(10, 0, 0, 7),
            9,
            Upstream::Via(Ipv4Addr::new(10, 99, 0, 3)),
        )
        .unwrap();
        let table = Arc::new(Mutex::new(seed));

        // Stand in for the requesting daemon's own control port
        let remote = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote_port = remote.local_addr().unwrap().port();
        let (port, _rx) = start_server(table, remote_port).await;

        send_line(port, b"refresh").await;

        let mut received = HashSet::new();
        for _ in 0..2 {
            let (mut stream, _) = remote.accept().await.unwrap();
            let mut buf = [0u8; MAX_FRAME_LEN];
            let len = stream.read(&mut buf).await.unwrap();
            received.insert(Frame::decode(&buf[..len]).unwrap());
        }

        let expected: HashSet<_> = vec![
            Frame::Update {
                ip: Ipv4Addr::new(10, 0, 0, 5),
                age: 12,
            },
            Frame::Update {
                ip: Ipv4Addr::new(10, 0, 0, 6),
                age: 3,
            },
        ]
        .into_iter()
        .collect();
        assert_eq!(received, expected);
    }
}
