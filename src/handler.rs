use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::{error, fmt, io};

use log::{debug, error, info, warn};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};
use tokio::time::{interval, Duration};

use crate::config::RunConfig;
use crate::exec::{CmdError, CommandRunner, SystemRunner};
use crate::rib::{RouteTable, Upstream};
use crate::routing::RouteInstaller;
use crate::session::{self, Command, CommandRx, ControlServer, Frame};
use crate::wg::{BackbonePeer, Probe};

/// Cadence of the reconciliation loop
const TICK_INTERVAL: Duration = Duration::from_secs(1);
/// Client interfaces are sampled every 5th tick
const SAMPLE_TICKS: u32 = 5;
/// A full re-advertisement of local routes goes out about once a minute
const RESYNC_TICKS: u32 = 60;

#[derive(Debug)]
pub enum ServeError {
    /// Could not bind a listener
    Bind(io::Error),
    /// An external command kept timing out; the daemon cannot make
    /// progress against the tunnel or kernel state
    Command(CmdError),
}

impl fmt::Display for ServeError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ServeError::Bind(err) => write!(f, "Unable to bind listener: {}", err),
            ServeError::Command(err) => write!(f, "{}", err),
        }
    }
}

impl error::Error for ServeError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        match self {
            ServeError::Bind(err) => Some(err),
            ServeError::Command(err) => Some(err),
        }
    }
}

impl From<CmdError> for ServeError {
    fn from(err: CmdError) -> Self {
        ServeError::Command(err)
    }
}

/// Bind the control and status listeners, bootstrap from the backbone
/// peers, and run the reconciliation loop. Only returns on a fatal error.
pub async fn serve(config: RunConfig) -> Result<(), ServeError> {
    let config = Arc::new(config);
    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::new());

    let control_addr = SocketAddr::new(config.listen_addr, config.control_port);
    let control = TcpListener::bind(control_addr)
        .await
        .map_err(ServeError::Bind)?;
    info!("Listening for control frames on {}", control_addr);

    let status_addr = SocketAddr::new(config.listen_addr, config.status_port);
    let status = TcpListener::bind(status_addr)
        .await
        .map_err(ServeError::Bind)?;
    debug!("Status probe listening on {}", status_addr);

    let table = Arc::new(Mutex::new(RouteTable::new(config.freshness)));
    let (commands_tx, commands_rx) = mpsc::unbounded_channel();

    let server = ControlServer::new(
        control,
        Arc::clone(&table),
        commands_tx,
        config.control_port,
    );
    tokio::spawn(server.run());
    tokio::spawn(session::status_listener(status));

    let mut manager = RouteManager::new(config, runner, table, commands_rx);
    manager.refresh().await?;
    manager.run().await?;
    Ok(())
}

/// Drives convergence: drains queued peer updates every tick, samples the
/// local client tunnels, and periodically re-advertises everything this
/// node terminates.
struct RouteManager {
    config: Arc<RunConfig>,
    probe: Probe,
    installer: RouteInstaller,
    table: Arc<Mutex<RouteTable>>,
    commands: CommandRx,
}

impl RouteManager {
    fn new(
        config: Arc<RunConfig>,
        runner: Arc<dyn CommandRunner>,
        table: Arc<Mutex<RouteTable>>,
        commands: CommandRx,
    ) -> Self {
        Self {
            probe: Probe::new(Arc::clone(&runner)),
            installer: RouteInstaller::new(config.backbone_iface.clone(), runner),
            config,
            table,
            commands,
        }
    }

    async fn run(&mut self) -> Result<(), CmdError> {
        let mut ticks = interval(TICK_INTERVAL);
        let mut count = 0u32;
        loop {
            ticks.tick().await;
            count += 1;
            self.drain_commands().await?;
            if count % SAMPLE_TICKS == 0 {
                self.sample_clients().await?;
            }
            if count > RESYNC_TICKS {
                count = 0;
                self.resync().await?;
            }
        }
    }

    /// Apply every queued peer update. Received claims are folded in with
    /// broadcast off: re-advertising them would amplify every update
    /// across the whole mesh.
    async fn drain_commands(&mut self) -> Result<(), CmdError> {
        while let Ok(command) = self.commands.try_recv() {
            match command {
                Command::AddRoute { ip, age, host } => {
                    self.apply(ip, age, Upstream::Via(host), false).await?;
                }
            }
        }
        Ok(())
    }

    /// Sample the local client tunnels; every live /32 lease is observed
    /// as locally terminated and advertised on adoption
    async fn sample_clients(&self) -> Result<(), CmdError> {
        for iface in self.config.client_ifaces.iter() {
            let leases = match self.probe.client_leases(iface).await {
                Ok(leases) => leases,
                Err(err) if err.is_timeout() => return Err(err),
                Err(err) => {
                    // Interface may be down this tick; sampled again shortly
                    debug!("Skipping client sample on {}: {}", iface, err);
                    continue;
                }
            };
            for (ip, age) in leases {
                self.apply(ip, age, Upstream::Local, true).await?;
            }
        }
        Ok(())
    }

    /// Fold one observation into the table and carry out whatever it
    /// requires: kernel/tunnel reconciliation when the upstream moved,
    /// and an advertisement fan-out for adopted local claims
    async fn apply(
        &self,
        ip: Ipv4Addr,
        age: u64,
        upstream: Upstream,
        broadcast: bool,
    ) -> Result<(), CmdError> {
        let adoption = { self.table.lock().await.observe(ip, age, upstream) };
        let adoption = match adoption {
            Some(adoption) => adoption,
            None => return Ok(()),
        };
        if !adoption.upstream_changed && !broadcast {
            return Ok(());
        }

        let peers = match self.backbone_peers().await? {
            Some(peers) => peers,
            None => return Ok(()),
        };
        if adoption.upstream_changed {
            self.reconcile(ip, upstream, &peers).await?;
        }
        if broadcast {
            self.broadcast(ip, age, &peers);
        }
        Ok(())
    }

    /// Point kernel route and tunnel allowed-IP state at the adopted
    /// upstream
    async fn reconcile(
        &self,
        ip: Ipv4Addr,
        upstream: Upstream,
        peers: &[BackbonePeer],
    ) -> Result<(), CmdError> {
        let result = match upstream {
            Upstream::Local => self.installer.install_local(ip).await,
            Upstream::Via(host) => match peers.iter().find(|peer| peer.routes_host(host)) {
                Some(peer) => self.installer.install_via(ip, host, peer).await,
                None => {
                    // The claimant re-advertises once it shows up in the dump
                    warn!("Unable to find host {} in backbone list", host);
                    return Ok(());
                }
            },
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.is_timeout() => Err(err),
            Err(err) => {
                error!("Failed to install route for {}: {}", ip, err);
                Ok(())
            }
        }
    }

    /// One best-effort concurrent send to every peer's advertisement
    /// target
    fn broadcast(&self, ip: Ipv4Addr, age: u64, peers: &[BackbonePeer]) {
        for peer in peers {
            if let Some(target) = peer.advert_target() {
                session::spawn_send(target, self.config.control_port, Frame::Update { ip, age });
            }
        }
    }

    /// Startup bootstrap: ask every backbone peer to replay the clients it
    /// terminates
    async fn refresh(&self) -> Result<(), CmdError> {
        let peers = match self.backbone_peers().await? {
            Some(peers) => peers,
            None => {
                warn!("Error refreshing peers");
                return Ok(());
            }
        };
        for peer in &peers {
            if let Some(target) = peer.advert_target() {
                info!("Requesting refresh from {}", target);
                if let Some(seen) = peer.handshake_at() {
                    debug!("Peer {} last handshake at {}", target, seen);
                }
                session::spawn_send(target, self.config.control_port, Frame::Refresh);
            }
        }
        Ok(())
    }

    /// Periodic full resync: every locally terminated route to every peer
    async fn resync(&self) -> Result<(), CmdError> {
        let peers = match self.backbone_peers().await? {
            Some(peers) => peers,
            None => {
                warn!("Error sending routes");
                return Ok(());
            }
        };
        let local = { self.table.lock().await.local_routes() };
        debug!(
            "Resyncing {} local routes to {} peers",
            local.len(),
            peers.len()
        );
        for peer in &peers {
            if let Some(target) = peer.advert_target() {
                for &(ip, age) in &local {
                    session::spawn_send(target, self.config.control_port, Frame::Update { ip, age });
                }
            }
        }
        Ok(())
    }

    /// Probe the backbone interface, keeping the fatal/transient error
    /// split in one place: exhausted timeouts bubble up, anything else is
    /// reported as `None` for the caller to log and skip
    async fn backbone_peers(&self) -> Result<Option<Vec<BackbonePeer>>, CmdError> {
        match self.probe.backbone_peers(&self.config.backbone_iface).await {
            Ok(peers) => Ok(Some(peers)),
            Err(err) if err.is_timeout() => Err(err),
            Err(err) => {
                warn!("Cannot list backbone peers: {}", err);
                Ok(None)
            }
        }
    }
}
