use std::net::Ipv4Addr;
use std::sync::Arc;

use ipnetwork::{IpNetwork, Ipv4Network};
use log::debug;

use crate::exec::{CmdError, CommandRunner};
use crate::utils::join_allowed_ips;
use crate::wg::BackbonePeer;

/// Reconciles the kernel route table and backbone allowed-IPs with an
/// adopted upstream.
///
/// Every operation here is idempotent: installing the same client/upstream
/// pair twice leaves identical kernel and tunnel state, so retries and
/// races with the periodic resync settle cleanly.
pub struct RouteInstaller {
    backbone_iface: String,
    runner: Arc<dyn CommandRunner>,
}

impl RouteInstaller {
    pub fn new(backbone_iface: String, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            backbone_iface,
            runner,
        }
    }

    /// The client terminates here: drop any host route steering it onto
    /// the backbone. No peer's allowed-IPs are touched.
    pub async fn install_local(&self, client: Ipv4Addr) -> Result<(), CmdError> {
        self.remove_route(client).await
    }

    /// Steer a client through a backbone peer: extend the peer's
    /// allowed-IPs with the client /32, then replace any existing host
    /// route with one via `host` on the backbone interface.
    pub async fn install_via(
        &self,
        client: Ipv4Addr,
        host: Ipv4Addr,
        peer: &BackbonePeer,
    ) -> Result<(), CmdError> {
        let allowed = allowed_ips_with(&peer.allowed_ips, client);
        self.runner
            .run(&[
                "wg",
                "set",
                &self.backbone_iface,
                "peer",
                &peer.public_key,
                "allowed-ips",
                &allowed,
            ])
            .await?;
        self.remove_route(client).await?;
        let prefix = format!("{}/32", client);
        let via = host.to_string();
        self.runner
            .run(&[
                "ip",
                "route",
                "add",
                &prefix,
                "via",
                &via,
                "dev",
                &self.backbone_iface,
            ])
            .await?;
        Ok(())
    }

    async fn remove_route(&self, client: Ipv4Addr) -> Result<(), CmdError> {
        let prefix = format!("{}/32", client);
        match self.runner.run(&["ip", "route", "del", &prefix]).await {
            Ok(_) => Ok(()),
            Err(err) if err.is_timeout() => Err(err),
            Err(err) => {
                // The route may simply not be installed yet
                debug!("Ignoring route removal for {}: {}", prefix, err);
                Ok(())
            }
        }
    }
}

/// The peer's existing allowed-IPs plus the client /32, deduplicated and
/// comma-joined for `wg set`
fn allowed_ips_with(existing: &[IpNetwork], client: Ipv4Addr) -> String {
    let client_net =
        IpNetwork::V4(Ipv4Network::new(client, 32).expect("/32 is a valid prefix length"));
    let mut networks = existing.to_vec();
    if !networks.contains(&client_net) {
        networks.push(client_net);
    }
    join_allowed_ips(&networks)
}
