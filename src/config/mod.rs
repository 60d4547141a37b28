mod file;

use std::io;
use std::net::IpAddr;

use crate::rib::FreshnessOrder;

/// Parse a TOML config file and return a RunConfig
pub fn from_file(path: &str) -> io::Result<RunConfig> {
    let spec = file::DaemonConfigSpec::from_file(path)?;
    Ok(RunConfig::from_spec(spec))
}

/// In-memory daemon settings with all defaults applied
#[derive(Clone, Debug)]
pub struct RunConfig {
    /// Shared tunnel all backbone nodes peer over
    pub backbone_iface: String,
    /// Tunnels terminating client endpoints on this node
    pub client_ifaces: Vec<String>,
    pub listen_addr: IpAddr,
    pub control_port: u16,
    pub status_port: u16,
    pub freshness: FreshnessOrder,
}

impl RunConfig {
    fn from_spec(spec: file::DaemonConfigSpec) -> Self {
        Self {
            backbone_iface: spec.backbone_iface,
            client_ifaces: spec.client_ifaces,
            listen_addr: spec.listen_addr,
            control_port: spec.control_port,
            status_port: spec.status_port,
            freshness: spec.freshness,
        }
    }
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::from_spec(file::DaemonConfigSpec::default())
    }
}
