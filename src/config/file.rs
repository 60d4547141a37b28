use std::fs::File;
use std::io::{self, Read};
use std::net::{IpAddr, Ipv4Addr};

use serde::Deserialize;

use crate::rib::FreshnessOrder;
use crate::session;

struct Defaults {}

impl Defaults {
    fn backbone_iface() -> String {
        "backbone".to_string()
    }

    fn client_ifaces() -> Vec<String> {
        vec!["clients".to_string()]
    }

    fn listen_addr() -> IpAddr {
        IpAddr::V4(Ipv4Addr::UNSPECIFIED)
    }

    fn control_port() -> u16 {
        session::CONTROL_PORT
    }

    fn status_port() -> u16 {
        session::STATUS_PORT
    }
}

/// Config (toml) representation of the daemon settings.
/// Every field is optional; an absent config file behaves like an empty one.
#[derive(Debug, Deserialize)]
pub(super) struct DaemonConfigSpec {
    // Tunnel shared by all backbone nodes
    #[serde(default = "Defaults::backbone_iface")]
    pub(super) backbone_iface: String,

    // Tunnels terminating clients on this node
    #[serde(default = "Defaults::client_ifaces")]
    pub(super) client_ifaces: Vec<String>,

    #[serde(default = "Defaults::listen_addr")]
    pub(super) listen_addr: IpAddr,

    // Port for peer control frames
    #[serde(default = "Defaults::control_port")]
    pub(super) control_port: u16,

    // Port answering liveness probes
    #[serde(default = "Defaults::status_port")]
    pub(super) status_port: u16,

    // Which of two competing claims for a client wins; the stock `wg`
    // handshake stamps want "prefer-highest"
    #[serde(default)]
    pub(super) freshness: FreshnessOrder,
}

impl DaemonConfigSpec {
    pub(super) fn from_file(path: &str) -> io::Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        toml::from_str(&contents)
            .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err.to_string()))
    }
}

impl Default for DaemonConfigSpec {
    fn default() -> Self {
        toml::from_str("").expect("Empty config spec always parses")
    }
}
