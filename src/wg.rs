use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use ipnetwork::IpNetwork;

use crate::exec::{CmdError, CommandRunner};
use crate::utils::{host_address, parse_allowed_ips};

/// One peer on the backbone interface, as reported by a `wg` dump.
///
/// This view is transient: it is recomputed on every probe and never
/// cached, so the allowed-IPs here are the set in force the moment the
/// dump ran.
#[derive(Clone, Debug)]
pub struct BackbonePeer {
    pub public_key: String,
    pub endpoint: SocketAddr,
    pub allowed_ips: Vec<IpNetwork>,
    /// Unix timestamp of the latest tunnel handshake (0 = never)
    pub last_handshake: u64,
}

impl BackbonePeer {
    /// Does this peer's allowed-IP set cover the given backbone host?
    pub fn routes_host(&self, host: Ipv4Addr) -> bool {
        self.allowed_ips.iter().any(|net| net.contains(host.into()))
    }

    /// Where advertisements for this peer go: the first allowed-IPs entry,
    /// and only when it is a single host
    pub fn advert_target(&self) -> Option<Ipv4Addr> {
        self.allowed_ips.first().and_then(host_address)
    }

    pub fn handshake_at(&self) -> Option<DateTime<Utc>> {
        if self.last_handshake == 0 {
            return None;
        }
        Utc.timestamp_opt(self.last_handshake as i64, 0).single()
    }
}

/// Reads live WireGuard state by running `wg show <iface> dump`
pub struct Probe {
    runner: Arc<dyn CommandRunner>,
}

impl Probe {
    pub fn new(runner: Arc<dyn CommandRunner>) -> Self {
        Self { runner }
    }

    /// All currently configured peers on the backbone interface. Rows
    /// without a parseable endpoint (the interface header line, peers that
    /// never connected) are skipped.
    pub async fn backbone_peers(&self, iface: &str) -> Result<Vec<BackbonePeer>, CmdError> {
        let dump = self.runner.run(&["wg", "show", iface, "dump"]).await?;
        Ok(dump.lines().filter_map(parse_peer_row).collect())
    }

    /// Clients currently connected on `iface`, as (address, last-handshake)
    /// pairs. Only peers whose allowed-IPs are exactly one `/32` count.
    pub async fn client_leases(&self, iface: &str) -> Result<Vec<(Ipv4Addr, u64)>, CmdError> {
        let dump = self.runner.run(&["wg", "show", iface, "dump"]).await?;
        Ok(dump.lines().filter_map(parse_lease_row).collect())
    }
}

// Dump rows are tab-delimited:
//   public-key  preshared-key  endpoint  allowed-ips  latest-handshake  rx  tx  keepalive
// The first row describes the interface itself and carries fewer columns.
fn parse_peer_row(row: &str) -> Option<BackbonePeer> {
    let fields: Vec<&str> = row.split('\t').collect();
    if fields.len() < 5 {
        return None;
    }
    let endpoint: SocketAddr = fields[2].parse().ok()?;
    let last_handshake = fields[4].parse().ok()?;
    Some(BackbonePeer {
        public_key: fields[0].to_string(),
        endpoint,
        allowed_ips: parse_allowed_ips(fields[3]),
        last_handshake,
    })
}

fn parse_lease_row(row: &str) -> Option<(Ipv4Addr, u64)> {
    let fields: Vec<&str> = row.split('\t').collect();
    if fields.len() < 5 {
        return None;
    }
    // A multi-entry allowed-IPs field fails the parse, which is what rules
    // out site-to-site peers here
    let network: IpNetwork = fields[3].parse().ok()?;
    let client = host_address(&network)?;
    let age = fields[4].parse().ok()?;
    Some((client, age))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::testing::{Reply, ScriptedRunner};

    const BACKBONE_DUMP: &str = "\
PRIVKEY\tPUBKEY\t51820\toff
a1b2c3=\t(none)\t10.99.0.1:51820\t10.99.0.2/32\t1650000000\t100\t200\toff
d4e5f6=\t(none)\t10.99.0.5:51820\t10.99.0.3/32, 10.44.0.0/24\t1650000060\t0\t0\toff
g7h8i9=\t(none)\t(none)\t10.99.0.4/32\t0\t0\t0\toff
";

    const CLIENT_DUMP: &str = "\
PRIVKEY\tPUBKEY\t51821\toff
k1=\t(none)\t198.51.100.7:31544\t10.0.0.5/32\t1650000012\t10\t20\toff
k2=\t(none)\t198.51.100.8:31550\t10.0.0.6/24\t1650000000\t0\t0\toff
k3=\t(none)\t198.51.100.9:31560\t10.0.0.7/32,10.0.0.8/32\t1650000000\t0\t0\toff
k4=\t(none)\t198.51.100.10:31570\t10.0.0.9/32\t0\t0\t0\toff
";

    #[tokio::test]
    async fn test_backbone_peers_skips_unparseable_rows() {
        let runner = ScriptedRunner::new().on(
            "wg show backbone dump",
            Reply::Ok(BACKBONE_DUMP.to_string()),
        );
        let probe = Probe::new(Arc::new(runner));
        let peers = probe.backbone_peers("backbone").await.unwrap();

        // Interface header and the endpoint-less peer drop out
        assert_eq!(peers.len(), 2);
        assert_eq!(peers[0].public_key, "a1b2c3=");
        assert_eq!(peers[0].endpoint, "10.99.0.1:51820".parse().unwrap());
        assert_eq!(peers[0].last_handshake, 1650000000);
        assert_eq!(peers[1].allowed_ips.len(), 2);
    }

    #[tokio::test]
    async fn test_peer_host_membership_is_containment() {
        let runner = ScriptedRunner::new().on(
            "wg show backbone dump",
            Reply::Ok(BACKBONE_DUMP.to_string()),
        );
        let probe = Probe::new(Arc::new(runner));
        let peers = probe.backbone_peers("backbone").await.unwrap();

        assert!(peers[0].routes_host(Ipv4Addr::new(10, 99, 0, 2)));
        assert!(!peers[0].routes_host(Ipv4Addr::new(10, 99, 0, 3)));
        // Covered by the /24, not just the /32
        assert!(peers[1].routes_host(Ipv4Addr::new(10, 44, 0, 17)));
    }

    #[tokio::test]
    async fn test_advert_target_is_first_host_entry() {
        let runner = ScriptedRunner::new().on(
            "wg show backbone dump",
            Reply::Ok(BACKBONE_DUMP.to_string()),
        );
        let probe = Probe::new(Arc::new(runner));
        let peers = probe.backbone_peers("backbone").await.unwrap();

        assert_eq!(peers[0].advert_target(), Some(Ipv4Addr::new(10, 99, 0, 2)));

        let mut wide = peers[1].clone();
        assert_eq!(wide.advert_target(), Some(Ipv4Addr::new(10, 99, 0, 3)));
        // A non-host first entry means nowhere to advertise
        wide.allowed_ips.reverse();
        assert_eq!(wide.advert_target(), None);
    }

    #[tokio::test]
    async fn test_client_leases_require_single_host() {
        let runner = ScriptedRunner::new().on(
            "wg show clients dump",
            Reply::Ok(CLIENT_DUMP.to_string()),
        );
        let probe = Probe::new(Arc::new(runner));
        let leases = probe.client_leases("clients").await.unwrap();

        // The /24 and the two-entry rows are not leases; the zero-handshake
        // row still parses (the table rejects it later)
        assert_eq!(
            leases,
            vec![
                (Ipv4Addr::new(10, 0, 0, 5), 1650000012),
                (Ipv4Addr::new(10, 0, 0, 9), 0),
            ]
        );
    }

    #[tokio::test]
    async fn test_probe_propagates_command_failure() {
        let runner = ScriptedRunner::new().on(
            "wg show backbone dump",
            Reply::Failed("Unable to access interface: No such device".to_string()),
        );
        let probe = Probe::new(Arc::new(runner));
        assert!(probe.backbone_peers("backbone").await.is_err());
    }

    #[test]
    fn test_handshake_at() {
        let peer = BackbonePeer {
            public_key: "k".to_string(),
            endpoint: "10.99.0.1:51820".parse().unwrap(),
            allowed_ips: vec![],
            last_handshake: 1650000000,
        };
        assert_eq!(
            peer.handshake_at().unwrap(),
            Utc.timestamp_opt(1650000000, 0).unwrap()
        );
        let never = BackbonePeer {
            last_handshake: 0,
            ..peer
        };
        assert!(never.handshake_at().is_none());
    }
}
