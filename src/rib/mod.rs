use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use chrono::{DateTime, Utc};
use log::info;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Where traffic for a client is steered
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Upstream {
    /// Terminated on this node; no backbone hop
    Local,
    /// Reached through the given backbone host
    Via(Ipv4Addr),
}

impl Upstream {
    pub fn is_local(&self) -> bool {
        matches!(self, Upstream::Local)
    }
}

impl fmt::Display for Upstream {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Upstream::Local => write!(f, "local"),
            Upstream::Via(host) => write!(f, "{}", host),
        }
    }
}

/// Which of two competing claims for the same client wins.
///
/// The stock `wg` tooling reports latest-handshake as seconds since the
/// epoch, so a numerically higher stamp is the more recent sighting and
/// `PreferHighest` is the deployed behavior. Deployments that feed relative
/// ages (seconds since the handshake) can invert the comparison instead of
/// patching the daemon.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FreshnessOrder {
    PreferHighest,
    PreferLowest,
}

impl FreshnessOrder {
    fn fresher(&self, candidate: u64, stored: u64) -> bool {
        match self {
            FreshnessOrder::PreferHighest => candidate > stored,
            FreshnessOrder::PreferLowest => candidate < stored,
        }
    }
}

impl Default for FreshnessOrder {
    fn default() -> Self {
        FreshnessOrder::PreferHighest
    }
}

impl fmt::Display for FreshnessOrder {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let display = match self {
            FreshnessOrder::PreferHighest => "prefer-highest",
            FreshnessOrder::PreferLowest => "prefer-lowest",
        };
        write!(f, "{}", display)
    }
}

impl Serialize for FreshnessOrder {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for FreshnessOrder {
    fn deserialize<D>(deserializer: D) -> Result<FreshnessOrder, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        match s.to_lowercase().as_str() {
            "prefer-highest" => Ok(FreshnessOrder::PreferHighest),
            "prefer-lowest" => Ok(FreshnessOrder::PreferLowest),
            _ => Err(serde::de::Error::custom(format!(
                "Unsupported freshness order: '{}'",
                s
            ))),
        }
    }
}

/// One tracked client /32 and the upstream currently believed to serve it
#[derive(Clone, Debug)]
pub struct ClientRoute {
    pub ip: Ipv4Addr,
    pub upstream: Upstream,
    /// Freshness stamp reported by whichever node last claimed the client;
    /// compared raw, never relativized between nodes
    pub age: u64,
    pub updated_at: DateTime<Utc>,
}

/// What an adopted observation requires of the caller
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Adoption {
    pub upstream: Upstream,
    pub age: u64,
    /// The upstream moved (new client or handoff): kernel and tunnel state
    /// need reconciling
    pub upstream_changed: bool,
}

/// In-memory map of every known client to its adopted upstream.
///
/// Entries are only ever mutated through `observe`, and only one task does
/// that; readers see the table through a shared lock. Entries are never
/// deleted: a client that disappears simply stops being re-advertised.
#[derive(Debug)]
pub struct RouteTable {
    entries: HashMap<Ipv4Addr, ClientRoute>,
    order: FreshnessOrder,
}

impl RouteTable {
    pub fn new(order: FreshnessOrder) -> Self {
        Self {
            entries: HashMap::new(),
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, ip: &Ipv4Addr) -> Option<&ClientRoute> {
        self.entries.get(ip)
    }

    /// Fold one claim into the table.
    ///
    /// An age of zero is the "no handshake yet" sentinel and is never
    /// adopted. Otherwise the claim wins when the client is unknown or the
    /// claim is fresher than the stored one; ties never displace an entry.
    pub fn observe(&mut self, ip: Ipv4Addr, age: u64, upstream: Upstream) -> Option<Adoption> {
        if age == 0 {
            return None;
        }
        let previous = self.entries.get(&ip).map(|route| (route.upstream, route.age));
        if let Some((_, stored_age)) = previous {
            if !self.order.fresher(age, stored_age) {
                return None;
            }
        }
        let upstream_changed = previous.map(|(prev, _)| prev != upstream).unwrap_or(true);
        self.entries.insert(
            ip,
            ClientRoute {
                ip,
                upstream,
                age,
                updated_at: Utc::now(),
            },
        );
        if upstream_changed {
            info!("Setting {} as upstream for {}", upstream, ip);
        }
        Some(Adoption {
            upstream,
            age,
            upstream_changed,
        })
    }

    /// Routes this node terminates itself: the set sent back on `refresh`
    /// and re-advertised by the periodic resync
    pub fn local_routes(&self) -> Vec<(Ipv4Addr, u64)> {
        self.entries
            .values()
            .filter(|route| route.upstream.is_local())
            .map(|route| (route.ip, route.age))
            .collect()
    }
}

impl Default for RouteTable {
    fn default() -> Self {
        Self::new(FreshnessOrder::default())
    }
}
