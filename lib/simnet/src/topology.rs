// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Virtual device snapshots and the topology cache client.
//!
//! Snapshots are deep-immutable and `Arc`-shared: a fetch may hand
//! the same snapshot to any number of concurrent simulations, and no
//! caller ever mutates one. Mutable per-device state (MAC learning,
//! ARP) lives behind capability handles carried inside the snapshot.

use crate::chain::Rule;
use crate::dhcp::DhcpSubnet;
use crate::resource::ArpCache;
use crate::resource::MacTable;
use crate::route::RoutingTable;
use futures::future::BoxFuture;
use futures::future::FutureExt;
use simnet_api::Ipv4Cidr;
use simnet_api::MacAddr;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::sync::RwLock;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

/// A virtual port, exterior (bound to a datapath port) or interior
/// (patched to a peer port on another device).
#[derive(Clone, Debug)]
pub struct Port {
    pub id: Uuid,

    /// The device this port belongs to.
    pub device: Uuid,

    pub admin_state_up: bool,
    pub infilter: Option<Uuid>,
    pub outfilter: Option<Uuid>,

    /// For ports on a VLAN-aware bridge: the access VLAN carried on
    /// the bridge side of this port.
    pub vlan_id: Option<u16>,

    pub kind: PortKind,
}

#[derive(Clone, Debug)]
pub enum PortKind {
    Exterior {
        /// The kernel datapath port number packets emit on.
        dp_port: u32,
        port_groups: BTreeSet<Uuid>,
        dhcp: Option<DhcpSubnet>,
    },
    Interior {
        peer: Uuid,
    },
}

impl Port {
    pub fn is_exterior(&self) -> bool {
        matches!(self.kind, PortKind::Exterior { .. })
    }

    pub fn peer(&self) -> Option<Uuid> {
        match self.kind {
            PortKind::Interior { peer } => Some(peer),
            PortKind::Exterior { .. } => None,
        }
    }

    pub fn dp_port(&self) -> Option<u32> {
        match self.kind {
            PortKind::Exterior { dp_port, .. } => Some(dp_port),
            PortKind::Interior { .. } => None,
        }
    }

    pub fn port_groups(&self) -> Option<&BTreeSet<Uuid>> {
        match &self.kind {
            PortKind::Exterior { port_groups, .. } => Some(port_groups),
            PortKind::Interior { .. } => None,
        }
    }

    pub fn dhcp(&self) -> Option<&DhcpSubnet> {
        match &self.kind {
            PortKind::Exterior { dhcp, .. } => dhcp.as_ref(),
            PortKind::Interior { .. } => None,
        }
    }
}

/// An L2 learning bridge.
#[derive(Clone, Debug)]
pub struct Bridge {
    pub id: Uuid,
    pub admin_state_up: bool,
    pub infilter: Option<Uuid>,
    pub outfilter: Option<Uuid>,

    /// The port set flooded for broadcast/multicast/unknown-unicast.
    pub flood_port_set: Uuid,

    /// The shared MAC-learning table for this bridge.
    pub mac_table: MacTable,

    /// For each VLAN the bridge participates in, the interior port
    /// leading toward the VLAN-aware bridge carrying that tag.
    pub vlan_ports: BTreeMap<u16, Uuid>,
}

/// L3 addressing of one router port.
#[derive(Clone, Copy, Debug)]
pub struct RouterPortCfg {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
    pub net: Ipv4Cidr,
}

/// An IPv4 router.
#[derive(Clone, Debug)]
pub struct Router {
    pub id: Uuid,
    pub admin_state_up: bool,
    pub infilter: Option<Uuid>,
    pub outfilter: Option<Uuid>,

    pub routes: RoutingTable,

    /// The shared next-hop resolution cache.
    pub arp_cache: ArpCache,

    /// Addressing for each of the router's ports.
    pub ports: BTreeMap<Uuid, RouterPortCfg>,
}

impl Router {
    /// The port whose address is `ip`, for answering ARP.
    pub fn port_by_ip(&self, ip: Ipv4Addr) -> Option<(Uuid, &RouterPortCfg)> {
        self.ports.iter().find(|(_, cfg)| cfg.ip == ip).map(|(id, c)| (*id, c))
    }
}

/// A VLAN-aware bridge: trunk ports facing the physical side,
/// interior ports each carrying one VLAN toward an ordinary bridge.
#[derive(Clone, Debug)]
pub struct VlanBridge {
    pub id: Uuid,
    pub admin_state_up: bool,

    pub trunk_port: Uuid,

    /// VLAN id → the interior port toward the bridge for that VLAN.
    pub interior_by_vlan: BTreeMap<u16, Uuid>,
}

impl VlanBridge {
    /// The VLAN an interior port carries, if `port` is one of ours.
    pub fn vlan_of_port(&self, port: Uuid) -> Option<u16> {
        self.interior_by_vlan
            .iter()
            .find(|(_, p)| **p == port)
            .map(|(vid, _)| *vid)
    }
}

/// An ordered filter chain.
#[derive(Clone, Debug)]
pub struct Chain {
    pub id: Uuid,
    pub name: String,
    pub rules: Vec<Rule>,
}

/// A topology snapshot: one virtual device.
#[derive(Clone, Debug)]
pub enum Device {
    Bridge(Arc<Bridge>),
    Router(Arc<Router>),
    VlanBridge(Arc<VlanBridge>),
    Chain(Arc<Chain>),
    Port(Arc<Port>),
}

impl Device {
    pub fn id(&self) -> Uuid {
        match self {
            Self::Bridge(d) => d.id,
            Self::Router(d) => d.id,
            Self::VlanBridge(d) => d.id,
            Self::Chain(d) => d.id,
            Self::Port(d) => d.id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Bridge(_) => "bridge",
            Self::Router(_) => "router",
            Self::VlanBridge(_) => "vlan-bridge",
            Self::Chain(_) => "chain",
            Self::Port(_) => "port",
        }
    }
}

/// The read side of the topology cache. Implementations resolve an id
/// to a snapshot, possibly after a round trip to the cluster; `None`
/// means the id is unknown.
pub trait TopologyStore: Send + Sync {
    fn fetch(&self, id: Uuid) -> BoxFuture<'_, Option<Device>>;
}

/// Typed, deadline-bounded lookups over a [`TopologyStore`].
#[derive(Clone)]
pub struct TopologyClient {
    store: Arc<dyn TopologyStore>,
}

macro_rules! typed_fetch {
    ($name:ident, $variant:ident, $ty:ty) => {
        pub async fn $name(
            &self,
            id: Uuid,
            expiry: Instant,
        ) -> Option<Arc<$ty>> {
            match self.device(id, expiry).await? {
                Device::$variant(d) => Some(d),
                other => {
                    warn!(
                        %id,
                        expected = stringify!($name),
                        actual = other.kind(),
                        "device kind mismatch"
                    );
                    None
                }
            }
        }
    };
}

impl TopologyClient {
    pub fn new(store: Arc<dyn TopologyStore>) -> Self {
        Self { store }
    }

    /// Fetch any device, bounded by the simulation deadline. Timeout
    /// and unknown-id both come back as `None`; the caller turns that
    /// into a temporary drop and a later packet retries.
    pub async fn device(&self, id: Uuid, expiry: Instant) -> Option<Device> {
        match tokio::time::timeout_at(expiry, self.store.fetch(id)).await {
            Ok(dev) => dev,
            Err(_) => {
                warn!(%id, "topology fetch timed out");
                None
            }
        }
    }

    typed_fetch!(port, Port, Port);
    typed_fetch!(bridge, Bridge, Bridge);
    typed_fetch!(router, Router, Router);
    typed_fetch!(vlan_bridge, VlanBridge, VlanBridge);
    typed_fetch!(chain, Chain, Chain);
}

/// An in-memory [`TopologyStore`]: every snapshot resolves
/// immediately. Production wires the cluster-backed cache in through
/// the same trait.
#[derive(Default)]
pub struct StaticTopology {
    devices: RwLock<HashMap<Uuid, Device>>,
}

impl StaticTopology {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, device: Device) {
        self.devices.write().unwrap().insert(device.id(), device);
    }

    pub fn remove(&self, id: Uuid) {
        self.devices.write().unwrap().remove(&id);
    }
}

impl TopologyStore for StaticTopology {
    fn fetch(&self, id: Uuid) -> BoxFuture<'_, Option<Device>> {
        let dev = self.devices.read().unwrap().get(&id).cloned();
        async move { dev }.boxed()
    }
}
