// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Shared fixture for the simulation tests: a small reference
//! topology (two-port learning bridge behind an IPv4 router with an
//! uplink), packet builders, and result matchers.

use simnet::config::SimConfig;
use simnet::conntrack::InMemoryConnCache;
use simnet::context::PacketContext;
use simnet::coordinator::Coordinator;
use simnet::dhcp::DhcpHost;
use simnet::dhcp::DhcpSubnet;
use simnet::emit::GeneratedPacket;
use simnet::emit::PacketEmitter;
use simnet::resource::MacTableKey;
use simnet::resource::SharedMap;
use simnet::route::NextHop;
use simnet::route::Route;
use simnet::route::RoutingTable;
use simnet::sim::SimulationResult;
use simnet::sim::VirtualFlow;
use simnet::topology::Bridge;
use simnet::topology::Device;
use simnet::topology::Port;
use simnet::topology::PortKind;
use simnet::topology::Router;
use simnet::topology::RouterPortCfg;
use simnet::topology::StaticTopology;
use simnet::topology::TopologyClient;
use simnet::wildcard::WildcardMatch;
use simnet_api::FragmentType;
use simnet_api::IpCidr;
use simnet_api::MacAddr;
use simnet_api::Protocol;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;
use uuid::Uuid;

pub const BRIDGE: Uuid = Uuid::from_u128(0xB0);
pub const FLOOD_SET: Uuid = Uuid::from_u128(0xF5);
pub const PORT_A: Uuid = Uuid::from_u128(0x0A);
pub const PORT_B: Uuid = Uuid::from_u128(0x0B);
pub const BRIDGE_TO_RTR: Uuid = Uuid::from_u128(0x0C);
pub const ROUTER: Uuid = Uuid::from_u128(0xE0);
pub const RTR_TO_BRIDGE: Uuid = Uuid::from_u128(0x0D);
pub const UPLINK: Uuid = Uuid::from_u128(0x0E);

pub const DP_PORT_A: u32 = 1;
pub const DP_PORT_B: u32 = 2;
pub const DP_UPLINK: u32 = 3;

pub const MAC_A: &str = "02:DD:AA:DD:AA:03";
pub const MAC_B: &str = "02:00:00:00:00:0B";
pub const RTR_BRIDGE_MAC: &str = "02:AA:00:00:00:02";
pub const RTR_UPLINK_MAC: &str = "02:AA:00:00:00:01";
pub const NEXT_HOP_MAC: &str = "02:BB:00:00:00:01";

pub const IP_A: &str = "10.0.0.5";
pub const RTR_BRIDGE_IP: &str = "10.0.0.1";
pub const RTR_UPLINK_IP: &str = "172.16.0.1";
pub const NEXT_HOP_IP: &str = "172.16.0.254";

pub fn mac(s: &str) -> MacAddr {
    s.parse().unwrap()
}

pub fn ip4(s: &str) -> Ipv4Addr {
    s.parse().unwrap()
}

pub fn exterior_port(
    id: Uuid,
    device: Uuid,
    dp_port: u32,
    dhcp: Option<DhcpSubnet>,
) -> Port {
    Port {
        id,
        device,
        admin_state_up: true,
        infilter: None,
        outfilter: None,
        vlan_id: None,
        kind: PortKind::Exterior {
            dp_port,
            port_groups: BTreeSet::new(),
            dhcp,
        },
    }
}

pub fn interior_port(id: Uuid, device: Uuid, peer: Uuid) -> Port {
    Port {
        id,
        device,
        admin_state_up: true,
        infilter: None,
        outfilter: None,
        vlan_id: None,
        kind: PortKind::Interior { peer },
    }
}

pub fn dhcp_subnet() -> DhcpSubnet {
    DhcpSubnet {
        subnet: "192.168.222.0/24".parse().unwrap(),
        server_addr: ip4("192.168.222.1"),
        server_mac: mac("02:DD:00:00:00:01"),
        lease_secs: 86_400,
        hosts: vec![DhcpHost {
            mac: mac(MAC_A),
            ip: ip4("192.168.222.2"),
        }],
    }
}

pub struct Fixture {
    pub store: Arc<StaticTopology>,
    pub topology: TopologyClient,
    pub conn_cache: Arc<InMemoryConnCache>,
    pub emitter: PacketEmitter,
    pub generated: UnboundedReceiver<GeneratedPacket>,
    pub cfg: SimConfig,
    pub bridge: Arc<Bridge>,
    pub router: Arc<Router>,
}

impl Fixture {
    /// Build the reference topology:
    ///
    /// ```text
    /// portA (dp 1) --+
    ///                |-- bridge --- router --- uplink (dp 3)
    /// portB (dp 2) --+
    /// ```
    pub fn new() -> Self {
        let store = Arc::new(StaticTopology::new());

        let bridge = Arc::new(Bridge {
            id: BRIDGE,
            admin_state_up: true,
            infilter: None,
            outfilter: None,
            flood_port_set: FLOOD_SET,
            mac_table: Arc::new(SharedMap::new()),
            vlan_ports: BTreeMap::new(),
        });

        let mut rtr_ports = BTreeMap::new();
        rtr_ports.insert(
            RTR_TO_BRIDGE,
            RouterPortCfg {
                mac: mac(RTR_BRIDGE_MAC),
                ip: ip4(RTR_BRIDGE_IP),
                net: "10.0.0.0/24".parse().unwrap(),
            },
        );
        rtr_ports.insert(
            UPLINK,
            RouterPortCfg {
                mac: mac(RTR_UPLINK_MAC),
                ip: ip4(RTR_UPLINK_IP),
                net: "172.16.0.0/24".parse().unwrap(),
            },
        );

        let router = Arc::new(Router {
            id: ROUTER,
            admin_state_up: true,
            infilter: None,
            outfilter: None,
            routes: RoutingTable::new(vec![
                Route {
                    dst: IpCidr::Ip4("10.0.0.0/24".parse().unwrap()),
                    src: None,
                    next_hop: NextHop::Port {
                        port: RTR_TO_BRIDGE,
                        gateway: None,
                    },
                    weight: 100,
                },
                Route {
                    dst: IpCidr::Ip4("0.0.0.0/0".parse().unwrap()),
                    src: None,
                    next_hop: NextHop::Port {
                        port: UPLINK,
                        gateway: Some(ip4(NEXT_HOP_IP).into()),
                    },
                    weight: 100,
                },
            ]),
            arp_cache: Arc::new(SharedMap::new()),
            ports: rtr_ports,
        });

        store.insert(Device::Bridge(bridge.clone()));
        store.insert(Device::Router(router.clone()));
        store.insert(Device::Port(Arc::new(exterior_port(
            PORT_A,
            BRIDGE,
            DP_PORT_A,
            Some(dhcp_subnet()),
        ))));
        store.insert(Device::Port(Arc::new(exterior_port(
            PORT_B,
            BRIDGE,
            DP_PORT_B,
            None,
        ))));
        store.insert(Device::Port(Arc::new(interior_port(
            BRIDGE_TO_RTR,
            BRIDGE,
            RTR_TO_BRIDGE,
        ))));
        store.insert(Device::Port(Arc::new(interior_port(
            RTR_TO_BRIDGE,
            ROUTER,
            BRIDGE_TO_RTR,
        ))));
        store.insert(Device::Port(Arc::new(exterior_port(
            UPLINK,
            ROUTER,
            DP_UPLINK,
            None,
        ))));

        let (emitter, generated) = PacketEmitter::channel();
        Self {
            topology: TopologyClient::new(store.clone()),
            store,
            conn_cache: Arc::new(InMemoryConnCache::new()),
            emitter,
            generated,
            cfg: SimConfig::default(),
            bridge,
            router,
        }
    }

    /// Teach the bridge where the router (and the VMs) live, as if
    /// traffic had already flowed.
    pub fn seed_bridge_macs(&self) {
        self.bridge.mac_table.set(
            MacTableKey { vlan: None, mac: mac(RTR_BRIDGE_MAC) },
            BRIDGE_TO_RTR,
        );
        self.bridge
            .mac_table
            .set(MacTableKey { vlan: None, mac: mac(MAC_A) }, PORT_A);
        self.bridge
            .mac_table
            .set(MacTableKey { vlan: None, mac: mac(MAC_B) }, PORT_B);
    }

    pub fn expiry(&self) -> Instant {
        Instant::now() + Duration::from_secs(5)
    }

    pub async fn simulate(
        &self,
        frame: Vec<u8>,
        wc_match: WildcardMatch,
        cookie: Option<u64>,
        generated_egress: Option<Uuid>,
    ) -> SimulationResult {
        let ctx = PacketContext::new(
            frame,
            wc_match,
            cookie,
            None,
            generated_egress,
            self.expiry(),
        );
        Coordinator::new(
            ctx,
            self.topology.clone(),
            self.conn_cache.clone(),
            self.emitter.clone(),
            self.cfg,
        )
        .simulate()
        .await
    }
}

/// A match for a UDP packet from `src` to `dst`.
pub fn udp_match(
    in_port: Option<Uuid>,
    eth_src: &str,
    eth_dst: &str,
    net_src: &str,
    net_dst: &str,
    tp_src: u16,
    tp_dst: u16,
) -> WildcardMatch {
    WildcardMatch {
        input_port: in_port,
        eth_src: Some(mac(eth_src)),
        eth_dst: Some(mac(eth_dst)),
        ether_type: Some(simnet_api::ETHER_TYPE_IPV4),
        net_src: Some(ip4(net_src).into()),
        net_dst: Some(ip4(net_dst).into()),
        net_proto: Some(Protocol::UDP),
        net_tos: Some(0),
        net_ttl: Some(64),
        frag_type: Some(FragmentType::None),
        tp_src: Some(tp_src),
        tp_dst: Some(tp_dst),
        ..Default::default()
    }
}

fn internet_checksum(data: &[u8]) -> u16 {
    let mut sum = 0u32;
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    while sum > 0xFFFF {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }
    !(sum as u16)
}

/// A hand-assembled Ethernet + IPv4 + UDP frame.
pub fn udp_frame(
    eth_src: &str,
    eth_dst: &str,
    net_src: &str,
    net_dst: &str,
    tp_src: u16,
    tp_dst: u16,
    payload: &[u8],
) -> Vec<u8> {
    let udp_len = 8 + payload.len();
    let total_len = 20 + udp_len;

    let mut frame = Vec::with_capacity(14 + total_len);
    frame.extend_from_slice(&mac(eth_dst).bytes());
    frame.extend_from_slice(&mac(eth_src).bytes());
    frame.extend_from_slice(&simnet_api::ETHER_TYPE_IPV4.to_be_bytes());

    let mut ip = vec![0u8; 20];
    ip[0] = 0x45;
    ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
    ip[8] = 64;
    ip[9] = 17;
    ip[12..16].copy_from_slice(&ip4(net_src).octets());
    ip[16..20].copy_from_slice(&ip4(net_dst).octets());
    let csum = internet_checksum(&ip);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());
    frame.extend_from_slice(&ip);

    frame.extend_from_slice(&tp_src.to_be_bytes());
    frame.extend_from_slice(&tp_dst.to_be_bytes());
    frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
    frame.extend_from_slice(&[0, 0]);
    frame.extend_from_slice(payload);
    frame
}

/// Unwrap a flow-install result.
pub fn expect_flow(
    result: SimulationResult,
) -> (VirtualFlow, Vec<simnet::sim::FlowRemoved>, BTreeSet<simnet::sim::FlowTag>)
{
    match result {
        SimulationResult::AddVirtualWildcardFlow { flow, callbacks, tags } => {
            (flow, callbacks, tags)
        }
        other => panic!("expected AddVirtualWildcardFlow, got {other:?}"),
    }
}
