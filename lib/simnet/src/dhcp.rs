// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The DHCPv4 replier.
//!
//! Bridges answer DHCP on exterior ports that carry a configured
//! subnet: DISCOVER becomes OFFER, REQUEST becomes ACK, and the
//! original packet is consumed by the simulation. Addresses are
//! statically assigned per client MAC by the management plane.

use serde::Deserialize;
use serde::Serialize;
use simnet_api::Ipv4Cidr;
use simnet_api::MacAddr;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::DhcpMessageType;
use smoltcp::wire::DhcpPacket;
use smoltcp::wire::DhcpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::IpAddress;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use smoltcp::wire::UdpPacket;
use smoltcp::wire::UdpRepr;
use std::net::Ipv4Addr;
use tracing::debug;

pub const SERVER_PORT: u16 = 67;
pub const CLIENT_PORT: u16 = 68;

/// A static address assignment.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct DhcpHost {
    pub mac: MacAddr,
    pub ip: Ipv4Addr,
}

/// DHCP service configuration attached to an exterior bridge port.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct DhcpSubnet {
    pub subnet: Ipv4Cidr,

    /// The address the offer claims as server (siaddr and
    /// server-identifier) and default gateway.
    pub server_addr: Ipv4Addr,

    /// Source MAC of generated replies.
    pub server_mac: MacAddr,

    pub lease_secs: u32,

    pub hosts: Vec<DhcpHost>,
}

impl DhcpSubnet {
    fn host_for(&self, mac: MacAddr) -> Option<&DhcpHost> {
        self.hosts.iter().find(|h| h.mac == mac)
    }
}

/// Is this match plausibly a DHCP client request? A cheap pre-filter
/// so the bridge only pays for frame parsing on DHCP traffic.
pub fn is_dhcp_request(m: &crate::wildcard::WildcardMatch) -> bool {
    m.ether_type == Some(simnet_api::ETHER_TYPE_IPV4)
        && m.net_proto == Some(simnet_api::Protocol::UDP)
        && m.tp_src == Some(CLIENT_PORT)
        && m.tp_dst == Some(SERVER_PORT)
}

/// Handle a client frame against the port's subnet. Returns the reply
/// frame, or `None` when the frame is not a DHCP request this subnet
/// can answer.
pub fn handle_request(subnet: &DhcpSubnet, frame: &[u8]) -> Option<Vec<u8>> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return None;
    }
    let ip = Ipv4Packet::new_checked(eth.payload()).ok()?;
    if ip.next_header() != IpProtocol::Udp {
        return None;
    }
    let udp = UdpPacket::new_checked(ip.payload()).ok()?;
    if udp.src_port() != CLIENT_PORT || udp.dst_port() != SERVER_PORT {
        return None;
    }
    let pkt = DhcpPacket::new_checked(udp.payload()).ok()?;
    let request = DhcpRepr::parse(&pkt).ok()?;

    let reply_type = match request.message_type {
        DhcpMessageType::Discover => DhcpMessageType::Offer,
        DhcpMessageType::Request => DhcpMessageType::Ack,
        _ => return None,
    };

    let client_mac = MacAddr::from(request.client_hardware_address);
    let Some(host) = subnet.host_for(client_mac) else {
        debug!(%client_mac, subnet = %subnet.subnet, "no dhcp host entry");
        return None;
    };

    let reply = DhcpRepr {
        message_type: reply_type,
        transaction_id: request.transaction_id,
        secs: 0,
        client_hardware_address: client_mac.into(),
        client_ip: Ipv4Addr::UNSPECIFIED,
        your_ip: host.ip,
        server_ip: subnet.server_addr,
        router: Some(subnet.server_addr),
        subnet_mask: Some(subnet.subnet.to_mask()),
        relay_agent_ip: Ipv4Addr::UNSPECIFIED,
        broadcast: false,
        requested_ip: None,
        client_identifier: None,
        server_identifier: Some(subnet.server_addr),
        parameter_request_list: None,
        dns_servers: None,
        max_size: None,
        lease_duration: Some(subnet.lease_secs),
        renew_duration: None,
        rebind_duration: None,
        additional_options: &[],
    };

    let mut dhcp_bytes = vec![0u8; reply.buffer_len()];
    let mut dhcp_pkt = DhcpPacket::new_unchecked(&mut dhcp_bytes);
    reply.emit(&mut dhcp_pkt).ok()?;

    Some(wrap_reply(subnet, &dhcp_bytes))
}

/// Encapsulate a DHCP payload in UDP/IPv4/Ethernet, server to local
/// broadcast.
fn wrap_reply(subnet: &DhcpSubnet, payload: &[u8]) -> Vec<u8> {
    let caps = ChecksumCapabilities::default();

    let udp_repr =
        UdpRepr { src_port: SERVER_PORT, dst_port: CLIENT_PORT };
    let src = IpAddress::Ipv4(subnet.server_addr);
    let dst = IpAddress::Ipv4(Ipv4Addr::BROADCAST);

    let ip_repr = Ipv4Repr {
        src_addr: subnet.server_addr,
        dst_addr: Ipv4Addr::BROADCAST,
        next_header: IpProtocol::Udp,
        payload_len: udp_repr.header_len() + payload.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: subnet.server_mac.into(),
        dst_addr: MacAddr::BROADCAST.into(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buf = vec![
        0u8;
        eth_repr.buffer_len()
            + ip_repr.buffer_len()
            + udp_repr.header_len()
            + payload.len()
    ];
    let mut eth = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut eth);
    let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
    ip_repr.emit(&mut ip, &caps);
    let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
    udp_repr.emit(
        &mut udp,
        &src,
        &dst,
        payload.len(),
        |buf| buf.copy_from_slice(payload),
        &caps,
    );
    buf
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;

    pub(crate) fn subnet() -> DhcpSubnet {
        DhcpSubnet {
            subnet: "192.168.222.0/24".parse().unwrap(),
            server_addr: "192.168.222.1".parse().unwrap(),
            server_mac: "02:DD:00:00:00:01".parse().unwrap(),
            lease_secs: 86_400,
            hosts: vec![DhcpHost {
                mac: "02:DD:AA:DD:AA:03".parse().unwrap(),
                ip: "192.168.222.2".parse().unwrap(),
            }],
        }
    }

    /// A broadcast DHCP client frame as a guest would send it.
    pub(crate) fn client_frame(
        mac: MacAddr,
        message_type: DhcpMessageType,
        transaction_id: u32,
    ) -> Vec<u8> {
        let request = DhcpRepr {
            message_type,
            transaction_id,
            secs: 0,
            client_hardware_address: mac.into(),
            client_ip: Ipv4Addr::UNSPECIFIED,
            your_ip: Ipv4Addr::UNSPECIFIED,
            server_ip: Ipv4Addr::UNSPECIFIED,
            router: None,
            subnet_mask: None,
            relay_agent_ip: Ipv4Addr::UNSPECIFIED,
            broadcast: true,
            requested_ip: None,
            client_identifier: None,
            server_identifier: None,
            parameter_request_list: None,
            dns_servers: None,
            max_size: None,
            lease_duration: None,
            renew_duration: None,
            rebind_duration: None,
            additional_options: &[],
        };
        let mut dhcp_bytes = vec![0u8; request.buffer_len()];
        let mut dhcp_pkt = DhcpPacket::new_unchecked(&mut dhcp_bytes);
        request.emit(&mut dhcp_pkt).unwrap();

        let caps = ChecksumCapabilities::default();
        let udp_repr =
            UdpRepr { src_port: CLIENT_PORT, dst_port: SERVER_PORT };
        let src = IpAddress::Ipv4(Ipv4Addr::UNSPECIFIED);
        let dst = IpAddress::Ipv4(Ipv4Addr::BROADCAST);
        let ip_repr = Ipv4Repr {
            src_addr: Ipv4Addr::UNSPECIFIED,
            dst_addr: Ipv4Addr::BROADCAST,
            next_header: IpProtocol::Udp,
            payload_len: udp_repr.header_len() + dhcp_bytes.len(),
            hop_limit: 64,
        };
        let eth_repr = EthernetRepr {
            src_addr: mac.into(),
            dst_addr: MacAddr::BROADCAST.into(),
            ethertype: EthernetProtocol::Ipv4,
        };

        let mut buf = vec![
            0u8;
            eth_repr.buffer_len()
                + ip_repr.buffer_len()
                + udp_repr.header_len()
                + dhcp_bytes.len()
        ];
        let mut eth = EthernetFrame::new_unchecked(&mut buf);
        eth_repr.emit(&mut eth);
        let mut ip = Ipv4Packet::new_unchecked(eth.payload_mut());
        ip_repr.emit(&mut ip, &caps);
        let mut udp = UdpPacket::new_unchecked(ip.payload_mut());
        udp_repr.emit(
            &mut udp,
            &src,
            &dst,
            dhcp_bytes.len(),
            |buf| buf.copy_from_slice(&dhcp_bytes),
            &caps,
        );
        buf
    }

    fn parse_reply(frame: &[u8]) -> (DhcpMessageType, Ipv4Addr, Ipv4Addr) {
        let eth = EthernetFrame::new_checked(frame).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let udp = UdpPacket::new_checked(ip.payload()).unwrap();
        assert_eq!(udp.src_port(), SERVER_PORT);
        assert_eq!(udp.dst_port(), CLIENT_PORT);
        let pkt = DhcpPacket::new_checked(udp.payload()).unwrap();
        let repr = DhcpRepr::parse(&pkt).unwrap();
        (repr.message_type, repr.your_ip, repr.server_ip)
    }

    #[test]
    fn discover_yields_offer() {
        let frame = client_frame(
            "02:DD:AA:DD:AA:03".parse().unwrap(),
            DhcpMessageType::Discover,
            0x1234,
        );
        let reply = handle_request(&subnet(), &frame).unwrap();
        let (mt, yiaddr, siaddr) = parse_reply(&reply);
        assert_eq!(mt, DhcpMessageType::Offer);
        assert_eq!(yiaddr, "192.168.222.2".parse::<Ipv4Addr>().unwrap());
        assert_eq!(siaddr, "192.168.222.1".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn request_yields_ack() {
        let frame = client_frame(
            "02:DD:AA:DD:AA:03".parse().unwrap(),
            DhcpMessageType::Request,
            0x99,
        );
        let reply = handle_request(&subnet(), &frame).unwrap();
        let (mt, yiaddr, _) = parse_reply(&reply);
        assert_eq!(mt, DhcpMessageType::Ack);
        assert_eq!(yiaddr, "192.168.222.2".parse::<Ipv4Addr>().unwrap());
    }

    #[test]
    fn unknown_client_gets_nothing() {
        let frame = client_frame(
            "02:EE:EE:EE:EE:EE".parse().unwrap(),
            DhcpMessageType::Discover,
            0x1,
        );
        assert!(handle_request(&subnet(), &frame).is_none());
    }

    #[test]
    fn non_dhcp_traffic_is_ignored() {
        assert!(handle_request(&subnet(), &[0u8; 60]).is_none());
    }
}
