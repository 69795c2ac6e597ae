// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ARP frame synthesis and parsing.

use simnet_api::MacAddr;
use smoltcp::wire::ArpHardware;
use smoltcp::wire::ArpOperation;
use smoltcp::wire::ArpPacket;
use smoltcp::wire::ArpRepr;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use std::net::Ipv4Addr;

/// The fields of an Ethernet/IPv4 ARP message.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ArpEthIpv4 {
    pub op: ArpOperation,
    pub sha: MacAddr,
    pub spa: Ipv4Addr,
    pub tha: MacAddr,
    pub tpa: Ipv4Addr,
}

/// Parse an ARP frame. `None` for anything that is not a well-formed
/// Ethernet/IPv4 ARP message.
pub fn parse(frame: &[u8]) -> Option<ArpEthIpv4> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    if eth.ethertype() != EthernetProtocol::Arp {
        return None;
    }
    let pkt = ArpPacket::new_checked(eth.payload()).ok()?;
    if pkt.hardware_type() != ArpHardware::Ethernet
        || pkt.protocol_type() != EthernetProtocol::Ipv4
        || pkt.hardware_len() != 6
        || pkt.protocol_len() != 4
    {
        return None;
    }

    let sha: [u8; 6] = pkt.source_hardware_addr().try_into().ok()?;
    let spa: [u8; 4] = pkt.source_protocol_addr().try_into().ok()?;
    let tha: [u8; 6] = pkt.target_hardware_addr().try_into().ok()?;
    let tpa: [u8; 4] = pkt.target_protocol_addr().try_into().ok()?;

    Some(ArpEthIpv4 {
        op: pkt.operation(),
        sha: sha.into(),
        spa: spa.into(),
        tha: tha.into(),
        tpa: tpa.into(),
    })
}

fn gen_arp(dst: MacAddr, eth_src: MacAddr, repr: ArpRepr) -> Vec<u8> {
    let eth = EthernetRepr {
        src_addr: eth_src.into(),
        dst_addr: dst.into(),
        ethertype: EthernetProtocol::Arp,
    };

    let mut buf = vec![0u8; eth.buffer_len() + repr.buffer_len()];
    let mut frame = EthernetFrame::new_unchecked(&mut buf);
    eth.emit(&mut frame);
    let mut arp = ArpPacket::new_unchecked(frame.payload_mut());
    repr.emit(&mut arp);
    buf
}

/// Generate an ARP reply from SHA/SPA to THA/TPA.
pub fn gen_arp_reply(
    sha: MacAddr,
    spa: Ipv4Addr,
    tha: MacAddr,
    tpa: Ipv4Addr,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Reply,
        source_hardware_addr: sha.into(),
        source_protocol_addr: spa,
        target_hardware_addr: tha.into(),
        target_protocol_addr: tpa,
    };
    gen_arp(tha, sha, repr)
}

/// Generate a broadcast ARP request asking for `tpa`.
pub fn gen_arp_request(
    sha: MacAddr,
    spa: Ipv4Addr,
    tpa: Ipv4Addr,
) -> Vec<u8> {
    let repr = ArpRepr::EthernetIpv4 {
        operation: ArpOperation::Request,
        source_hardware_addr: sha.into(),
        source_protocol_addr: spa,
        target_hardware_addr: MacAddr::ZERO.into(),
        target_protocol_addr: tpa,
    };
    gen_arp(MacAddr::BROADCAST, sha, repr)
}
