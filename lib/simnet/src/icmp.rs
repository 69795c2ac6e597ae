// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! ICMPv4 error synthesis.
//!
//! Routers answer undeliverable packets with ICMP errors quoting the
//! triggering IPv4 header plus its first eight payload bytes. The
//! quote is copied verbatim from the original frame (fragmentation
//! bits included), so the message body is assembled by hand and only
//! the outer IPv4/Ethernet encapsulation goes through smoltcp reprs.

use simnet_api::MacAddr;
use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::EthernetFrame;
use smoltcp::wire::EthernetProtocol;
use smoltcp::wire::EthernetRepr;
use smoltcp::wire::IpProtocol;
use smoltcp::wire::Ipv4Packet;
use smoltcp::wire::Ipv4Repr;
use std::net::Ipv4Addr;

pub const TYPE_UNREACHABLE: u8 = 3;
pub const TYPE_TIME_EXCEEDED: u8 = 11;
pub const TYPE_PARAMETER_PROBLEM: u8 = 12;

/// ICMP types that quote an offending packet; only these may appear
/// in an `IcmpError` set-key.
pub fn is_error_type(icmp_type: u8) -> bool {
    matches!(
        icmp_type,
        TYPE_UNREACHABLE | TYPE_TIME_EXCEEDED | TYPE_PARAMETER_PROBLEM
    )
}

/// The error messages a router generates.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum IcmpErrorKind {
    TimeExceeded,
    NetUnreachable,
    HostUnreachable,
    AdminProhibited,
    FragNeeded { mtu: u16 },
}

impl IcmpErrorKind {
    fn type_code(&self) -> (u8, u8) {
        match self {
            Self::TimeExceeded => (TYPE_TIME_EXCEEDED, 0),
            Self::NetUnreachable => (TYPE_UNREACHABLE, 0),
            Self::HostUnreachable => (TYPE_UNREACHABLE, 1),
            Self::AdminProhibited => (TYPE_UNREACHABLE, 13),
            Self::FragNeeded { .. } => (TYPE_UNREACHABLE, 4),
        }
    }
}

/// RFC 1071 internet checksum.
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

/// Offset of the IPv4 header within `frame`, skipping the Ethernet
/// header and any VLAN tags.
fn ipv4_offset(frame: &[u8]) -> Option<usize> {
    if frame.len() < 14 {
        return None;
    }
    let mut off = 12;
    loop {
        let et = u16::from_be_bytes([frame[off], frame[off + 1]]);
        match et {
            simnet_api::ETHER_TYPE_VLAN
            | simnet_api::ETHER_TYPE_PROVIDER_BRIDGING => {
                off += 4;
                if off + 2 > frame.len() {
                    return None;
                }
            }
            simnet_api::ETHER_TYPE_IPV4 => return Some(off + 2),
            _ => return None,
        }
    }
}

/// The IPv4 portion of `frame`.
fn ipv4_of_frame(frame: &[u8]) -> Option<&[u8]> {
    frame.get(ipv4_offset(frame)?..)
}

/// Turn an ICMP Echo Request aimed at a router port into the Echo
/// Reply frame. `None` when the frame is not an echo request.
pub fn gen_echo_reply(frame: &[u8]) -> Option<Vec<u8>> {
    let ip_off = ipv4_offset(frame)?;
    let ip_bytes = frame.get(ip_off..)?;
    if ip_bytes.len() < 20 || ip_bytes[0] >> 4 != 4 {
        return None;
    }
    let ihl = usize::from(ip_bytes[0] & 0x0F) * 4;
    let total_len = usize::from(u16::from_be_bytes([ip_bytes[2], ip_bytes[3]]));
    if ip_bytes[9] != u8::from(IpProtocol::Icmp)
        || ip_bytes.len() < total_len
        || total_len < ihl + 8
    {
        return None;
    }
    // Echo Request, code 0.
    if ip_bytes[ihl] != 8 || ip_bytes[ihl + 1] != 0 {
        return None;
    }

    let mut out = frame.to_vec();

    // Swap Ethernet addresses.
    let (dst, rest) = out.split_at_mut(6);
    dst.swap_with_slice(&mut rest[..6]);

    // Swap IP endpoints, reset TTL, refill the header checksum.
    let ip = &mut out[ip_off..ip_off + total_len];
    for i in 0..4 {
        ip.swap(12 + i, 16 + i);
    }
    ip[8] = 64;
    ip[10] = 0;
    ip[11] = 0;
    let csum = internet_checksum(&ip[..ihl]);
    ip[10..12].copy_from_slice(&csum.to_be_bytes());

    // Flip the ICMP type and refill its checksum.
    ip[ihl] = 0;
    ip[ihl + 2] = 0;
    ip[ihl + 3] = 0;
    let csum = internet_checksum(&ip[ihl..]);
    ip[ihl + 2..ihl + 4].copy_from_slice(&csum.to_be_bytes());

    Some(out)
}

/// Generate an ICMPv4 error answering `frame`, sent from
/// (`src_mac`, `src_ip`) back to the frame's source. `None` when the
/// frame does not contain IPv4, or already carries an ICMP error
/// (errors never beget errors).
pub fn gen_icmp_error(
    kind: IcmpErrorKind,
    src_mac: MacAddr,
    src_ip: Ipv4Addr,
    frame: &[u8],
) -> Option<Vec<u8>> {
    let eth = EthernetFrame::new_checked(frame).ok()?;
    let ip_bytes = ipv4_of_frame(frame)?;
    if ip_bytes.len() < 20 || ip_bytes[0] >> 4 != 4 {
        return None;
    }

    let ihl = usize::from(ip_bytes[0] & 0x0F) * 4;
    if ihl < 20 || ip_bytes.len() < ihl {
        return None;
    }

    // Never answer an ICMP error with another.
    if ip_bytes[9] == u8::from(IpProtocol::Icmp)
        && ip_bytes.get(ihl).is_some_and(|ty| is_error_type(*ty))
    {
        return None;
    }

    let dst_ip = Ipv4Addr::new(
        ip_bytes[12],
        ip_bytes[13],
        ip_bytes[14],
        ip_bytes[15],
    );
    let dst_mac = MacAddr::from(eth.src_addr());

    let quote_len = (ihl + 8).min(ip_bytes.len());
    let (icmp_type, icmp_code) = kind.type_code();

    let mut icmp = Vec::with_capacity(8 + quote_len);
    icmp.extend_from_slice(&[icmp_type, icmp_code, 0, 0]);
    match kind {
        IcmpErrorKind::FragNeeded { mtu } => {
            icmp.extend_from_slice(&[0, 0]);
            icmp.extend_from_slice(&mtu.to_be_bytes());
        }
        _ => icmp.extend_from_slice(&[0, 0, 0, 0]),
    }
    icmp.extend_from_slice(&ip_bytes[..quote_len]);
    let csum = internet_checksum(&icmp);
    icmp[2..4].copy_from_slice(&csum.to_be_bytes());

    let ip_repr = Ipv4Repr {
        src_addr: src_ip,
        dst_addr: dst_ip,
        next_header: IpProtocol::Icmp,
        payload_len: icmp.len(),
        hop_limit: 64,
    };
    let eth_repr = EthernetRepr {
        src_addr: src_mac.into(),
        dst_addr: dst_mac.into(),
        ethertype: EthernetProtocol::Ipv4,
    };

    let mut buf =
        vec![0u8; eth_repr.buffer_len() + ip_repr.buffer_len() + icmp.len()];
    let mut out_eth = EthernetFrame::new_unchecked(&mut buf);
    eth_repr.emit(&mut out_eth);
    let mut out_ip = Ipv4Packet::new_unchecked(out_eth.payload_mut());
    ip_repr.emit(&mut out_ip, &ChecksumCapabilities::default());
    out_ip.payload_mut().copy_from_slice(&icmp);
    Some(buf)
}

#[cfg(test)]
pub(crate) mod test {
    use super::*;
    use smoltcp::wire::Icmpv4Packet;

    /// An Ethernet + IPv4 + UDP frame assembled by hand, so the test
    /// controls every header bit (including fragmentation).
    pub(crate) fn udp_frame(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
        src_port: u16,
        dst_port: u16,
        payload: &[u8],
    ) -> Vec<u8> {
        let udp_len = 8 + payload.len();
        let total_len = 20 + udp_len;

        let mut frame = Vec::with_capacity(14 + total_len);
        frame.extend_from_slice(&dst_mac.bytes());
        frame.extend_from_slice(&src_mac.bytes());
        frame.extend_from_slice(
            &simnet_api::ETHER_TYPE_IPV4.to_be_bytes(),
        );

        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = 17;
        ip[12..16].copy_from_slice(&src_ip.octets());
        ip[16..20].copy_from_slice(&dst_ip.octets());
        let csum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&csum.to_be_bytes());
        frame.extend_from_slice(&ip);

        frame.extend_from_slice(&src_port.to_be_bytes());
        frame.extend_from_slice(&dst_port.to_be_bytes());
        frame.extend_from_slice(&(udp_len as u16).to_be_bytes());
        frame.extend_from_slice(&[0, 0]);
        frame.extend_from_slice(payload);
        frame
    }

    #[test]
    fn time_exceeded_quotes_the_trigger() {
        let src_mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let rtr_mac: MacAddr = "02:00:00:00:00:FE".parse().unwrap();
        let frame = udp_frame(
            src_mac,
            rtr_mac,
            "10.0.0.5".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            40000,
            53,
            b"payload.",
        );

        let reply = gen_icmp_error(
            IcmpErrorKind::TimeExceeded,
            rtr_mac,
            "10.0.0.1".parse().unwrap(),
            &frame,
        )
        .unwrap();

        let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
        assert_eq!(MacAddr::from(eth.dst_addr()), src_mac);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.dst_addr(), "10.0.0.5".parse::<Ipv4Addr>().unwrap());
        assert_eq!(ip.next_header(), IpProtocol::Icmp);

        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), smoltcp::wire::Icmpv4Message::TimeExceeded);
        assert!(icmp.verify_checksum());

        // The quote starts with the original IPv4 header.
        let quote = &ip.payload()[8..];
        assert_eq!(quote[0], 0x45);
        assert_eq!(&quote[12..16], &[10, 0, 0, 5]);
        // And covers exactly header + 8 payload bytes.
        assert_eq!(quote.len(), 28);
    }

    #[test]
    fn frag_needed_carries_mtu() {
        let frame = udp_frame(
            "02:00:00:00:00:01".parse().unwrap(),
            "02:00:00:00:00:FE".parse().unwrap(),
            "10.0.0.5".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            40000,
            53,
            b"x",
        );
        let reply = gen_icmp_error(
            IcmpErrorKind::FragNeeded { mtu: 1450 },
            "02:00:00:00:00:FE".parse().unwrap(),
            "10.0.0.1".parse().unwrap(),
            &frame,
        )
        .unwrap();

        let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        let icmp = ip.payload();
        assert_eq!(icmp[0], TYPE_UNREACHABLE);
        assert_eq!(icmp[1], 4);
        assert_eq!(u16::from_be_bytes([icmp[6], icmp[7]]), 1450);
    }

    #[test]
    fn no_error_for_an_error() {
        let rtr_mac: MacAddr = "02:00:00:00:00:FE".parse().unwrap();
        let frame = udp_frame(
            "02:00:00:00:00:01".parse().unwrap(),
            rtr_mac,
            "10.0.0.5".parse().unwrap(),
            "8.8.8.8".parse().unwrap(),
            40000,
            53,
            b"x",
        );
        // First error is fine...
        let reply = gen_icmp_error(
            IcmpErrorKind::NetUnreachable,
            rtr_mac,
            "10.0.0.1".parse().unwrap(),
            &frame,
        )
        .unwrap();
        // ...but an error about the error is suppressed.
        assert_eq!(
            gen_icmp_error(
                IcmpErrorKind::TimeExceeded,
                rtr_mac,
                "10.0.0.1".parse().unwrap(),
                &reply,
            ),
            None
        );
    }

    fn echo_request_frame(
        src_mac: MacAddr,
        dst_mac: MacAddr,
        src_ip: Ipv4Addr,
        dst_ip: Ipv4Addr,
    ) -> Vec<u8> {
        let payload = b"abcdefgh";
        let mut icmp = vec![8u8, 0, 0, 0, 0x12, 0x34, 0, 1];
        icmp.extend_from_slice(payload);
        let csum = internet_checksum(&icmp);
        icmp[2..4].copy_from_slice(&csum.to_be_bytes());

        let total_len = 20 + icmp.len();
        let mut frame = Vec::new();
        frame.extend_from_slice(&dst_mac.bytes());
        frame.extend_from_slice(&src_mac.bytes());
        frame.extend_from_slice(
            &simnet_api::ETHER_TYPE_IPV4.to_be_bytes(),
        );
        let mut ip = vec![0u8; 20];
        ip[0] = 0x45;
        ip[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
        ip[8] = 64;
        ip[9] = 1;
        ip[12..16].copy_from_slice(&src_ip.octets());
        ip[16..20].copy_from_slice(&dst_ip.octets());
        let csum = internet_checksum(&ip);
        ip[10..12].copy_from_slice(&csum.to_be_bytes());
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&icmp);
        frame
    }

    #[test]
    fn echo_reply_swaps_endpoints() {
        let src_mac: MacAddr = "02:00:00:00:00:01".parse().unwrap();
        let rtr_mac: MacAddr = "02:00:00:00:00:FE".parse().unwrap();
        let src_ip: Ipv4Addr = "10.0.0.5".parse().unwrap();
        let rtr_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();

        let request = echo_request_frame(src_mac, rtr_mac, src_ip, rtr_ip);
        let reply = gen_echo_reply(&request).unwrap();

        let eth = EthernetFrame::new_checked(&reply[..]).unwrap();
        assert_eq!(MacAddr::from(eth.dst_addr()), src_mac);
        assert_eq!(MacAddr::from(eth.src_addr()), rtr_mac);
        let ip = Ipv4Packet::new_checked(eth.payload()).unwrap();
        assert_eq!(ip.src_addr(), rtr_ip);
        assert_eq!(ip.dst_addr(), src_ip);
        let icmp = Icmpv4Packet::new_checked(ip.payload()).unwrap();
        assert_eq!(icmp.msg_type(), smoltcp::wire::Icmpv4Message::EchoReply);
        assert!(icmp.verify_checksum());

        // Anything that isn't an echo request is left unanswered.
        assert!(gen_echo_reply(&reply).is_none());
    }

    #[test]
    fn non_ip_frames_are_ignored() {
        assert_eq!(
            gen_icmp_error(
                IcmpErrorKind::TimeExceeded,
                "02:00:00:00:00:FE".parse().unwrap(),
                "10.0.0.1".parse().unwrap(),
                &[0u8; 40],
            ),
            None
        );
    }
}
