// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The shape of datapath flow actions.
//!
//! A simulation's output is an ordered list of [`FlowAction`]s paired
//! with a match. The datapath shim encodes these to the kernel; this
//! crate only fixes their vocabulary.

use crate::ip::Protocol;
use crate::mac::MacAddr;
use core::fmt;
use core::fmt::Display;
use serde::Deserialize;
use serde::Serialize;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;
use uuid::Uuid;

pub const ETHER_TYPE_IPV4: u16 = 0x0800;
pub const ETHER_TYPE_ARP: u16 = 0x0806;
pub const ETHER_TYPE_VLAN: u16 = 0x8100;
pub const ETHER_TYPE_IPV6: u16 = 0x86DD;

/// The 802.1ad (provider bridging) tag protocol id, used for every
/// VLAN push except the innermost.
pub const ETHER_TYPE_PROVIDER_BRIDGING: u16 = 0x88A8;

/// TCI bit indicating a VLAN tag is present, OR'd with the 12-bit
/// VLAN id in pushed tags.
pub const VLAN_TAG_PRESENT: u16 = 0x1000;

/// Mask for the 12-bit VLAN id within a TCI.
pub const VLAN_VID_MASK: u16 = 0x0FFF;

/// The IP fragmentation class of a packet, derived from the IP header
/// fragmentation fields.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum FragmentType {
    /// Not a fragment.
    None,
    /// The first fragment: offset zero, more-fragments set.
    First,
    /// Any fragment with a non-zero offset.
    Later,
}

impl Display for FragmentType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::None => write!(f, "unfragmented"),
            Self::First => write!(f, "first-fragment"),
            Self::Later => write!(f, "later-fragment"),
        }
    }
}

/// A header rewrite key carried by [`FlowAction::SetKey`].
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowKey {
    Ethernet { src: MacAddr, dst: MacAddr },
    Ipv4 { src: Ipv4Addr, dst: Ipv4Addr, proto: Protocol, tos: u8, ttl: u8 },
    Ipv6 { src: Ipv6Addr, dst: Ipv6Addr, proto: Protocol, hlimit: u8 },
    Tcp { src: u16, dst: u16 },
    Udp { src: u16, dst: u16 },
    IcmpError { icmp_type: u8, icmp_code: u8, data: Vec<u8> },
    Tunnel { id: u64 },
}

impl Display for FlowKey {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ethernet { src, dst } => write!(f, "eth[{src}->{dst}]"),
            Self::Ipv4 { src, dst, ttl, .. } => {
                write!(f, "ipv4[{src}->{dst},ttl={ttl}]")
            }
            Self::Ipv6 { src, dst, hlimit, .. } => {
                write!(f, "ipv6[{src}->{dst},hlim={hlimit}]")
            }
            Self::Tcp { src, dst } => write!(f, "tcp[{src}->{dst}]"),
            Self::Udp { src, dst } => write!(f, "udp[{src}->{dst}]"),
            Self::IcmpError { icmp_type, icmp_code, .. } => {
                write!(f, "icmp-err[{icmp_type}/{icmp_code}]")
            }
            Self::Tunnel { id } => write!(f, "tunnel[{id}]"),
        }
    }
}

/// A single datapath action.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum FlowAction {
    /// Emit the packet out a datapath port.
    Output(u32),

    /// Emit the packet to every member of a port set. Expansion to
    /// member ports happens at the datapath boundary.
    OutputPortSet(Uuid),

    /// Strip the outermost VLAN tag.
    PopVlan,

    /// Push a VLAN tag with the given tag protocol id and TCI.
    PushVlan { tpid: u16, tci: u16 },

    /// Rewrite one header per the key.
    SetKey(FlowKey),
}

impl Display for FlowAction {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Output(port) => write!(f, "output:{port}"),
            Self::OutputPortSet(id) => write!(f, "output-set:{id}"),
            Self::PopVlan => write!(f, "pop-vlan"),
            Self::PushVlan { tpid, tci } => {
                write!(f, "push-vlan:{tpid:#06x}/{tci:#06x}")
            }
            Self::SetKey(key) => write!(f, "set:{key}"),
        }
    }
}

impl FlowAction {
    /// The TCI a pushed tag carries for a given VLAN id.
    pub fn vlan_tci(vid: u16) -> u16 {
        (vid & VLAN_VID_MASK) | VLAN_TAG_PRESENT
    }
}
