// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The wildcard match key.
//!
//! A [`WildcardMatch`] is the mutable header view a simulation works
//! on: each field is either present with a value or absent, and two
//! matches are equal exactly when their present fields and values
//! coincide. The coordinator snapshots the ingress match, lets
//! devices mutate a working copy, and derives the datapath actions
//! from the difference between the two.

use serde::Deserialize;
use serde::Serialize;
use simnet_api::FlowAction;
use simnet_api::FlowKey;
use simnet_api::FragmentType;
use simnet_api::MacAddr;
use simnet_api::Protocol;
use std::collections::BTreeSet;
use std::net::IpAddr;
use uuid::Uuid;

/// A set of header fields with presence semantics. `None` means the
/// field is wildcarded: any value matches, and the field does not
/// participate in equality in any way beyond its absence.
#[derive(Clone, Debug, Default, Deserialize, Eq, PartialEq, Serialize)]
pub struct WildcardMatch {
    /// The virtual port the packet entered on.
    pub input_port: Option<Uuid>,

    pub eth_src: Option<MacAddr>,
    pub eth_dst: Option<MacAddr>,
    pub ether_type: Option<u16>,

    /// VLAN tag stack, outermost tag first. An empty stack means the
    /// frame is untagged; the stack participates in equality like any
    /// other field.
    pub vlan_ids: Vec<u16>,

    pub net_src: Option<IpAddr>,
    pub net_dst: Option<IpAddr>,
    pub net_proto: Option<Protocol>,
    pub net_tos: Option<u8>,
    pub net_ttl: Option<u8>,
    pub frag_type: Option<FragmentType>,

    /// Transport source: TCP/UDP source port, or the ICMP type.
    pub tp_src: Option<u16>,

    /// Transport destination: TCP/UDP destination port, or the ICMP
    /// code.
    pub tp_dst: Option<u16>,

    /// For ICMP errors: the quoted header + leading payload bytes.
    pub icmp_data: Option<Vec<u8>>,

    /// Port groups the ingress port belongs to, for rule conditions.
    pub port_groups: Option<BTreeSet<Uuid>>,
}

impl WildcardMatch {
    pub fn new() -> Self {
        Self::default()
    }

    /// Is the frame an L2 broadcast or multicast?
    pub fn is_eth_multicast(&self) -> bool {
        self.eth_dst.map(|dst| dst.is_multicast()).unwrap_or(false)
    }

    /// The outermost VLAN tag, if the frame is tagged.
    pub fn outer_vlan(&self) -> Option<u16> {
        self.vlan_ids.first().copied()
    }

    pub fn push_vlan(&mut self, vid: u16) {
        self.vlan_ids.insert(0, vid);
    }

    pub fn pop_vlan(&mut self) -> Option<u16> {
        if self.vlan_ids.is_empty() {
            None
        } else {
            Some(self.vlan_ids.remove(0))
        }
    }

    /// A reduced clone keeping only the ethertype (and ingress port),
    /// used for the wide drop flow installed for non-IP traffic a
    /// router cannot handle.
    pub fn project_ethertype(&self) -> Self {
        Self {
            input_port: self.input_port,
            ether_type: self.ether_type,
            ..Self::default()
        }
    }

    /// A reduced clone keeping only ethertype + fragment type: the
    /// match for the wide drop flow covering all later fragments.
    pub fn project_fragment(&self) -> Self {
        Self {
            ether_type: self.ether_type,
            frag_type: self.frag_type,
            ..Self::default()
        }
    }

    /// Replay a datapath action onto this match. Translating the diff
    /// between two matches and applying the result to the first must
    /// reproduce the second; tests lean on this.
    pub fn apply(&mut self, action: &FlowAction) {
        match action {
            FlowAction::Output(_) | FlowAction::OutputPortSet(_) => {}

            FlowAction::PopVlan => {
                let _ = self.pop_vlan();
            }

            FlowAction::PushVlan { tci, .. } => {
                self.push_vlan(tci & simnet_api::VLAN_VID_MASK);
            }

            FlowAction::SetKey(FlowKey::Ethernet { src, dst }) => {
                self.eth_src = Some(*src);
                self.eth_dst = Some(*dst);
            }

            FlowAction::SetKey(FlowKey::Ipv4 {
                src,
                dst,
                proto,
                tos,
                ttl,
            }) => {
                self.net_src = Some(IpAddr::V4(*src));
                self.net_dst = Some(IpAddr::V4(*dst));
                self.net_proto = Some(*proto);
                self.net_tos = Some(*tos);
                self.net_ttl = Some(*ttl);
            }

            FlowAction::SetKey(FlowKey::Ipv6 {
                src,
                dst,
                proto,
                hlimit,
            }) => {
                self.net_src = Some(IpAddr::V6(*src));
                self.net_dst = Some(IpAddr::V6(*dst));
                self.net_proto = Some(*proto);
                self.net_ttl = Some(*hlimit);
            }

            FlowAction::SetKey(FlowKey::Tcp { src, dst })
            | FlowAction::SetKey(FlowKey::Udp { src, dst }) => {
                self.tp_src = Some(*src);
                self.tp_dst = Some(*dst);
            }

            FlowAction::SetKey(FlowKey::IcmpError {
                icmp_type,
                icmp_code,
                data,
            }) => {
                self.tp_src = Some(u16::from(*icmp_type));
                self.tp_dst = Some(u16::from(*icmp_code));
                self.icmp_data = Some(data.clone());
            }

            FlowAction::SetKey(FlowKey::Tunnel { .. }) => {}
        }
    }
}
