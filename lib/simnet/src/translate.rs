// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Match-diff translation.
//!
//! A simulation records its header rewrites implicitly, as the
//! difference between the ingress-time match and the final working
//! match. This module turns that difference into the minimal ordered
//! datapath action list. The emission order is fixed (Ethernet, IP,
//! VLANs, ICMP error data, transport), and replaying the produced
//! actions onto the original match must reproduce the final one.

use crate::icmp;
use crate::wildcard::WildcardMatch;
use simnet_api::ETHER_TYPE_PROVIDER_BRIDGING;
use simnet_api::ETHER_TYPE_VLAN;
use simnet_api::FlowAction;
use simnet_api::FlowKey;
use simnet_api::Protocol;
use std::net::IpAddr;

/// Compute the actions that rewrite `orig` into `modif`.
pub fn actions_for_transition(
    orig: &WildcardMatch,
    modif: &WildcardMatch,
) -> Vec<FlowAction> {
    let mut actions = Vec::new();

    if orig.eth_src != modif.eth_src || orig.eth_dst != modif.eth_dst {
        if let (Some(src), Some(dst)) = (modif.eth_src, modif.eth_dst) {
            actions.push(FlowAction::SetKey(FlowKey::Ethernet { src, dst }));
        }
    }

    if orig.net_src != modif.net_src
        || orig.net_dst != modif.net_dst
        || orig.net_ttl != modif.net_ttl
    {
        match (modif.net_src, modif.net_dst) {
            (Some(IpAddr::V4(src)), Some(IpAddr::V4(dst))) => {
                actions.push(FlowAction::SetKey(FlowKey::Ipv4 {
                    src,
                    dst,
                    proto: modif.net_proto.unwrap_or(Protocol(0)),
                    tos: modif.net_tos.unwrap_or(0),
                    ttl: modif.net_ttl.unwrap_or(0),
                }));
            }
            (Some(IpAddr::V6(src)), Some(IpAddr::V6(dst))) => {
                actions.push(FlowAction::SetKey(FlowKey::Ipv6 {
                    src,
                    dst,
                    proto: modif.net_proto.unwrap_or(Protocol(0)),
                    hlimit: modif.net_ttl.unwrap_or(0),
                }));
            }
            _ => {}
        }
    }

    vlan_actions(&orig.vlan_ids, &modif.vlan_ids, &mut actions);

    if orig.icmp_data != modif.icmp_data {
        if let (Some(data), Some(tp_src), Some(tp_dst)) =
            (&modif.icmp_data, modif.tp_src, modif.tp_dst)
        {
            let icmp_type = tp_src as u8;
            if icmp::is_error_type(icmp_type) {
                actions.push(FlowAction::SetKey(FlowKey::IcmpError {
                    icmp_type,
                    icmp_code: tp_dst as u8,
                    data: data.clone(),
                }));
            }
        }
    }

    if orig.tp_src != modif.tp_src || orig.tp_dst != modif.tp_dst {
        if let (Some(src), Some(dst)) = (modif.tp_src, modif.tp_dst) {
            match modif.net_proto {
                Some(Protocol::TCP) => {
                    actions
                        .push(FlowAction::SetKey(FlowKey::Tcp { src, dst }));
                }
                Some(Protocol::UDP) => {
                    actions
                        .push(FlowAction::SetKey(FlowKey::Udp { src, dst }));
                }
                // ICMP "ports" are the type and code; there is no
                // set-key for them.
                _ => {}
            }
        }
    }

    actions
}

/// Pop the tags `orig` carries above the retained stack bottom, then
/// push `modif`'s new tags. The first (innermost) push carries the
/// 802.1Q TPID; any further pushes are provider-bridging tags.
fn vlan_actions(orig: &[u16], modif: &[u16], actions: &mut Vec<FlowAction>) {
    // Tags survive from the bottom of the stack up.
    let mut keep = 0;
    while keep < orig.len()
        && keep < modif.len()
        && orig[orig.len() - 1 - keep] == modif[modif.len() - 1 - keep]
    {
        keep += 1;
    }

    for _ in 0..orig.len() - keep {
        actions.push(FlowAction::PopVlan);
    }

    let fresh = &modif[..modif.len() - keep];
    for (i, &vid) in fresh.iter().rev().enumerate() {
        let tpid = if i == 0 {
            ETHER_TYPE_VLAN
        } else {
            ETHER_TYPE_PROVIDER_BRIDGING
        };
        actions.push(FlowAction::PushVlan {
            tpid,
            tci: FlowAction::vlan_tci(vid),
        });
    }
}
