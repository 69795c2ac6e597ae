// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The learning-bridge processor.

use crate::context::PacketContext;
use crate::dhcp;
use crate::emit::PacketEmitter;
use crate::resource::MacTableKey;
use crate::sim::DeviceAction;
use crate::sim::FlowRemoved;
use crate::sim::FlowTag;
use crate::topology::Bridge;
use crate::topology::Port;
use tracing::debug;
use tracing::warn;

/// Walk a packet through a bridge: answer DHCP where configured,
/// learn the source MAC, then forward by destination MAC. Broadcast,
/// multicast, and unknown destinations flood; a learned destination
/// goes out its port; a hairpin is suppressed.
pub fn process(
    bridge: &Bridge,
    in_port: &Port,
    ctx: &mut PacketContext,
    emitter: &PacketEmitter,
) -> DeviceAction {
    if !bridge.admin_state_up {
        ctx.record_trace(Some(bridge.id), "bridge admin down");
        return DeviceAction::Drop { temporary: false };
    }

    if ctx.current_match().ether_type.is_none() {
        warn!(bridge = %bridge.id, "no ethertype in match");
        return DeviceAction::ErrorDrop;
    }

    // DHCP service on the ingress port answers the packet in place of
    // any forwarding.
    if let Some(subnet) = in_port.dhcp() {
        if dhcp::is_dhcp_request(ctx.current_match()) {
            if let Some(reply) = dhcp::handle_request(subnet, ctx.frame()) {
                debug!(bridge = %bridge.id, port = %in_port.id, "dhcp reply");
                ctx.record_trace(Some(bridge.id), "dhcp request answered");
                emitter.emit(in_port.id, reply);
                return DeviceAction::Consumed;
            }
        }
    }

    let vlan = ctx.current_match().outer_vlan();

    // Learn the source MAC onto the ingress port; the flow unlearns
    // it on removal so a silent host ages out.
    if let Some(src) = ctx.current_match().eth_src {
        if src.is_unicast() {
            let key = MacTableKey { vlan, mac: src };
            bridge.mac_table.set(key, in_port.id);
            let cb = FlowRemoved::MacPortForget {
                table: bridge.mac_table.clone(),
                key,
                port: in_port.id,
            };
            if ctx.add_flow_removed_callback(cb).is_err() {
                return DeviceAction::ErrorDrop;
            }
        }
    }

    let Some(dst) = ctx.current_match().eth_dst else {
        warn!(bridge = %bridge.id, "no destination MAC in match");
        return DeviceAction::ErrorDrop;
    };

    if dst.is_multicast() {
        ctx.record_trace(Some(bridge.id), "flooding multicast");
        return flood(bridge, in_port);
    }

    match bridge.mac_table.get(&MacTableKey { vlan, mac: dst }) {
        Some(out_port) if out_port == in_port.id => {
            // Hairpin: the destination is where we came from.
            ctx.record_trace(Some(bridge.id), "hairpin suppressed");
            DeviceAction::Drop { temporary: false }
        }

        Some(out_port) => {
            let tag =
                FlowTag::MacPort { bridge: bridge.id, mac: dst, port: out_port };
            if ctx.add_flow_tag(tag).is_err() {
                return DeviceAction::ErrorDrop;
            }
            DeviceAction::ToPort(out_port)
        }

        None => {
            // Unknown unicast. A tagged frame with a mapped VLAN
            // heads to the VLAN-aware bridge; anything else floods.
            if let Some(vid) = vlan {
                if let Some(&vlan_port) = bridge.vlan_ports.get(&vid) {
                    return DeviceAction::ToPort(vlan_port);
                }
            }
            ctx.record_trace(Some(bridge.id), "flooding unknown unicast");
            flood(bridge, in_port)
        }
    }
}

/// Flood egress: the bridge's port set, plus a forked copy toward
/// each VLAN interior port when the bridge hangs off a VLAN-aware
/// bridge.
fn flood(bridge: &Bridge, in_port: &Port) -> DeviceAction {
    let flood = DeviceAction::ToPortSet(bridge.flood_port_set);
    let vlan_branches: Vec<DeviceAction> = bridge
        .vlan_ports
        .values()
        .filter(|&&p| p != in_port.id)
        .map(|&p| DeviceAction::ToPort(p))
        .collect();

    if vlan_branches.is_empty() {
        flood
    } else {
        let mut branches = vec![flood];
        branches.extend(vlan_branches);
        DeviceAction::Fork(branches)
    }
}
