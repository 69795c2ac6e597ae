// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The VLAN-aware bridge processor.
//!
//! A VLAN-aware bridge splices a trunk into per-VLAN ordinary
//! bridges: trunk-side frames lose their tag and cross to the
//! interior port for that VLAN; bridge-side frames gain the tag and
//! head out the trunk.

use crate::context::PacketContext;
use crate::sim::DeviceAction;
use crate::topology::Port;
use crate::topology::VlanBridge;
use tracing::warn;

pub fn process(
    vb: &VlanBridge,
    in_port: &Port,
    ctx: &mut PacketContext,
) -> DeviceAction {
    if !vb.admin_state_up {
        ctx.record_trace(Some(vb.id), "vlan-bridge admin down");
        return DeviceAction::Drop { temporary: false };
    }

    if in_port.id == vb.trunk_port {
        // Trunk ingress: only tagged frames for a configured VLAN
        // cross over.
        let Some(vid) = ctx.current_match().outer_vlan() else {
            ctx.record_trace(Some(vb.id), "untagged frame on trunk");
            return DeviceAction::Drop { temporary: false };
        };
        let Some(&interior) = vb.interior_by_vlan.get(&vid) else {
            ctx.record_trace(Some(vb.id), "unknown VLAN on trunk");
            return DeviceAction::Drop { temporary: false };
        };

        match ctx.current_match_mut() {
            Ok(m) => {
                m.pop_vlan();
            }
            Err(e) => {
                warn!(vlan_bridge = %vb.id, error = %e, "frozen on trunk pop");
                return DeviceAction::ErrorDrop;
            }
        }
        DeviceAction::ToPort(interior)
    } else if let Some(vid) = vb.vlan_of_port(in_port.id) {
        // Bridge side: tag the frame with the port's VLAN and send it
        // down the trunk.
        match ctx.current_match_mut() {
            Ok(m) => m.push_vlan(vid),
            Err(e) => {
                warn!(vlan_bridge = %vb.id, error = %e, "frozen on tag push");
                return DeviceAction::ErrorDrop;
            }
        }
        DeviceAction::ToPort(vb.trunk_port)
    } else {
        warn!(vlan_bridge = %vb.id, port = %in_port.id, "port not on device");
        DeviceAction::ErrorDrop
    }
}
