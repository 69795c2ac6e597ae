// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The router processor.

use crate::arp;
use crate::context::PacketContext;
use crate::emit::PacketEmitter;
use crate::icmp;
use crate::icmp::IcmpErrorKind;
use crate::route::NextHop;
use crate::sim::DeviceAction;
use crate::topology::Port;
use crate::topology::Router;
use crate::topology::RouterPortCfg;
use simnet_api::ETHER_TYPE_ARP;
use simnet_api::ETHER_TYPE_IPV4;
use smoltcp::wire::ArpOperation;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use tracing::debug;
use tracing::warn;

/// Walk a packet through a router: answer ARP and pings aimed at the
/// router itself, decrement TTL, route, resolve the next hop, rewrite
/// the Ethernet header.
pub fn process(
    router: &Router,
    in_port: &Port,
    ctx: &mut PacketContext,
    emitter: &PacketEmitter,
) -> DeviceAction {
    if !router.admin_state_up {
        ctx.record_trace(Some(router.id), "router admin down");
        return DeviceAction::Drop { temporary: false };
    }

    let Some(in_cfg) = router.ports.get(&in_port.id).copied() else {
        warn!(router = %router.id, port = %in_port.id, "port not on router");
        return DeviceAction::ErrorDrop;
    };

    match ctx.current_match().ether_type {
        Some(ETHER_TYPE_ARP) => process_arp(router, in_port, in_cfg, ctx, emitter),
        Some(ETHER_TYPE_IPV4) => process_ipv4(router, in_port, in_cfg, ctx, emitter),
        _ => {
            // Not something this router can route; the caller turns
            // this into a wide ethertype-keyed drop.
            ctx.record_trace(Some(router.id), "non-IP ethertype");
            DeviceAction::NotIpv4
        }
    }
}

fn process_arp(
    router: &Router,
    in_port: &Port,
    in_cfg: RouterPortCfg,
    ctx: &mut PacketContext,
    emitter: &PacketEmitter,
) -> DeviceAction {
    let Some(req) = arp::parse(ctx.frame()) else {
        ctx.record_trace(Some(router.id), "malformed ARP frame");
        return DeviceAction::Drop { temporary: false };
    };

    // Any valid ARP teaches us the sender's mapping.
    if !req.spa.is_unspecified() {
        router.arp_cache.set(IpAddr::V4(req.spa), req.sha);
    }

    match req.op {
        ArpOperation::Request if req.tpa == in_cfg.ip => {
            debug!(router = %router.id, tpa = %req.tpa, "answering ARP");
            let reply =
                arp::gen_arp_reply(in_cfg.mac, in_cfg.ip, req.sha, req.spa);
            emitter.emit(in_port.id, reply);
            DeviceAction::Consumed
        }

        ArpOperation::Reply if req.tpa == in_cfg.ip => {
            // The cache update above was the point; nothing to send.
            DeviceAction::Consumed
        }

        // ARP between other parties; a router is not a bridge.
        _ => DeviceAction::Drop { temporary: false },
    }
}

fn process_ipv4(
    router: &Router,
    in_port: &Port,
    in_cfg: RouterPortCfg,
    ctx: &mut PacketContext,
    emitter: &PacketEmitter,
) -> DeviceAction {
    let (net_dst, src, ttl) = {
        let m = ctx.current_match();
        (m.net_dst, m.net_src.filter(|ip| ip.is_ipv4()), m.net_ttl)
    };
    let Some(IpAddr::V4(dst)) = net_dst else {
        warn!(router = %router.id, "IPv4 ethertype without IPv4 dst");
        return DeviceAction::ErrorDrop;
    };

    // Addressed to the router itself: answer pings, swallow the rest.
    if router.port_by_ip(dst).is_some() {
        if let Some(reply) = icmp::gen_echo_reply(ctx.frame()) {
            debug!(router = %router.id, %dst, "answering echo request");
            emitter.emit(in_port.id, reply);
            return DeviceAction::Consumed;
        }
        ctx.record_trace(Some(router.id), "packet for router discarded");
        return DeviceAction::Drop { temporary: false };
    }

    // TTL runs out here.
    let ttl = ttl.unwrap_or(0);
    if ttl <= 1 {
        ctx.record_trace(Some(router.id), "TTL exceeded");
        emit_icmp_error(
            IcmpErrorKind::TimeExceeded,
            in_port,
            in_cfg,
            ctx,
            emitter,
        );
        return DeviceAction::Drop { temporary: false };
    }

    let Some(route) = router.routes.lookup(IpAddr::V4(dst), src) else {
        ctx.record_trace(Some(router.id), "no route to host");
        emit_icmp_error(
            IcmpErrorKind::NetUnreachable,
            in_port,
            in_cfg,
            ctx,
            emitter,
        );
        return DeviceAction::Drop { temporary: false };
    };

    let (out_port_id, gateway) = match route.next_hop {
        NextHop::Blackhole => {
            ctx.record_trace(Some(router.id), "blackhole route");
            return DeviceAction::Drop { temporary: false };
        }
        NextHop::Reject => {
            ctx.record_trace(Some(router.id), "reject route");
            emit_icmp_error(
                IcmpErrorKind::AdminProhibited,
                in_port,
                in_cfg,
                ctx,
                emitter,
            );
            return DeviceAction::Drop { temporary: false };
        }
        NextHop::Port { port, gateway } => (port, gateway),
    };

    let Some(out_cfg) = router.ports.get(&out_port_id).copied() else {
        warn!(
            router = %router.id,
            port = %out_port_id,
            "route egress port not on router"
        );
        return DeviceAction::ErrorDrop;
    };

    let next_hop = match gateway {
        Some(IpAddr::V4(gw)) => gw,
        Some(IpAddr::V6(gw)) => {
            warn!(router = %router.id, %gw, "IPv6 gateway on IPv4 route");
            return DeviceAction::ErrorDrop;
        }
        // Directly connected: the destination is its own next hop,
        // but only if it really is on the egress port's subnet.
        None if out_cfg.net.is_member(dst) => dst,
        None => {
            ctx.record_trace(Some(router.id), "destination not on link");
            emit_icmp_error(
                IcmpErrorKind::HostUnreachable,
                in_port,
                in_cfg,
                ctx,
                emitter,
            );
            return DeviceAction::Drop { temporary: false };
        }
    };

    match ctx.current_match_mut() {
        Ok(m) => m.net_ttl = Some(ttl - 1),
        Err(e) => {
            warn!(router = %router.id, error = %e, "frozen in routing");
            return DeviceAction::ErrorDrop;
        }
    }

    match router.arp_cache.get(&IpAddr::V4(next_hop)) {
        Some(next_hop_mac) => {
            match ctx.current_match_mut() {
                Ok(m) => {
                    m.eth_src = Some(out_cfg.mac);
                    m.eth_dst = Some(next_hop_mac);
                }
                Err(e) => {
                    warn!(router = %router.id, error = %e, "frozen in rewrite");
                    return DeviceAction::ErrorDrop;
                }
            }
            DeviceAction::ToPort(out_port_id)
        }

        None => {
            // Ask for the next hop and bail out; the temporary drop
            // expires quickly and the retry finds the cache warm.
            debug!(router = %router.id, %next_hop, "ARP cache miss");
            ctx.record_trace(Some(router.id), "awaiting ARP resolution");
            let request =
                arp::gen_arp_request(out_cfg.mac, out_cfg.ip, next_hop);
            emitter.emit(out_port_id, request);
            DeviceAction::Drop { temporary: true }
        }
    }
}

fn emit_icmp_error(
    kind: IcmpErrorKind,
    in_port: &Port,
    in_cfg: RouterPortCfg,
    ctx: &PacketContext,
    emitter: &PacketEmitter,
) {
    let src_ip: Ipv4Addr = in_cfg.ip;
    if let Some(frame) =
        icmp::gen_icmp_error(kind, in_cfg.mac, src_ip, ctx.frame())
    {
        emitter.emit(in_port.id, frame);
    }
}
