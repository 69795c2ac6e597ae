// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The simnet engine.
//!
//! Simnet walks a packet through a graph of virtual devices (bridges,
//! routers, VLAN-aware bridges, filter chains) and produces a
//! datapath directive: either a wildcard flow to install or a one-off
//! send-packet action list. The walk is driven by the
//! [`coordinator::Coordinator`]; everything else in this crate exists
//! in its service.
//!
//! The engine is deliberately narrow at its edges. Topology snapshots
//! arrive through an async [`topology::TopologyClient`]; shared
//! mutable state (MAC learning, ARP, connection tracking) is reached
//! only through capability handles; generated packets leave through
//! an [`emit::PacketEmitter`]. A simulation never returns an error:
//! every failure mode folds into a [`sim::SimulationResult`].

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod arp;
pub mod bridge;
pub mod chain;
pub mod config;
pub mod conntrack;
pub mod context;
pub mod coordinator;
pub mod dhcp;
pub mod emit;
pub mod icmp;
pub mod resource;
pub mod route;
pub mod router;
pub mod sim;
pub mod topology;
pub mod translate;
pub mod vlan_bridge;
pub mod wildcard;

pub use simnet_api as api;
