// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Simulation outcomes.
//!
//! Device processors speak [`DeviceAction`]; the coordinator folds a
//! walk's worth of them into one [`SimulationResult`].

use crate::conntrack::ConnCache;
use crate::conntrack::ConnKey;
use crate::resource::MacTable;
use crate::resource::MacTableKey;
use crate::wildcard::WildcardMatch;
use core::fmt;
use simnet_api::FlowAction;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// What a device processor wants done with the packet.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeviceAction {
    /// Continue the walk out a specific virtual port.
    ToPort(Uuid),

    /// Emit to every port in a port set (flood).
    ToPortSet(Uuid),

    /// Evaluate each sub-action against the match as it stood here,
    /// sequentially, and merge the outcomes.
    Fork(Vec<DeviceAction>),

    /// The device answered the packet itself (e.g. an ARP reply was
    /// emitted); nothing to install, nothing to forward.
    Consumed,

    /// Discard. A temporary drop installs a short-lived flow so the
    /// packet re-simulates soon; a permanent one lives a full idle
    /// cycle.
    Drop { temporary: bool },

    /// An internal error: the simulation cannot say anything durable
    /// about this packet.
    ErrorDrop,

    /// The device only handles IP and this frame is something else;
    /// install a wide drop keyed on ethertype alone.
    NotIpv4,

    /// Short-circuit with a literal datapath action in place of the
    /// output.
    DoFlowAction(FlowAction),
}

/// Tags attached to an installed flow so the topology subsystem can
/// invalidate it when the matching state changes.
#[derive(Clone, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum FlowTag {
    /// The flow traversed this device.
    Device(Uuid),

    /// The flow depends on this MAC→port mapping on this bridge.
    MacPort { bridge: Uuid, mac: simnet_api::MacAddr, port: Uuid },
}

/// A flow-removed callback: a capability handle paired with the
/// payload to apply to it. Callbacks are data so the flow installer
/// can fire them without holding any engine state.
pub enum FlowRemoved {
    /// Drop a learned MAC→port mapping, provided it still points at
    /// the port the flow saw.
    MacPortForget { table: MacTable, key: MacTableKey, port: Uuid },

    /// Release a tracked connection key ahead of its TTL. Attached to
    /// the forward flow that installed the key.
    ReleaseConnKey { cache: Arc<dyn ConnCache>, key: ConnKey },

    /// Deliver a token to an observer. Used for watchers that only
    /// care that the flow went away.
    Notify { tx: mpsc::UnboundedSender<u64>, token: u64 },
}

impl FlowRemoved {
    /// Fire the callback. Consumes it: a callback fires at most once.
    pub fn fire(self) {
        match self {
            Self::MacPortForget { table, key, port } => {
                if table.get(&key) == Some(port) {
                    table.remove(&key);
                }
            }
            Self::ReleaseConnKey { cache, key } => {
                let _ = cache.remove(&key);
            }
            Self::Notify { tx, token } => {
                let _ = tx.send(token);
            }
        }
    }
}

impl fmt::Debug for FlowRemoved {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::MacPortForget { key, port, .. } => write!(
                f,
                "MacPortForget {{ vlan: {:?}, mac: {}, port: {} }}",
                key.vlan, key.mac, port
            ),
            Self::ReleaseConnKey { key, .. } => {
                write!(f, "ReleaseConnKey {{ key: {key:?} }}")
            }
            Self::Notify { token, .. } => {
                write!(f, "Notify {{ token: {token} }}")
            }
        }
    }
}

/// Run every callback exactly once, in registration order.
pub fn run_flow_removed(callbacks: Vec<FlowRemoved>) {
    for cb in callbacks {
        cb.fire();
    }
}

/// A wildcard flow ready for installation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VirtualFlow {
    /// The match, as captured at ingress: the simulation never hands
    /// out a match it may still mutate.
    pub wc_match: WildcardMatch,
    pub actions: Vec<FlowAction>,
    pub idle_expiration_millis: u64,
    pub hard_expiration_millis: u64,
}

/// The outcome of one simulation.
#[derive(Debug)]
pub enum SimulationResult {
    /// Nothing to install, nothing to send.
    NoOp,

    /// Execute these actions once against the (internally generated)
    /// packet; install nothing.
    SendPacket(Vec<FlowAction>),

    /// Install a wildcard flow. The callbacks are attached to the
    /// flow and fire when it is removed.
    AddVirtualWildcardFlow {
        flow: VirtualFlow,
        callbacks: Vec<FlowRemoved>,
        tags: BTreeSet<FlowTag>,
    },
}

impl SimulationResult {
    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp)
    }
}
