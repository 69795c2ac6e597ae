// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The simulation coordinator.
//!
//! One coordinator drives one packet: it resolves ports and devices
//! through the topology client, runs filters, dispatches to the
//! device processors, interprets their actions, and finally folds the
//! walk into a [`SimulationResult`]. Failures never escape; every
//! error path lands on a drop or a no-op, and a temporary drop is the
//! universal "try again shortly" answer for transient topology
//! trouble.

use crate::bridge;
use crate::chain::ChainEvaluator;
use crate::chain::ChainVerdict;
use crate::chain::Predicate;
use crate::chain::RuleEnv;
use crate::config::SimConfig;
use crate::conntrack::ConnCache;
use crate::context::ContextError;
use crate::context::PacketContext;
use crate::emit::PacketEmitter;
use crate::icmp;
use crate::icmp::IcmpErrorKind;
use crate::router;
use crate::sim::run_flow_removed;
use crate::sim::DeviceAction;
use crate::sim::FlowRemoved;
use crate::sim::FlowTag;
use crate::sim::SimulationResult;
use crate::sim::VirtualFlow;
use crate::topology::Device;
use crate::topology::Port;
use crate::topology::TopologyClient;
use crate::translate;
use crate::vlan_bridge;
use crate::wildcard::WildcardMatch;
use futures::future::BoxFuture;
use simnet_api::ETHER_TYPE_IPV4;
use simnet_api::FlowAction;
use simnet_api::FragmentType;
use std::net::IpAddr;
use std::sync::Arc;
use tracing::debug;
use tracing::error;
use uuid::Uuid;

/// The next-hop MTU quoted in Frag-Needed replies. The virtual
/// network never carries jumbo frames.
const FRAG_NEEDED_MTU: u16 = 1500;

enum FilterOutcome {
    Accept,
    Drop,
    Error,
    Miss,
}

/// Drives one packet through the virtual topology. Not reusable: one
/// coordinator per simulation, consumed by [`Coordinator::simulate`].
pub struct Coordinator {
    topology: TopologyClient,
    conn_cache: Arc<dyn ConnCache>,
    emitter: PacketEmitter,
    cfg: SimConfig,
    ctx: PacketContext,

    /// Outbound filter of the device most recently traversed; applies
    /// to whatever egress its action selects.
    pending_outfilter: Option<Uuid>,
}

impl Coordinator {
    pub fn new(
        ctx: PacketContext,
        topology: TopologyClient,
        conn_cache: Arc<dyn ConnCache>,
        emitter: PacketEmitter,
        cfg: SimConfig,
    ) -> Self {
        Self {
            topology,
            conn_cache,
            emitter,
            cfg,
            ctx,
            pending_outfilter: None,
        }
    }

    /// Enable verbose tracing if any of the given conditions matches
    /// the packet as it stands at ingress.
    pub fn with_traced_conditions(mut self, conditions: &[Predicate]) -> Self {
        let conn_cache = self.conn_cache.clone();
        let cfg = self.cfg;
        let env = RuleEnv {
            conn_cache: &*conn_cache,
            cfg: &cfg,
            owner: Uuid::nil(),
        };
        if conditions.iter().any(|c| c.is_match(&mut self.ctx, &env)) {
            self.ctx.enable_tracing();
        }
        self
    }

    /// Run the simulation to completion.
    pub async fn simulate(mut self) -> SimulationResult {
        let input = self.ctx.orig_match().input_port;
        let generated = self.ctx.generated_egress();

        let result = match (input, generated) {
            (Some(port), None) => self.ingress_port(port).await,
            (None, Some(port)) => self.egress_port(port).await,
            _ => {
                error!(
                    ?input,
                    ?generated,
                    "unsupported start: need exactly one of input port \
                     and generated egress"
                );
                self.ctx.record_trace(None, "illegal start");
                self.drop_result(true)
            }
        };

        debug!(
            cookie = ?self.ctx.cookie(),
            devices = self.ctx.devices_traversed(),
            "simulation finished"
        );
        result
    }

    async fn ingress_port(&mut self, port_id: Uuid) -> SimulationResult {
        let Some(port) =
            self.topology.port(port_id, self.ctx.expiry()).await
        else {
            self.ctx.record_trace(None, "ingress port not in topology");
            return self.drop_result(true);
        };

        if !port.admin_state_up {
            self.ctx.record_trace(Some(port.id), "port admin down");
            return self.drop_result(false);
        }

        if let Err(e) = self.ctx.set_input_port(port.id, port.port_groups())
        {
            return self.illegal(e);
        }

        if port.is_exterior() {
            if let Some(result) = self.fragmentation_policy(&port) {
                return result;
            }
        }

        if let Some(chain_id) = port.infilter {
            match self.apply_filter(chain_id, port.device, true).await {
                FilterOutcome::Accept => {}
                FilterOutcome::Drop => return self.drop_result(false),
                FilterOutcome::Error => return self.error_drop(),
                FilterOutcome::Miss => return self.drop_result(true),
            }
        }

        self.device(port.device, &port).await
    }

    async fn device(
        &mut self,
        device_id: Uuid,
        in_port: &Port,
    ) -> SimulationResult {
        if let Err(e) = self.ctx.visit_device(device_id, &self.cfg) {
            self.ctx
                .record_trace(Some(device_id), format!("walk ended: {e}"));
            return self.drop_result(true);
        }

        let Some(dev) =
            self.topology.device(device_id, self.ctx.expiry()).await
        else {
            self.ctx.record_trace(Some(device_id), "device not in topology");
            return self.drop_result(true);
        };

        if let Err(e) = self.ctx.add_flow_tag(FlowTag::Device(device_id)) {
            return self.illegal(e);
        }

        let (infilter, outfilter) = match &dev {
            Device::Bridge(b) => (b.infilter, b.outfilter),
            Device::Router(r) => (r.infilter, r.outfilter),
            Device::VlanBridge(_) => (None, None),
            Device::Port(_) | Device::Chain(_) => {
                error!(
                    device = %device_id,
                    kind = dev.kind(),
                    "walk reached a non-forwarding device"
                );
                return self.drop_result(true);
            }
        };

        if let Some(chain_id) = infilter {
            match self.apply_filter(chain_id, device_id, false).await {
                FilterOutcome::Accept => {}
                FilterOutcome::Drop => return self.drop_result(false),
                FilterOutcome::Error => return self.error_drop(),
                FilterOutcome::Miss => return self.drop_result(true),
            }
        }

        let action = match &dev {
            Device::Bridge(b) => {
                bridge::process(b, in_port, &mut self.ctx, &self.emitter)
            }
            Device::Router(r) => {
                router::process(r, in_port, &mut self.ctx, &self.emitter)
            }
            Device::VlanBridge(v) => {
                vlan_bridge::process(v, in_port, &mut self.ctx)
            }
            Device::Port(_) | Device::Chain(_) => {
                return self.drop_result(true);
            }
        };

        debug!(device = %device_id, ?action, "device processed");
        self.pending_outfilter = outfilter;
        self.handle_action(action).await
    }

    fn handle_action(
        &mut self,
        action: DeviceAction,
    ) -> BoxFuture<'_, SimulationResult> {
        Box::pin(async move {
            match action {
                DeviceAction::ToPort(port) => self.egress_port(port).await,
                DeviceAction::ToPortSet(set) => self.emit_port_set(set).await,
                DeviceAction::Fork(branches) => self.fork(branches).await,
                DeviceAction::Consumed => self.consumed(),
                DeviceAction::Drop { temporary } => {
                    self.drop_result(temporary)
                }
                DeviceAction::ErrorDrop => self.error_drop(),
                DeviceAction::NotIpv4 => {
                    let wide = self.ctx.orig_match().project_ethertype();
                    self.wide_drop(wide)
                }
                DeviceAction::DoFlowAction(fa) => self.emit(fa),
            }
        })
    }

    async fn egress_port(&mut self, port_id: Uuid) -> SimulationResult {
        let Some(port) =
            self.topology.port(port_id, self.ctx.expiry()).await
        else {
            self.ctx.record_trace(None, "egress port not in topology");
            return self.drop_result(true);
        };

        if !port.admin_state_up {
            self.ctx.record_trace(Some(port.id), "port admin down");
            return self.drop_result(false);
        }

        if let Some(chain_id) = self.pending_outfilter.take() {
            match self.apply_filter(chain_id, port.device, false).await {
                FilterOutcome::Accept => {}
                FilterOutcome::Drop => return self.drop_result(false),
                FilterOutcome::Error => return self.error_drop(),
                FilterOutcome::Miss => return self.drop_result(true),
            }
        }

        if let Some(chain_id) = port.outfilter {
            match self.apply_filter(chain_id, port.device, true).await {
                FilterOutcome::Accept => {}
                FilterOutcome::Drop => return self.drop_result(false),
                FilterOutcome::Error => return self.error_drop(),
                FilterOutcome::Miss => return self.drop_result(true),
            }
        }

        self.ctx.set_output_port(Some(port.id));

        match &port.kind {
            crate::topology::PortKind::Exterior { dp_port, .. } => {
                self.emit(FlowAction::Output(*dp_port))
            }
            crate::topology::PortKind::Interior { peer } => {
                self.ingress_port(*peer).await
            }
        }
    }

    async fn emit_port_set(&mut self, set: Uuid) -> SimulationResult {
        if let Some(chain_id) = self.pending_outfilter.take() {
            // The owning device is unknown here; the set id scopes
            // any conn-tracking the chain performs.
            match self.apply_filter(chain_id, set, false).await {
                FilterOutcome::Accept => {}
                FilterOutcome::Drop => return self.drop_result(false),
                FilterOutcome::Error => return self.error_drop(),
                FilterOutcome::Miss => return self.drop_result(true),
            }
        }
        self.emit(FlowAction::OutputPortSet(set))
    }

    async fn apply_filter(
        &mut self,
        chain_id: Uuid,
        owner: Uuid,
        is_port_filter: bool,
    ) -> FilterOutcome {
        let Some(chain) =
            self.topology.chain(chain_id, self.ctx.expiry()).await
        else {
            self.ctx.record_trace(Some(owner), "filter chain missing");
            return FilterOutcome::Miss;
        };

        let conn_cache = self.conn_cache.clone();
        let eval = ChainEvaluator {
            topology: &self.topology,
            conn_cache: &*conn_cache,
            cfg: &self.cfg,
        };

        match eval.apply(&chain, &mut self.ctx, owner, is_port_filter).await
        {
            ChainVerdict::Accept => FilterOutcome::Accept,
            ChainVerdict::Drop | ChainVerdict::Reject => FilterOutcome::Drop,
            ChainVerdict::Error => FilterOutcome::Error,
        }
    }

    /// The fragment handling that runs before any device sees a
    /// packet from an exterior port. `None` means the packet may
    /// proceed.
    fn fragmentation_policy(
        &mut self,
        in_port: &Port,
    ) -> Option<SimulationResult> {
        let m = self.ctx.current_match();
        match m.frag_type {
            Some(FragmentType::First)
                if m.ether_type == Some(ETHER_TYPE_IPV4) =>
            {
                // Tell the sender to stop fragmenting, and drop
                // briefly so the resend gets a fresh verdict.
                let src = match (m.eth_dst, m.net_dst) {
                    (Some(mac), Some(IpAddr::V4(ip))) => Some((mac, ip)),
                    _ => None,
                };
                if let Some((src_mac, src_ip)) = src {
                    if let Some(frame) = icmp::gen_icmp_error(
                        IcmpErrorKind::FragNeeded { mtu: FRAG_NEEDED_MTU },
                        src_mac,
                        src_ip,
                        self.ctx.frame(),
                    ) {
                        self.emitter.emit(in_port.id, frame);
                    }
                }
                self.ctx
                    .record_trace(Some(in_port.id), "first fragment refused");
                Some(self.drop_result(true))
            }

            Some(FragmentType::First) => {
                self.ctx.record_trace(
                    Some(in_port.id),
                    "non-IPv4 first fragment",
                );
                Some(self.drop_result(false))
            }

            Some(FragmentType::Later) => {
                self.ctx
                    .record_trace(Some(in_port.id), "later fragment refused");
                let wide = self.ctx.orig_match().project_fragment();
                Some(self.wide_drop(wide))
            }

            Some(FragmentType::None) | None => None,
        }
    }

    /// Evaluate fork branches sequentially against the match as it
    /// stood at the fork, merging outcomes pairwise.
    async fn fork(
        &mut self,
        branches: Vec<DeviceAction>,
    ) -> SimulationResult {
        let saved_match = self.ctx.clone_match();
        let saved_outfilter = self.pending_outfilter;

        let mut merged = SimulationResult::NoOp;
        for branch in branches {
            self.ctx.unfreeze();
            if let Err(e) = self.ctx.set_match(saved_match.clone()) {
                return self.illegal(e);
            }
            self.pending_outfilter = saved_outfilter;

            let result = self.handle_action(branch).await;
            merged = match merge_results(merged, result) {
                Ok(r) => r,
                Err((a, b)) => {
                    error!("incompatible fork outcomes");
                    self.ctx.record_trace(None, "incompatible fork outcomes");
                    // The discarded branch results still owe their
                    // callbacks a single firing.
                    for result in [a, b] {
                        if let SimulationResult::AddVirtualWildcardFlow {
                            callbacks,
                            ..
                        } = result
                        {
                            run_flow_removed(callbacks);
                        }
                    }
                    return self.drop_result(true);
                }
            };
        }
        merged
    }

    /// Drain the context's callbacks for result production, appending
    /// the conn-key release when this simulation recorded one.
    fn final_callbacks(&mut self) -> Vec<FlowRemoved> {
        let mut callbacks = self.ctx.take_callbacks();
        if let Some(key) = self.ctx.take_tracked_conn_key() {
            callbacks.push(FlowRemoved::ReleaseConnKey {
                cache: self.conn_cache.clone(),
                key,
            });
        }
        callbacks
    }

    /// The packet was answered by a device; nothing to install.
    fn consumed(&mut self) -> SimulationResult {
        self.ctx.freeze();
        run_flow_removed(self.final_callbacks());
        SimulationResult::NoOp
    }

    /// An internal error: temporary drop for datapath packets,
    /// silent consumption for generated ones.
    fn error_drop(&mut self) -> SimulationResult {
        if self.ctx.cookie().is_some() {
            self.drop_result(true)
        } else {
            self.consumed()
        }
    }

    fn illegal(&mut self, e: ContextError) -> SimulationResult {
        error!(error = %e, "illegal context state");
        self.ctx.record_trace(None, format!("illegal state: {e}"));
        self.drop_result(true)
    }

    /// Install a drop flow for the original match (or consume a
    /// generated packet outright).
    fn drop_result(&mut self, temporary: bool) -> SimulationResult {
        self.ctx.freeze();
        if self.ctx.cookie().is_none() {
            run_flow_removed(self.final_callbacks());
            return SimulationResult::NoOp;
        }

        let (idle, hard) = if temporary {
            (0, self.cfg.temporary_drop_millis)
        } else {
            (self.cfg.idle_expiration_millis, 0)
        };

        SimulationResult::AddVirtualWildcardFlow {
            flow: VirtualFlow {
                wc_match: self.ctx.orig_match().clone(),
                actions: vec![],
                idle_expiration_millis: idle,
                hard_expiration_millis: hard,
            },
            callbacks: self.final_callbacks(),
            tags: self.ctx.take_tags(),
        }
    }

    /// Install a drop flow with a widened match, covering a whole
    /// class of traffic the simulation cannot serve.
    fn wide_drop(&mut self, wc_match: WildcardMatch) -> SimulationResult {
        self.ctx.freeze();
        if self.ctx.cookie().is_none() {
            run_flow_removed(self.final_callbacks());
            return SimulationResult::NoOp;
        }

        SimulationResult::AddVirtualWildcardFlow {
            flow: VirtualFlow {
                wc_match,
                actions: vec![],
                idle_expiration_millis: self.cfg.idle_expiration_millis,
                hard_expiration_millis: 0,
            },
            callbacks: self.final_callbacks(),
            tags: self.ctx.take_tags(),
        }
    }

    /// Produce the final emitting result: the header-diff actions
    /// followed by `output`.
    fn emit(&mut self, output: FlowAction) -> SimulationResult {
        self.ctx.freeze();

        let mut actions = translate::actions_for_transition(
            self.ctx.orig_match(),
            self.ctx.current_match(),
        );
        actions.push(output);

        if self.ctx.cookie().is_none() {
            run_flow_removed(self.final_callbacks());
            return SimulationResult::SendPacket(actions);
        }

        let (idle, hard) = if self.ctx.is_conn_tracked() {
            if self.ctx.forward_flow_hint().unwrap_or(true) {
                // Shorter than the tracked key's TTL, so forward
                // re-simulations keep refreshing it.
                (0, self.cfg.forward_flow_expiration_millis())
            } else {
                // Return flows re-simulate periodically to confirm
                // the forward side still exists.
                (0, self.cfg.return_flow_expiration_millis)
            }
        } else {
            (self.cfg.idle_expiration_millis, 0)
        };

        SimulationResult::AddVirtualWildcardFlow {
            flow: VirtualFlow {
                wc_match: self.ctx.orig_match().clone(),
                actions,
                idle_expiration_millis: idle,
                hard_expiration_millis: hard,
            },
            callbacks: self.final_callbacks(),
            tags: self.ctx.take_tags(),
        }
    }
}

fn min_expiration(a: u64, b: u64) -> u64 {
    match (a, b) {
        (0, b) => b,
        (a, 0) => a,
        (a, b) => a.min(b),
    }
}

/// Pairwise merge of fork branch outcomes. `NoOp` is the identity;
/// like kinds combine; anything else is incompatible and handed back
/// for cleanup.
fn merge_results(
    a: SimulationResult,
    b: SimulationResult,
) -> Result<SimulationResult, (SimulationResult, SimulationResult)> {
    use SimulationResult::*;

    match (a, b) {
        (NoOp, x) | (x, NoOp) => Ok(x),

        (SendPacket(mut actions), SendPacket(more)) => {
            actions.extend(more);
            Ok(SendPacket(actions))
        }

        (
            AddVirtualWildcardFlow {
                flow: mut fa,
                callbacks: mut ca,
                tags: mut ta,
            },
            AddVirtualWildcardFlow { flow: fb, callbacks: cb, tags: tb },
        ) => {
            // Branches that widened their match differently (wide
            // drops vs ordinary emits) cannot share one flow.
            if fa.wc_match != fb.wc_match {
                return Err((
                    AddVirtualWildcardFlow {
                        flow: fa,
                        callbacks: ca,
                        tags: ta,
                    },
                    AddVirtualWildcardFlow {
                        flow: fb,
                        callbacks: cb,
                        tags: tb,
                    },
                ));
            }

            fa.actions.extend(fb.actions);
            fa.idle_expiration_millis = min_expiration(
                fa.idle_expiration_millis,
                fb.idle_expiration_millis,
            );
            fa.hard_expiration_millis = min_expiration(
                fa.hard_expiration_millis,
                fb.hard_expiration_millis,
            );
            ca.extend(cb);
            ta.extend(tb);
            Ok(AddVirtualWildcardFlow {
                flow: fa,
                callbacks: ca,
                tags: ta,
            })
        }

        (a, b) => Err((a, b)),
    }
}
