// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The per-simulation scratchpad.
//!
//! A [`PacketContext`] is created for one simulation and dropped when
//! the result is produced; it is never shared. Mutation follows a
//! small state machine: the context starts `Open`, freezes when the
//! coordinator begins producing a result, and may only be re-opened
//! by the fork handler rewinding between branches. Every mutator
//! fails while frozen, which turns a would-be silent corruption of a
//! published match into a visible illegal-state drop.

use crate::config::SimConfig;
use crate::conntrack::ConnCache;
use crate::conntrack::ConnKey;
use crate::conntrack::ConnMarker;
use crate::sim::FlowRemoved;
use crate::sim::FlowTag;
use crate::wildcard::WildcardMatch;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::trace;
use uuid::Uuid;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Error)]
pub enum ContextError {
    #[error("context is frozen")]
    Frozen,

    #[error("traversed more than {0} devices")]
    TraversalExceeded(u32),

    #[error("device {0} revisited beyond the loop threshold")]
    DeviceLoop(Uuid),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CtxState {
    Open,
    Frozen,
}

/// One recorded trace step.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TraceEntry {
    pub device: Option<Uuid>,
    pub message: String,
}

pub struct PacketContext {
    /// Datapath cookie; `None` means the packet was generated by a
    /// virtual device rather than received from the datapath.
    cookie: Option<u64>,

    /// Cookie of the simulation that generated this packet, for
    /// trace correlation.
    parent_cookie: Option<u64>,

    /// For generated packets: the virtual port to egress from.
    generated_egress: Option<Uuid>,

    /// The raw frame, for repliers that inspect payloads.
    frame: Vec<u8>,

    /// The match as it stood at ingress. Never mutated again.
    orig: WildcardMatch,

    /// The working match devices mutate.
    current: WildcardMatch,

    state: CtxState,
    expiry: Instant,

    tags: BTreeSet<FlowTag>,
    callbacks: Vec<FlowRemoved>,

    conn_tracked: bool,
    forward_flow: Option<bool>,

    /// The key this simulation recorded in the connection cache, if
    /// it is the forward side; released when the produced flow goes.
    tracked_key: Option<ConnKey>,

    trace_enabled: bool,
    trace_log: Vec<TraceEntry>,

    traversed: u32,
    visits: BTreeMap<Uuid, u32>,

    out_port: Option<Uuid>,
}

impl PacketContext {
    pub fn new(
        frame: Vec<u8>,
        wc_match: WildcardMatch,
        cookie: Option<u64>,
        parent_cookie: Option<u64>,
        generated_egress: Option<Uuid>,
        expiry: Instant,
    ) -> Self {
        Self {
            cookie,
            parent_cookie,
            generated_egress,
            frame,
            orig: wc_match.clone(),
            current: wc_match,
            state: CtxState::Open,
            expiry,
            tags: BTreeSet::new(),
            callbacks: Vec::new(),
            conn_tracked: false,
            forward_flow: None,
            tracked_key: None,
            trace_enabled: false,
            trace_log: Vec::new(),
            traversed: 0,
            visits: BTreeMap::new(),
            out_port: None,
        }
    }

    pub fn cookie(&self) -> Option<u64> {
        self.cookie
    }

    pub fn parent_cookie(&self) -> Option<u64> {
        self.parent_cookie
    }

    pub fn generated_egress(&self) -> Option<Uuid> {
        self.generated_egress
    }

    pub fn frame(&self) -> &[u8] {
        &self.frame
    }

    pub fn expiry(&self) -> Instant {
        self.expiry
    }

    /// The ingress-time match.
    pub fn orig_match(&self) -> &WildcardMatch {
        &self.orig
    }

    pub fn current_match(&self) -> &WildcardMatch {
        &self.current
    }

    pub fn clone_match(&self) -> WildcardMatch {
        self.current.clone()
    }

    /// Mutable access to the working match.
    pub fn current_match_mut(
        &mut self,
    ) -> Result<&mut WildcardMatch, ContextError> {
        self.check_open()?;
        Ok(&mut self.current)
    }

    /// Replace the working match wholesale (fork rewind).
    pub fn set_match(
        &mut self,
        m: WildcardMatch,
    ) -> Result<(), ContextError> {
        self.check_open()?;
        self.current = m;
        Ok(())
    }

    fn check_open(&self) -> Result<(), ContextError> {
        match self.state {
            CtxState::Open => Ok(()),
            CtxState::Frozen => Err(ContextError::Frozen),
        }
    }

    pub fn is_frozen(&self) -> bool {
        self.state == CtxState::Frozen
    }

    /// Latch the context for result production.
    pub fn freeze(&mut self) {
        self.state = CtxState::Frozen;
    }

    /// Re-open a frozen context. Only the fork handler does this,
    /// rewinding to evaluate the next branch.
    pub fn unfreeze(&mut self) {
        self.state = CtxState::Open;
    }

    pub fn add_flow_tag(&mut self, tag: FlowTag) -> Result<(), ContextError> {
        self.check_open()?;
        self.tags.insert(tag);
        Ok(())
    }

    pub fn add_flow_removed_callback(
        &mut self,
        cb: FlowRemoved,
    ) -> Result<(), ContextError> {
        self.check_open()?;
        self.callbacks.push(cb);
        Ok(())
    }

    pub fn tags(&self) -> &BTreeSet<FlowTag> {
        &self.tags
    }

    /// Take the accumulated callbacks, leaving none behind: they
    /// either attach to the produced flow or fire immediately, never
    /// both.
    pub fn take_callbacks(&mut self) -> Vec<FlowRemoved> {
        std::mem::take(&mut self.callbacks)
    }

    pub fn take_tags(&mut self) -> BTreeSet<FlowTag> {
        std::mem::take(&mut self.tags)
    }

    /// Record the ingress port, copying its port groups into the
    /// match for rule conditions.
    pub fn set_input_port(
        &mut self,
        port: Uuid,
        port_groups: Option<&BTreeSet<Uuid>>,
    ) -> Result<(), ContextError> {
        self.check_open()?;
        self.current.input_port = Some(port);
        if let Some(groups) = port_groups {
            self.current.port_groups = Some(groups.clone());
        }
        Ok(())
    }

    pub fn set_output_port(&mut self, port: Option<Uuid>) {
        self.out_port = port;
    }

    pub fn output_port(&self) -> Option<Uuid> {
        self.out_port
    }

    pub fn is_conn_tracked(&self) -> bool {
        self.conn_tracked
    }

    /// The forward/return decision, if one has been made.
    pub fn forward_flow_hint(&self) -> Option<bool> {
        self.forward_flow
    }

    /// Take the connection key this simulation installed, if any.
    /// Like the callback list, it is claimed by exactly one result.
    pub fn take_tracked_conn_key(&mut self) -> Option<ConnKey> {
        self.tracked_key.take()
    }

    pub fn mark_conn_tracked(&mut self) {
        self.conn_tracked = true;
    }

    /// Is this the forward direction of its connection? Lazily
    /// decided on first query: if the reversed key is already
    /// tracked, this packet is a return; otherwise it is a forward
    /// flow and its own key is recorded so the reverse direction can
    /// find it. Either way the simulation becomes conn-tracked.
    pub fn is_forward_flow(
        &mut self,
        cache: &dyn ConnCache,
        device: Uuid,
        cfg: &SimConfig,
    ) -> bool {
        self.conn_tracked = true;
        if let Some(fwd) = self.forward_flow {
            return fwd;
        }

        let fwd = match ConnKey::from_match(&self.current, device) {
            Some(key) => {
                if cache.get(&key.reversed()).is_some() {
                    false
                } else {
                    cache.put(
                        key,
                        ConnMarker(self.cookie.unwrap_or(0)),
                        Duration::from_millis(
                            cfg.return_flow_expiration_millis,
                        ),
                    );
                    self.tracked_key = Some(key);
                    true
                }
            }
            // No transport tuple to track; treat as forward.
            None => true,
        };

        self.forward_flow = Some(fwd);
        fwd
    }

    pub fn enable_tracing(&mut self) {
        self.trace_enabled = true;
    }

    pub fn trace_enabled(&self) -> bool {
        self.trace_enabled
    }

    /// Record a per-packet trace step.
    pub fn record_trace(
        &mut self,
        device: Option<Uuid>,
        message: impl Into<String>,
    ) {
        let message = message.into();
        trace!(
            cookie = ?self.cookie,
            parent = ?self.parent_cookie,
            ?device,
            "{message}"
        );
        if self.trace_enabled {
            self.trace_log.push(TraceEntry { device, message });
        }
    }

    pub fn trace_log(&self) -> &[TraceEntry] {
        &self.trace_log
    }

    pub fn devices_traversed(&self) -> u32 {
        self.traversed
    }

    /// Account a device visit against the traversal budget and the
    /// loop threshold.
    pub fn visit_device(
        &mut self,
        id: Uuid,
        cfg: &SimConfig,
    ) -> Result<(), ContextError> {
        self.traversed += 1;
        if self.traversed > cfg.max_devices_traversed {
            return Err(ContextError::TraversalExceeded(
                cfg.max_devices_traversed,
            ));
        }

        let visits = self.visits.entry(id).or_insert(0);
        *visits += 1;
        if *visits > cfg.loop_visit_threshold {
            return Err(ContextError::DeviceLoop(id));
        }
        Ok(())
    }
}
