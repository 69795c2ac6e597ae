// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Filter chains: rules, predicates, and the evaluator.
//!
//! A chain is an ordered rule list. Each rule pairs a predicate set
//! (AND across predicates, OR within one) with an action; NAT
//! transforms rewrite the working match in place when their rule
//! fires. Jumps recurse into other chains through the topology cache,
//! which is the evaluator's only suspension point.

use crate::config::SimConfig;
use crate::conntrack::ConnCache;
use crate::context::ContextError;
use crate::context::PacketContext;
use crate::topology::Chain;
use crate::topology::TopologyClient;
use futures::future::BoxFuture;
use simnet_api::FragmentType;
use simnet_api::IpCidr;
use simnet_api::MacAddr;
use simnet_api::Protocol;
use std::net::IpAddr;
use std::ops::RangeInclusive;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// A single match condition. A predicate holding a list matches when
/// any element does.
#[derive(Clone, Debug)]
pub enum Predicate {
    InputPort(Vec<Uuid>),
    EtherSrc(Vec<MacAddr>),
    EtherDst(Vec<MacAddr>),
    EtherType(Vec<u16>),
    SrcIp(Vec<IpCidr>),
    DstIp(Vec<IpCidr>),
    IpProto(Vec<Protocol>),
    SrcPort(Vec<RangeInclusive<u16>>),
    DstPort(Vec<RangeInclusive<u16>>),
    PortGroup(Vec<Uuid>),
    Fragment(Vec<FragmentType>),

    /// Matches the forward direction of a connection. Evaluating this
    /// (or its mirror) marks the simulation conn-tracked.
    ForwardFlow,

    /// Matches the return direction of a connection.
    ReturnFlow,

    Not(Box<Predicate>),
}

/// Evaluation surroundings a predicate may consult beyond the match
/// itself.
pub struct RuleEnv<'a> {
    pub conn_cache: &'a dyn ConnCache,
    pub cfg: &'a SimConfig,

    /// The device whose chain is being evaluated; scopes the
    /// conn-tracking key.
    pub owner: Uuid,
}

impl Predicate {
    pub(crate) fn is_match(
        &self,
        ctx: &mut PacketContext,
        env: &RuleEnv<'_>,
    ) -> bool {
        match self {
            Self::Not(pred) => !pred.is_match(ctx, env),

            Self::ForwardFlow => {
                ctx.is_forward_flow(env.conn_cache, env.owner, env.cfg)
            }

            Self::ReturnFlow => {
                !ctx.is_forward_flow(env.conn_cache, env.owner, env.cfg)
            }

            Self::InputPort(list) => {
                let m = ctx.current_match();
                m.input_port.is_some_and(|p| list.contains(&p))
            }

            Self::EtherSrc(list) => {
                let m = ctx.current_match();
                m.eth_src.is_some_and(|mac| list.contains(&mac))
            }

            Self::EtherDst(list) => {
                let m = ctx.current_match();
                m.eth_dst.is_some_and(|mac| list.contains(&mac))
            }

            Self::EtherType(list) => {
                let m = ctx.current_match();
                m.ether_type.is_some_and(|et| list.contains(&et))
            }

            Self::SrcIp(list) => {
                let m = ctx.current_match();
                m.net_src
                    .is_some_and(|ip| list.iter().any(|c| c.is_member(ip)))
            }

            Self::DstIp(list) => {
                let m = ctx.current_match();
                m.net_dst
                    .is_some_and(|ip| list.iter().any(|c| c.is_member(ip)))
            }

            Self::IpProto(list) => {
                let m = ctx.current_match();
                m.net_proto.is_some_and(|p| list.contains(&p))
            }

            Self::SrcPort(list) => {
                let m = ctx.current_match();
                m.tp_src
                    .is_some_and(|p| list.iter().any(|r| r.contains(&p)))
            }

            Self::DstPort(list) => {
                let m = ctx.current_match();
                m.tp_dst
                    .is_some_and(|p| list.iter().any(|r| r.contains(&p)))
            }

            Self::PortGroup(list) => {
                let m = ctx.current_match();
                m.port_groups
                    .as_ref()
                    .is_some_and(|groups| {
                        list.iter().any(|g| groups.contains(g))
                    })
            }

            Self::Fragment(list) => {
                let m = ctx.current_match();
                m.frag_type.is_some_and(|ft| list.contains(&ft))
            }
        }
    }
}

/// One endpoint rewrite of a NAT transform.
#[derive(Clone, Copy, Debug)]
pub struct NatTarget {
    pub ip: IpAddr,
    pub port: Option<u16>,
}

/// An in-place header rewrite applied when the owning rule matches.
#[derive(Clone, Copy, Debug, Default)]
pub struct NatTransform {
    pub src: Option<NatTarget>,
    pub dst: Option<NatTarget>,
}

impl NatTransform {
    fn apply(&self, ctx: &mut PacketContext) -> Result<(), ContextError> {
        let m = ctx.current_match_mut()?;
        if let Some(src) = self.src {
            m.net_src = Some(src.ip);
            if let Some(port) = src.port {
                m.tp_src = Some(port);
            }
        }
        if let Some(dst) = self.dst {
            m.net_dst = Some(dst.ip);
            if let Some(port) = dst.port {
                m.tp_dst = Some(port);
            }
        }
        Ok(())
    }
}

/// What a rule does when its predicates match.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RuleAction {
    Accept,
    Continue,
    Drop,
    Jump,
    Reject,
    Return,
}

/// One rule of a chain.
#[derive(Clone, Debug)]
pub struct Rule {
    pub predicates: Vec<Predicate>,
    pub action: RuleAction,

    /// Target chain for [`RuleAction::Jump`].
    pub jump_to: Option<Uuid>,

    pub nat: Option<NatTransform>,
}

impl Rule {
    pub fn new(action: RuleAction) -> Self {
        Self { predicates: vec![], action, jump_to: None, nat: None }
    }

    pub fn matching(predicates: Vec<Predicate>, action: RuleAction) -> Self {
        Self { predicates, action, jump_to: None, nat: None }
    }

    pub fn jump(predicates: Vec<Predicate>, target: Uuid) -> Self {
        Self {
            predicates,
            action: RuleAction::Jump,
            jump_to: Some(target),
            nat: None,
        }
    }

    fn is_match(&self, ctx: &mut PacketContext, env: &RuleEnv<'_>) -> bool {
        self.predicates.iter().all(|p| p.is_match(ctx, env))
    }
}

/// A chain's final word on a packet.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ChainVerdict {
    Accept,
    Drop,
    Reject,

    /// The chain itself is broken (missing jump target, jump depth,
    /// frozen-context mutation); the packet cannot be judged.
    Error,
}

#[derive(Debug, Error)]
enum ChainError {
    #[error("jump depth exceeded at chain {0}")]
    JumpDepthExceeded(Uuid),

    #[error("jump target {0} not in topology")]
    MissingJumpTarget(Uuid),

    #[error(transparent)]
    Context(#[from] ContextError),
}

enum Verdict {
    Accept,
    Drop,
    Reject,
    /// Fell off the end of the chain.
    Continue,
    /// Explicit RETURN; the calling chain resumes.
    Return,
}

/// Applies chains to a packet context.
pub struct ChainEvaluator<'a> {
    pub topology: &'a TopologyClient,
    pub conn_cache: &'a dyn ConnCache,
    pub cfg: &'a SimConfig,
}

impl ChainEvaluator<'_> {
    /// Evaluate `chain` for the device `owner`. An exhausted filter
    /// chain accepts; so does an explicit top-level RETURN.
    pub async fn apply(
        &self,
        chain: &Chain,
        ctx: &mut PacketContext,
        owner: Uuid,
        is_port_filter: bool,
    ) -> ChainVerdict {
        let verdict = match self.apply_inner(chain, ctx, owner, 0).await {
            Ok(Verdict::Accept | Verdict::Continue | Verdict::Return) => {
                ChainVerdict::Accept
            }
            Ok(Verdict::Drop) => ChainVerdict::Drop,
            Ok(Verdict::Reject) => ChainVerdict::Reject,
            Err(e) => {
                warn!(chain = %chain.id, %owner, error = %e, "chain error");
                ctx.record_trace(
                    Some(owner),
                    format!("chain {} error: {e}", chain.name),
                );
                ChainVerdict::Error
            }
        };

        ctx.record_trace(
            Some(owner),
            format!(
                "{} chain {} -> {verdict:?}",
                if is_port_filter { "port filter" } else { "device filter" },
                chain.name,
            ),
        );
        verdict
    }

    fn apply_inner<'b>(
        &'b self,
        chain: &'b Chain,
        ctx: &'b mut PacketContext,
        owner: Uuid,
        depth: u32,
    ) -> BoxFuture<'b, Result<Verdict, ChainError>> {
        Box::pin(async move {
            if depth > self.cfg.max_jump_depth {
                return Err(ChainError::JumpDepthExceeded(chain.id));
            }

            for rule in &chain.rules {
                let env = RuleEnv {
                    conn_cache: self.conn_cache,
                    cfg: self.cfg,
                    owner,
                };
                if !rule.is_match(ctx, &env) {
                    continue;
                }

                if let Some(nat) = &rule.nat {
                    nat.apply(ctx)?;
                }

                match rule.action {
                    RuleAction::Accept => return Ok(Verdict::Accept),
                    RuleAction::Drop => return Ok(Verdict::Drop),
                    RuleAction::Reject => return Ok(Verdict::Reject),
                    RuleAction::Return => return Ok(Verdict::Return),
                    RuleAction::Continue => continue,

                    RuleAction::Jump => {
                        let Some(target_id) = rule.jump_to else {
                            return Err(ChainError::MissingJumpTarget(
                                Uuid::nil(),
                            ));
                        };
                        let Some(target) = self
                            .topology
                            .chain(target_id, ctx.expiry())
                            .await
                        else {
                            return Err(ChainError::MissingJumpTarget(
                                target_id,
                            ));
                        };

                        match self
                            .apply_inner(&target, ctx, owner, depth + 1)
                            .await?
                        {
                            Verdict::Accept => return Ok(Verdict::Accept),
                            Verdict::Drop => return Ok(Verdict::Drop),
                            Verdict::Reject => return Ok(Verdict::Reject),
                            // The jumped-to chain yielded; resume at
                            // the next rule here.
                            Verdict::Continue | Verdict::Return => {}
                        }
                    }
                }
            }

            Ok(Verdict::Continue)
        })
    }
}
