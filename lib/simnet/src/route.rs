// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Router forwarding tables.

use serde::Deserialize;
use serde::Serialize;
use simnet_api::IpCidr;
use std::net::IpAddr;
use uuid::Uuid;

/// Where a route sends a packet.
#[derive(Clone, Copy, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub enum NextHop {
    /// Forward out a router port, optionally via a gateway. Without a
    /// gateway the destination itself is the next hop (a directly
    /// connected subnet).
    Port { port: Uuid, gateway: Option<IpAddr> },

    /// Silently discard.
    Blackhole,

    /// Discard and answer with an ICMP administratively-prohibited
    /// error.
    Reject,
}

/// One forwarding entry.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct Route {
    pub dst: IpCidr,

    /// Optional source constraint; a route only applies when the
    /// packet's source falls in this block.
    pub src: Option<IpCidr>,

    pub next_hop: NextHop,

    /// Tie-breaker among routes of equal prefix length; lower wins.
    pub weight: u32,
}

/// An ordered forwarding table with longest-prefix-match lookup.
#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct RoutingTable {
    routes: Vec<Route>,
}

impl RoutingTable {
    pub fn new(routes: Vec<Route>) -> Self {
        Self { routes }
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Longest-prefix match on `dst`, constrained by `src` where a
    /// route carries a source block. Ties on prefix length fall to
    /// the lowest weight.
    pub fn lookup(&self, dst: IpAddr, src: Option<IpAddr>) -> Option<&Route> {
        self.routes
            .iter()
            .filter(|r| r.dst.is_member(dst))
            .filter(|r| match (&r.src, src) {
                (Some(block), Some(src)) => block.is_member(src),
                (Some(_), None) => false,
                (None, _) => true,
            })
            .max_by(|a, b| {
                a.dst
                    .prefix_len()
                    .cmp(&b.dst.prefix_len())
                    .then(b.weight.cmp(&a.weight))
            })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn table() -> RoutingTable {
        let port_a = Uuid::from_u128(0xA);
        let port_b = Uuid::from_u128(0xB);
        RoutingTable::new(vec![
            Route {
                dst: IpCidr::Ip4("0.0.0.0/0".parse().unwrap()),
                src: None,
                next_hop: NextHop::Port {
                    port: port_a,
                    gateway: Some("10.0.0.254".parse().unwrap()),
                },
                weight: 100,
            },
            Route {
                dst: IpCidr::Ip4("10.1.0.0/16".parse().unwrap()),
                src: None,
                next_hop: NextHop::Port { port: port_b, gateway: None },
                weight: 100,
            },
            Route {
                dst: IpCidr::Ip4("10.1.2.0/24".parse().unwrap()),
                src: None,
                next_hop: NextHop::Blackhole,
                weight: 100,
            },
        ])
    }

    #[test]
    fn longest_prefix_wins() {
        let t = table();
        let r = t.lookup("10.1.9.9".parse().unwrap(), None).unwrap();
        assert!(matches!(r.next_hop, NextHop::Port { gateway: None, .. }));

        let r = t.lookup("10.1.2.3".parse().unwrap(), None).unwrap();
        assert!(matches!(r.next_hop, NextHop::Blackhole));

        let r = t.lookup("8.8.8.8".parse().unwrap(), None).unwrap();
        assert!(matches!(r.next_hop, NextHop::Port { gateway: Some(_), .. }));
    }

    #[test]
    fn equal_prefix_falls_to_weight() {
        let hi = Uuid::from_u128(1);
        let lo = Uuid::from_u128(2);
        let t = RoutingTable::new(vec![
            Route {
                dst: IpCidr::Ip4("10.0.0.0/8".parse().unwrap()),
                src: None,
                next_hop: NextHop::Port { port: hi, gateway: None },
                weight: 200,
            },
            Route {
                dst: IpCidr::Ip4("10.0.0.0/8".parse().unwrap()),
                src: None,
                next_hop: NextHop::Port { port: lo, gateway: None },
                weight: 10,
            },
        ]);
        let r = t.lookup("10.5.5.5".parse().unwrap(), None).unwrap();
        assert!(matches!(r.next_hop, NextHop::Port { port, .. } if port == lo));
    }

    #[test]
    fn source_constrained_route() {
        let t = RoutingTable::new(vec![Route {
            dst: IpCidr::Ip4("0.0.0.0/0".parse().unwrap()),
            src: Some(IpCidr::Ip4("192.168.0.0/16".parse().unwrap())),
            next_hop: NextHop::Blackhole,
            weight: 100,
        }]);
        assert!(t
            .lookup("8.8.8.8".parse().unwrap(), None)
            .is_none());
        assert!(t
            .lookup(
                "8.8.8.8".parse().unwrap(),
                Some("192.168.1.1".parse().unwrap())
            )
            .is_some());
        assert!(t
            .lookup(
                "8.8.8.8".parse().unwrap(),
                Some("172.16.1.1".parse().unwrap())
            )
            .is_none());
    }

    #[test]
    fn no_route() {
        let t = RoutingTable::new(vec![]);
        assert!(t.lookup("10.0.0.1".parse().unwrap(), None).is_none());
    }
}
