// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Connection tracking.
//!
//! A tracked flow installs its [`ConnKey`] in the shared connection
//! cache; the first packet of the reverse flow finds that key and is
//! classified as a return flow. The cache is externally owned and
//! reached through the narrow [`ConnCache`] capability.

use crate::wildcard::WildcardMatch;
use simnet_api::Protocol;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::RwLock;
use std::time::Duration;
use std::time::Instant;
use uuid::Uuid;

/// The key identifying one direction of a connection: the transport
/// 5-tuple plus the egress device, so that overlapping address space
/// behind different devices cannot collide.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub struct ConnKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub proto: Protocol,
    pub src_port: u16,
    pub dst_port: u16,
    pub device: Uuid,
}

impl ConnKey {
    /// Derive a key from the current match and the device the flow
    /// egresses. `None` when the match has no transport 5-tuple.
    pub fn from_match(m: &WildcardMatch, device: Uuid) -> Option<Self> {
        Some(Self {
            src_ip: m.net_src?,
            dst_ip: m.net_dst?,
            proto: m.net_proto?,
            src_port: m.tp_src?,
            dst_port: m.tp_dst?,
            device,
        })
    }

    /// The key a return packet of this connection would derive.
    pub fn reversed(&self) -> Self {
        Self {
            src_ip: self.dst_ip,
            dst_ip: self.src_ip,
            proto: self.proto,
            src_port: self.dst_port,
            dst_port: self.src_port,
            device: self.device,
        }
    }
}

/// Marker stored against a tracked key; carries the cookie of the
/// simulation that installed it, for trace correlation.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ConnMarker(pub u64);

/// Capability over the shared connection cache. Implementations
/// synchronize internally; every operation is non-blocking from the
/// simulation's point of view.
pub trait ConnCache: Send + Sync {
    /// Record `key` for `ttl`. Re-putting an existing key refreshes
    /// its expiration.
    fn put(&self, key: ConnKey, marker: ConnMarker, ttl: Duration);

    /// Return the marker for `key` if present and not expired.
    fn get(&self, key: &ConnKey) -> Option<ConnMarker>;

    /// Release `key` ahead of its TTL. Fired when the flow that
    /// installed the key is removed, so dead connections do not
    /// linger as trackable state.
    fn remove(&self, key: &ConnKey) -> Option<ConnMarker>;
}

/// Host-local connection cache with lazy expiry.
#[derive(Debug, Default)]
pub struct InMemoryConnCache {
    map: RwLock<HashMap<ConnKey, (ConnMarker, Instant)>>,
}

impl InMemoryConnCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConnCache for InMemoryConnCache {
    fn put(&self, key: ConnKey, marker: ConnMarker, ttl: Duration) {
        let deadline = Instant::now() + ttl;
        self.map.write().unwrap().insert(key, (marker, deadline));
    }

    fn get(&self, key: &ConnKey) -> Option<ConnMarker> {
        let now = Instant::now();
        let map = self.map.read().unwrap();
        match map.get(key) {
            Some((marker, deadline)) if *deadline > now => Some(*marker),
            _ => None,
        }
    }

    fn remove(&self, key: &ConnKey) -> Option<ConnMarker> {
        let now = Instant::now();
        match self.map.write().unwrap().remove(key) {
            Some((marker, deadline)) if deadline > now => Some(marker),
            _ => None,
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn key() -> ConnKey {
        ConnKey {
            src_ip: "10.0.0.1".parse().unwrap(),
            dst_ip: "10.0.0.2".parse().unwrap(),
            proto: Protocol::TCP,
            src_port: 41000,
            dst_port: 443,
            device: Uuid::from_u128(9),
        }
    }

    #[test]
    fn reversed_swaps_endpoints_not_device() {
        let k = key();
        let r = k.reversed();
        assert_eq!(r.src_ip, k.dst_ip);
        assert_eq!(r.src_port, k.dst_port);
        assert_eq!(r.device, k.device);
        assert_eq!(r.reversed(), k);
    }

    #[test]
    fn derivation_requires_full_tuple() {
        let mut m = WildcardMatch::new();
        assert!(ConnKey::from_match(&m, Uuid::from_u128(1)).is_none());
        m.net_src = Some("10.0.0.1".parse().unwrap());
        m.net_dst = Some("10.0.0.2".parse().unwrap());
        m.net_proto = Some(Protocol::TCP);
        m.tp_src = Some(41000);
        m.tp_dst = Some(443);
        assert!(ConnKey::from_match(&m, Uuid::from_u128(1)).is_some());
    }

    #[test]
    fn cache_expires() {
        let cache = InMemoryConnCache::new();
        cache.put(key(), ConnMarker(1), Duration::from_secs(60));
        assert_eq!(cache.get(&key()), Some(ConnMarker(1)));
        assert_eq!(cache.get(&key().reversed()), None);

        cache.put(key(), ConnMarker(2), Duration::from_millis(0));
        assert_eq!(cache.get(&key()), None);
    }

    #[test]
    fn remove_releases_before_ttl() {
        let cache = InMemoryConnCache::new();
        cache.put(key(), ConnMarker(1), Duration::from_secs(60));
        assert_eq!(cache.remove(&key()), Some(ConnMarker(1)));
        assert_eq!(cache.get(&key()), None);
        // A second release finds nothing.
        assert_eq!(cache.remove(&key()), None);
    }
}
