// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Capability handles over externally owned shared state.
//!
//! The MAC-learning table and the ARP cache are owned by the topology
//! subsystem and shared by every simulation on the host. The engine
//! reaches them only through the [`MappingResource`] trait: a shared
//! map with get/set/remove, synchronized internally so the caller
//! never holds a lock across a suspension point.

use core::fmt::Debug;
use simnet_api::MacAddr;
use std::collections::BTreeMap;
use std::net::IpAddr;
use std::sync::Arc;
use std::sync::RwLock;
use uuid::Uuid;

/// A mapping resource represents a shared map from a key to a shared
/// entry. Multiple consumers may hold the same entry at once.
pub trait MappingResource: Debug + Send + Sync {
    type Key: Clone;
    type Entry: Clone;

    /// Get the entry with the given key, if one exists.
    fn get(&self, key: &Self::Key) -> Option<Self::Entry>;

    /// Remove the entry with the given key, if one exists.
    fn remove(&self, key: &Self::Key) -> Option<Self::Entry>;

    /// Set the entry with the given key. Return the previous entry,
    /// if one exists.
    fn set(&self, key: Self::Key, entry: Self::Entry)
        -> Option<Self::Entry>;
}

/// The key of a MAC-learning table entry. Learning is per-VLAN on
/// VLAN-aware bridges; untagged traffic learns under `vlan: None`.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub struct MacTableKey {
    pub vlan: Option<u16>,
    pub mac: MacAddr,
}

/// Handle to a bridge's MAC-learning table: MAC (per VLAN) → port.
pub type MacTable = Arc<dyn MappingResource<Key = MacTableKey, Entry = Uuid>>;

/// Handle to a router's ARP cache: next-hop IP → resolved MAC.
pub type ArpCache = Arc<dyn MappingResource<Key = IpAddr, Entry = MacAddr>>;

/// An in-memory [`MappingResource`], the host-local implementation
/// used in production for per-device tables and by every test.
#[derive(Debug, Default)]
pub struct SharedMap<K, V> {
    map: RwLock<BTreeMap<K, V>>,
}

impl<K: Ord, V> SharedMap<K, V> {
    pub fn new() -> Self {
        Self { map: RwLock::new(BTreeMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<K, V> MappingResource for SharedMap<K, V>
where
    K: Clone + Debug + Ord + Send + Sync,
    V: Clone + Debug + Send + Sync,
{
    type Key = K;
    type Entry = V;

    fn get(&self, key: &K) -> Option<V> {
        self.map.read().unwrap().get(key).cloned()
    }

    fn remove(&self, key: &K) -> Option<V> {
        self.map.write().unwrap().remove(key)
    }

    fn set(&self, key: K, entry: V) -> Option<V> {
        self.map.write().unwrap().insert(key, entry)
    }
}
