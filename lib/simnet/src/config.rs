// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Engine tunables.

use serde::Deserialize;
use serde::Serialize;

/// Simulation tunables. The defaults match the historical system and
/// are what every production deployment runs; the struct exists so a
/// deployment can shrink the traversal budget or the drop expirations
/// without a rebuild.
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct SimConfig {
    /// Hard bound on the number of device visits in one simulation.
    pub max_devices_traversed: u32,

    /// Visits to a single device beyond which the walk is declared a
    /// loop.
    pub loop_visit_threshold: u32,

    /// Hard expiration for temporary-drop flows, in milliseconds.
    pub temporary_drop_millis: u64,

    /// Idle expiration for ordinary flows, in milliseconds.
    pub idle_expiration_millis: u64,

    /// Hard expiration for conn-tracked return flows; forward flows
    /// use half of this so the tracked key outlives them.
    pub return_flow_expiration_millis: u64,

    /// Bound on nested rule-chain jumps.
    pub max_jump_depth: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            max_devices_traversed: 12,
            loop_visit_threshold: 2,
            temporary_drop_millis: 5_000,
            idle_expiration_millis: 60_000,
            return_flow_expiration_millis: 60_000,
            max_jump_depth: 10,
        }
    }
}

impl SimConfig {
    /// Hard expiration for the forward half of a tracked connection.
    pub fn forward_flow_expiration_millis(&self) -> u64 {
        self.return_flow_expiration_millis / 2
    }
}
