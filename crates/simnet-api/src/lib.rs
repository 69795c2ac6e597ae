// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! Value types that cross the boundary between the simulation engine
//! and its collaborators: the datapath shim, which encodes flow
//! actions to the kernel, and the management plane, which describes
//! topology. Everything here is serde-friendly and carries no engine
//! behavior.

#![deny(unreachable_patterns)]
#![deny(unused_must_use)]

pub mod flow;
pub mod ip;
pub mod mac;

pub use flow::*;
pub use ip::*;
pub use mac::*;

/// The smallest tunnel id (VNI) the agent may allocate. Values below
/// this are reserved for statically configured tunnels.
pub const MIN_VNI: u32 = 10_000;

/// The largest tunnel id. VNIs are 24-bit on the wire.
pub const MAX_VNI: u32 = 0x00FF_FFFF;
