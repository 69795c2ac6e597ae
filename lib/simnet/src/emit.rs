// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! The emit-generated-packet capability.
//!
//! Devices sometimes answer a packet themselves: ARP replies, ICMP
//! errors, DHCP offers. Those frames are not simulated inline; they
//! are queued to the datapath output stage through this handle and
//! leave the host as-is.

use tokio::sync::mpsc;
use uuid::Uuid;

/// A frame generated by a virtual device, to be transmitted out an
/// exterior port without simulation.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct GeneratedPacket {
    pub egress_port: Uuid,
    pub frame: Vec<u8>,
}

/// Sending half, held by every simulation.
#[derive(Clone, Debug)]
pub struct PacketEmitter {
    tx: mpsc::UnboundedSender<GeneratedPacket>,
}

impl PacketEmitter {
    /// Create an emitter and the receiving half the output stage
    /// drains.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<GeneratedPacket>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Queue a frame for transmission out `egress_port`. A closed
    /// receiver means the output stage is gone and the agent is
    /// shutting down; the frame is silently dropped.
    pub fn emit(&self, egress_port: Uuid, frame: Vec<u8>) {
        let _ = self.tx.send(GeneratedPacket { egress_port, frame });
    }
}
