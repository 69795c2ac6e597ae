// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

use core::fmt;
use core::fmt::Debug;
use core::fmt::Display;
use core::ops::Deref;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;

/// A MAC address.
#[derive(
    Clone,
    Copy,
    Default,
    Deserialize,
    Eq,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
    Hash,
)]
pub struct MacAddr {
    inner: [u8; 6],
}

impl MacAddr {
    pub const BROADCAST: Self = Self { inner: [0xFF; 6] };
    pub const ZERO: Self = Self { inner: [0x00; 6] };

    /// Return the bytes of the MAC address.
    #[inline]
    pub fn bytes(&self) -> [u8; 6] {
        self.inner
    }

    pub const fn from_const(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }

    /// Is this the all-ones broadcast address?
    #[inline]
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Is the group bit set? Broadcast is a multicast address too.
    #[inline]
    pub fn is_multicast(&self) -> bool {
        self.inner[0] & 0x01 != 0
    }

    /// A unicast address is neither multicast nor broadcast.
    #[inline]
    pub fn is_unicast(&self) -> bool {
        !self.is_multicast()
    }
}

impl From<MacAddr> for smoltcp::wire::EthernetAddress {
    fn from(addr: MacAddr) -> Self {
        Self(addr.bytes())
    }
}

impl From<smoltcp::wire::EthernetAddress> for MacAddr {
    fn from(addr: smoltcp::wire::EthernetAddress) -> Self {
        Self { inner: addr.0 }
    }
}

impl From<[u8; 6]> for MacAddr {
    fn from(bytes: [u8; 6]) -> Self {
        Self { inner: bytes }
    }
}

impl From<&[u8; 6]> for MacAddr {
    fn from(bytes: &[u8; 6]) -> Self {
        Self { inner: *bytes }
    }
}

impl AsRef<[u8]> for MacAddr {
    fn as_ref(&self) -> &[u8] {
        &self.inner
    }
}

impl Deref for MacAddr {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.inner
    }
}

impl FromStr for MacAddr {
    type Err = String;

    /// Parse the colon-separated form, requiring exactly six hex
    /// octets.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut inner = [0u8; 6];
        let mut parts = s.split(':');

        for octet in inner.iter_mut() {
            let part = parts
                .next()
                .ok_or_else(|| format!("too few octets: {s}"))?;
            *octet = u8::from_str_radix(part, 16)
                .map_err(|_| format!("bad octet: {part}"))?;
        }
        if parts.next().is_some() {
            return Err(format!("too many octets: {s}"));
        }

        Ok(MacAddr { inner })
    }
}

impl Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let [a, b, c, d, e, g] = self.inner;
        write!(f, "{a:02X}:{b:02X}:{c:02X}:{d:02X}:{e:02X}:{g:02X}")
    }
}

// Debug goes through the colon form as well; the raw byte array
// tells a reader nothing the string doesn't.
impl Debug for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "MacAddr({self})")
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parse_and_classify() {
        let mac: MacAddr = "02:DD:AA:DD:AA:03".parse().unwrap();
        assert_eq!(mac.bytes(), [0x02, 0xDD, 0xAA, 0xDD, 0xAA, 0x03]);
        assert!(mac.is_unicast());
        assert!(!mac.is_broadcast());

        assert!(MacAddr::BROADCAST.is_broadcast());
        assert!(MacAddr::BROADCAST.is_multicast());

        let mcast: MacAddr = "01:00:5E:00:00:FB".parse().unwrap();
        assert!(mcast.is_multicast());
        assert!(!mcast.is_broadcast());

        assert!("01:00:5E:00:00".parse::<MacAddr>().is_err());
        assert!("01:00:5E:00:00:FB:07".parse::<MacAddr>().is_err());
        assert!("01:00:5E:00:00:ZZ".parse::<MacAddr>().is_err());
    }
}
