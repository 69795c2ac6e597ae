// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

// Copyright 2025 Oxide Computer Company

//! IP address blocks and protocol numbers.

use core::fmt;
use core::fmt::Display;
use core::str::FromStr;
use serde::Deserialize;
use serde::Serialize;
use std::net::IpAddr;
use std::net::Ipv4Addr;
use std::net::Ipv6Addr;

/// An IP protocol number.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Protocol(pub u8);

impl Protocol {
    pub const ICMP: Self = Self(1);
    pub const TCP: Self = Self(6);
    pub const UDP: Self = Self(17);
    pub const ICMPV6: Self = Self(58);
}

impl Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Self::ICMP => write!(f, "ICMP"),
            Self::TCP => write!(f, "TCP"),
            Self::UDP => write!(f, "UDP"),
            Self::ICMPV6 => write!(f, "ICMPv6"),
            Self(proto) => write!(f, "proto={proto}"),
        }
    }
}

impl From<u8> for Protocol {
    fn from(val: u8) -> Self {
        Self(val)
    }
}

/// An IPv4 CIDR block.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv4Cidr {
    ip: Ipv4Addr,
    prefix_len: u8,
}

impl Ipv4Cidr {
    /// The default route: `0.0.0.0/0`.
    pub const ANY: Self = Self { ip: Ipv4Addr::UNSPECIFIED, prefix_len: 0 };

    /// Create a new block, truncating the address to the prefix.
    ///
    /// # Errors
    ///
    /// A prefix length greater than 32 is rejected.
    pub fn new(ip: Ipv4Addr, prefix_len: u8) -> Result<Self, String> {
        if prefix_len > 32 {
            return Err(format!("bad IPv4 prefix length: {prefix_len}"));
        }
        let ip = (u32::from(ip) & Self::mask_bits(prefix_len)).into();
        Ok(Self { ip, prefix_len })
    }

    fn mask_bits(prefix_len: u8) -> u32 {
        if prefix_len == 0 {
            0
        } else {
            u32::MAX << (32 - u32::from(prefix_len))
        }
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    /// The dotted-quad netmask of this block.
    pub fn to_mask(&self) -> Ipv4Addr {
        Self::mask_bits(self.prefix_len).into()
    }

    /// Does `ip` fall within this block?
    pub fn is_member(&self, ip: Ipv4Addr) -> bool {
        u32::from(ip) & Self::mask_bits(self.prefix_len) == u32::from(self.ip)
    }

    /// Is this the default route?
    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl Display for Ipv4Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for Ipv4Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_s, len_s) =
            s.split_once('/').ok_or_else(|| format!("no prefix: {s}"))?;
        let ip =
            ip_s.parse().map_err(|_| format!("bad IPv4 address: {ip_s}"))?;
        let prefix_len =
            len_s.parse().map_err(|_| format!("bad prefix: {len_s}"))?;
        Self::new(ip, prefix_len)
    }
}

/// An IPv6 CIDR block.
#[derive(
    Clone,
    Copy,
    Debug,
    Deserialize,
    Eq,
    Hash,
    Ord,
    PartialEq,
    PartialOrd,
    Serialize,
)]
pub struct Ipv6Cidr {
    ip: Ipv6Addr,
    prefix_len: u8,
}

impl Ipv6Cidr {
    pub fn new(ip: Ipv6Addr, prefix_len: u8) -> Result<Self, String> {
        if prefix_len > 128 {
            return Err(format!("bad IPv6 prefix length: {prefix_len}"));
        }
        let ip = (u128::from(ip) & Self::mask_bits(prefix_len)).into();
        Ok(Self { ip, prefix_len })
    }

    fn mask_bits(prefix_len: u8) -> u128 {
        if prefix_len == 0 {
            0
        } else {
            u128::MAX << (128 - u32::from(prefix_len))
        }
    }

    pub fn ip(&self) -> Ipv6Addr {
        self.ip
    }

    pub fn prefix_len(&self) -> u8 {
        self.prefix_len
    }

    pub fn is_member(&self, ip: Ipv6Addr) -> bool {
        u128::from(ip) & Self::mask_bits(self.prefix_len)
            == u128::from(self.ip)
    }

    pub fn is_default(&self) -> bool {
        self.prefix_len == 0
    }
}

impl Display for Ipv6Cidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}/{}", self.ip, self.prefix_len)
    }
}

impl FromStr for Ipv6Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (ip_s, len_s) =
            s.split_once('/').ok_or_else(|| format!("no prefix: {s}"))?;
        let ip =
            ip_s.parse().map_err(|_| format!("bad IPv6 address: {ip_s}"))?;
        let prefix_len =
            len_s.parse().map_err(|_| format!("bad prefix: {len_s}"))?;
        Self::new(ip, prefix_len)
    }
}

/// An IPv4 or IPv6 CIDR block.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize,
)]
pub enum IpCidr {
    Ip4(Ipv4Cidr),
    Ip6(Ipv6Cidr),
}

impl IpCidr {
    pub fn prefix_len(&self) -> u8 {
        match self {
            Self::Ip4(cidr) => cidr.prefix_len(),
            Self::Ip6(cidr) => cidr.prefix_len(),
        }
    }

    /// Does `ip` fall within this block? An address of the other IP
    /// version is never a member.
    pub fn is_member(&self, ip: IpAddr) -> bool {
        match (self, ip) {
            (Self::Ip4(cidr), IpAddr::V4(ip)) => cidr.is_member(ip),
            (Self::Ip6(cidr), IpAddr::V6(ip)) => cidr.is_member(ip),
            _ => false,
        }
    }

    pub fn is_default(&self) -> bool {
        match self {
            Self::Ip4(cidr) => cidr.is_default(),
            Self::Ip6(cidr) => cidr.is_default(),
        }
    }
}

impl Display for IpCidr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Ip4(cidr) => write!(f, "{cidr}"),
            Self::Ip6(cidr) => write!(f, "{cidr}"),
        }
    }
}

impl From<Ipv4Cidr> for IpCidr {
    fn from(cidr: Ipv4Cidr) -> Self {
        Self::Ip4(cidr)
    }
}

impl From<Ipv6Cidr> for IpCidr {
    fn from(cidr: Ipv6Cidr) -> Self {
        Self::Ip6(cidr)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cidr_membership() {
        let cidr: Ipv4Cidr = "192.168.222.0/24".parse().unwrap();
        assert!(cidr.is_member("192.168.222.2".parse().unwrap()));
        assert!(!cidr.is_member("192.168.223.2".parse().unwrap()));
        assert_eq!(cidr.to_mask(), Ipv4Addr::new(255, 255, 255, 0));
        assert!(Ipv4Cidr::ANY.is_member("8.8.8.8".parse().unwrap()));
    }

    #[test]
    fn cidr_truncates_host_bits() {
        let a: Ipv4Cidr = "10.0.0.77/8".parse().unwrap();
        let b: Ipv4Cidr = "10.9.9.9/8".parse().unwrap();
        assert_eq!(a, b);
        assert_eq!(a.ip(), Ipv4Addr::new(10, 0, 0, 0));
    }

    #[test]
    fn cidr_parse_errors() {
        assert!("10.0.0.0".parse::<Ipv4Cidr>().is_err());
        assert!("10.0.0.0/33".parse::<Ipv4Cidr>().is_err());
        assert!("fd00::/129".parse::<Ipv6Cidr>().is_err());
    }

    #[test]
    fn mixed_version_membership() {
        let cidr = IpCidr::Ip4("10.0.0.0/8".parse().unwrap());
        assert!(!cidr.is_member("fd00::1".parse().unwrap()));
    }
}
