// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Address prefixes as carried by route-change notifications.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::{
    net::{AddrParseError, IpAddr, Ipv4Addr, Ipv6Addr},
    num::ParseIntError,
};
use thiserror::Error;

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub enum IpNet {
    V4(Ipv4Net),
    V6(Ipv6Net),
}

impl std::fmt::Display for IpNet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::V4(p) => p.fmt(f),
            Self::V6(p) => p.fmt(f),
        }
    }
}

impl IpNet {
    /// Prefix of `len` bits containing `addr`, host bits zeroed.
    pub fn new(addr: IpAddr, len: u8) -> Self {
        match addr {
            IpAddr::V4(a) => Self::V4(Ipv4Net::new(a, len)),
            IpAddr::V6(a) => Self::V6(Ipv6Net::new(a, len)),
        }
    }

    /// Host route covering exactly `addr`.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(a) => Self::V4(Ipv4Net::new(a, Ipv4Net::HOST_LEN)),
            IpAddr::V6(a) => Self::V6(Ipv6Net::new(a, Ipv6Net::HOST_LEN)),
        }
    }

    pub fn addr(&self) -> IpAddr {
        match self {
            Self::V4(s) => s.addr.into(),
            Self::V6(s) => s.addr.into(),
        }
    }

    pub fn length(&self) -> u8 {
        match self {
            Self::V4(s) => s.len,
            Self::V6(s) => s.len,
        }
    }

    /// Whether `addr` falls inside this prefix. Addresses of the other
    /// family are never contained.
    pub fn contains(&self, addr: IpAddr) -> bool {
        match (self, addr) {
            (Self::V4(p), IpAddr::V4(a)) => p.contains(a),
            (Self::V6(p), IpAddr::V6(a)) => p.contains(a),
            _ => false,
        }
    }
}

impl From<Ipv4Net> for IpNet {
    fn from(value: Ipv4Net) -> Self {
        Self::V4(value)
    }
}

impl From<Ipv6Net> for IpNet {
    fn from(value: Ipv6Net) -> Self {
        Self::V6(value)
    }
}

#[derive(Debug, Error)]
pub enum IpPrefixParseError {
    #[error("v4 address parse error: {0}")]
    V4(#[from] Ipv4PrefixParseError),

    #[error("v6 address parse error: {0}")]
    V6(#[from] Ipv6PrefixParseError),
}

impl std::str::FromStr for IpNet {
    type Err = IpPrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Ok(result) = Ipv4Net::from_str(s) {
            return Ok(IpNet::V4(result));
        }
        Ok(IpNet::V6(Ipv6Net::from_str(s)?))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Ipv4Net {
    pub addr: Ipv4Addr,
    pub len: u8,
}

impl Ipv4Net {
    pub const HOST_LEN: u8 = 32;

    /// Create a prefix with its host bits zeroed. Lengths beyond 32 are
    /// clamped to a host route.
    pub fn new(addr: Ipv4Addr, len: u8) -> Self {
        let len = len.min(Self::HOST_LEN);
        Self {
            addr: Ipv4Addr::from(u32::from(addr) & Self::mask(len)),
            len,
        }
    }

    fn mask(len: u8) -> u32 {
        match len {
            0 => 0,
            _ => (!0u32) << (32 - len),
        }
    }

    pub fn contains(&self, addr: Ipv4Addr) -> bool {
        let mask = Self::mask(self.len.min(Self::HOST_LEN));
        u32::from(addr) & mask == u32::from(self.addr) & mask
    }
}

impl std::fmt::Display for Ipv4Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

#[derive(Debug, Error)]
pub enum Ipv4PrefixParseError {
    #[error("expected CIDR representation <addr>/<mask>")]
    Cidr,

    #[error("address parse error: {0}")]
    Addr(#[from] AddrParseError),

    #[error("mask parse error: {0}")]
    Mask(#[from] ParseIntError),

    #[error("mask length {0} out of range")]
    Length(u8),
}

impl std::str::FromStr for Ipv4Net {
    type Err = Ipv4PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) =
            s.split_once('/').ok_or(Ipv4PrefixParseError::Cidr)?;
        let len = u8::from_str(len)?;
        if len > Self::HOST_LEN {
            return Err(Ipv4PrefixParseError::Length(len));
        }
        Ok(Ipv4Net::new(Ipv4Addr::from_str(addr)?, len))
    }
}

#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct Ipv6Net {
    pub addr: Ipv6Addr,
    pub len: u8,
}

impl Ipv6Net {
    pub const HOST_LEN: u8 = 128;

    /// Create a prefix with its host bits zeroed. Lengths beyond 128 are
    /// clamped to a host route.
    pub fn new(addr: Ipv6Addr, len: u8) -> Self {
        let len = len.min(Self::HOST_LEN);
        Self {
            addr: Ipv6Addr::from(u128::from(addr) & Self::mask(len)),
            len,
        }
    }

    fn mask(len: u8) -> u128 {
        match len {
            0 => 0,
            _ => (!0u128) << (128 - len),
        }
    }

    pub fn contains(&self, addr: Ipv6Addr) -> bool {
        let mask = Self::mask(self.len.min(Self::HOST_LEN));
        u128::from(addr) & mask == u128::from(self.addr) & mask
    }
}

impl std::fmt::Display for Ipv6Net {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.addr, self.len)
    }
}

#[derive(Debug, Error)]
pub enum Ipv6PrefixParseError {
    #[error("expected CIDR representation <addr>/<mask>")]
    Cidr,

    #[error("address parse error: {0}")]
    Addr(#[from] AddrParseError),

    #[error("mask parse error: {0}")]
    Mask(#[from] ParseIntError),

    #[error("mask length {0} out of range")]
    Length(u8),
}

impl std::str::FromStr for Ipv6Net {
    type Err = Ipv6PrefixParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, len) =
            s.split_once('/').ok_or(Ipv6PrefixParseError::Cidr)?;
        let len = u8::from_str(len)?;
        if len > Self::HOST_LEN {
            return Err(Ipv6PrefixParseError::Length(len));
        }
        Ok(Ipv6Net::new(Ipv6Addr::from_str(addr)?, len))
    }
}
