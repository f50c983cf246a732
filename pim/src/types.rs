// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::net::IpAddr;

/// Kernel interface index.
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
pub struct IfIndex(pub u32);

impl Display for IfIndex {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "if{}", self.0)
    }
}

/// A (source, group) channel.
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
pub struct ChannelKey {
    pub source: IpAddr,
    pub group: IpAddr,
}

impl ChannelKey {
    pub fn new(source: IpAddr, group: IpAddr) -> Self {
        Self { source, group }
    }
}

impl Display for ChannelKey {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "({},{})", self.source, self.group)
    }
}

/// Interface and neighbor toward a source. The two only ever exist
/// together.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct RpfPath {
    pub ifindex: IfIndex,
    pub neighbor: IpAddr,
}

/// Result of reverse path resolution for one source address.
///
/// Values are replaced wholesale on every re-resolution. Fields are private
/// so a half-updated interface/neighbor pair cannot be observed.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct RpfInfo {
    source: IpAddr,
    path: Option<RpfPath>,
    metric: u32,
    preference: u8,
}

impl RpfInfo {
    pub fn resolved(
        source: IpAddr,
        ifindex: IfIndex,
        neighbor: IpAddr,
        metric: u32,
        preference: u8,
    ) -> Self {
        Self {
            source,
            path: Some(RpfPath { ifindex, neighbor }),
            metric,
            preference,
        }
    }

    pub fn unresolved(source: IpAddr) -> Self {
        Self {
            source,
            path: None,
            metric: u32::MAX,
            preference: u8::MAX,
        }
    }

    pub fn source(&self) -> IpAddr {
        self.source
    }

    pub fn path(&self) -> Option<RpfPath> {
        self.path
    }

    pub fn interface(&self) -> Option<IfIndex> {
        self.path.map(|p| p.ifindex)
    }

    pub fn neighbor(&self) -> Option<IpAddr> {
        self.path.map(|p| p.neighbor)
    }

    pub fn metric(&self) -> u32 {
        self.metric
    }

    pub fn preference(&self) -> u8 {
        self.preference
    }

    pub fn is_resolved(&self) -> bool {
        self.path.is_some()
    }

    /// The source is on a directly connected subnet, so no upstream router
    /// needs to be joined.
    pub fn is_directly_connected(&self) -> bool {
        self.neighbor() == Some(self.source)
    }

    /// Whether `other` points at the same interface and neighbor. Metric
    /// changes alone do not move the upstream.
    pub fn same_path(&self, other: &RpfInfo) -> bool {
        self.path == other.path
    }
}

impl Display for RpfInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self.path {
            Some(p) => write!(
                f,
                "{} via {} on {} [{}/{}]",
                self.source, p.neighbor, p.ifindex, self.preference, self.metric
            ),
            None => write!(f, "{} unresolved", self.source),
        }
    }
}

/// Why an outgoing interface is in a channel's OIL.
#[derive(
    Debug,
    Default,
    Copy,
    Clone,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    JsonSchema,
)]
pub struct OifFlags {
    /// A downstream PIM join holds the interface.
    pub pim: bool,
    /// A local membership report holds the interface.
    pub local: bool,
}

pub type OifMap = BTreeMap<IfIndex, OifFlags>;

#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub enum JoinPruneKind {
    Join,
    Prune,
}

/// An outbound join or prune for the message layer to encode and send.
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema,
)]
pub struct JoinPruneIntent {
    pub kind: JoinPruneKind,
    pub ifindex: IfIndex,
    pub neighbor: IpAddr,
    pub key: ChannelKey,
    pub holdtime: u16,
}

impl Display for JoinPruneIntent {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?} {} to {} on {}",
            self.kind, self.key, self.neighbor, self.ifindex
        )
    }
}
