// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::timer::{TimerId, TimerKind};
use crate::types::{ChannelKey, IfIndex};
use pim_common::net::IpNet;
use std::net::IpAddr;

/// A decoded join/prune entry received on an interface.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct JoinPrune {
    pub ifindex: IfIndex,
    /// Downstream router that sent the message.
    pub neighbor: IpAddr,
    pub key: ChannelKey,
    /// `true` for a join, `false` for a prune.
    pub joined: bool,
    /// Seconds. [`crate::HOLDTIME_INFINITE`] never expires.
    pub holdtime: u16,
}

/// Everything an instance reacts to. Events are handled one at a time, in
/// the order they were queued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Routes covering this prefix were added, removed or changed.
    RouteChange(IpNet),
    InterfaceAdd {
        ifindex: IfIndex,
        name: String,
        up: bool,
        addresses: Vec<IpAddr>,
    },
    InterfaceDelete(IfIndex),
    InterfaceUp(IfIndex),
    InterfaceDown(IfIndex),
    InterfaceAddress {
        ifindex: IfIndex,
        addresses: Vec<IpAddr>,
    },
    JoinPrune(JoinPrune),
    /// Local receivers appeared on (`present`) or left an interface.
    LocalMembership {
        ifindex: IfIndex,
        key: ChannelKey,
        present: bool,
    },
    /// The forwarding plane saw traffic for a channel it has no entry for,
    /// or reported activity on an existing one.
    DataArrival { key: ChannelKey, ifindex: IfIndex },
    /// Re-resolve every channel and rescan every interface, e.g. after the
    /// route collaborator reconnects.
    UpdateAllInterfaces,
    /// Run the full channel oil scan now.
    ScanOil,
    Timer(TimerId, TimerKind),
}
