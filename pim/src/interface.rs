// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::ifchannel::InterfaceChannel;
use crate::timer::TimerQueue;
use crate::types::{ChannelKey, IfIndex};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::net::IpAddr;

/// A multicast-capable interface and the downstream channels it owns.
#[derive(Debug, Clone)]
pub struct Interface {
    pub ifindex: IfIndex,
    pub name: String,
    pub up: bool,
    pub addresses: Vec<IpAddr>,
    pub(crate) channels: BTreeMap<ChannelKey, InterfaceChannel>,
}

impl Interface {
    pub fn new(
        ifindex: IfIndex,
        name: String,
        up: bool,
        addresses: Vec<IpAddr>,
    ) -> Self {
        Self {
            ifindex,
            name,
            up,
            addresses,
            channels: BTreeMap::new(),
        }
    }

    pub fn channel(&self, key: &ChannelKey) -> Option<&InterfaceChannel> {
        self.channels.get(key)
    }

    pub fn channels(&self) -> impl Iterator<Item = &InterfaceChannel> {
        self.channels.values()
    }

    /// Remove every channel, cancelling their timers first. Returns the
    /// keys of the channels that were holding a join.
    pub(crate) fn drain_channels(
        &mut self,
        timers: &mut TimerQueue,
    ) -> Vec<ChannelKey> {
        let mut joined = Vec::new();
        for (key, mut ch) in std::mem::take(&mut self.channels) {
            ch.cancel_timers(timers);
            if ch.holds_join() {
                joined.push(key);
            }
        }
        joined
    }

    pub fn info(&self) -> InterfaceInfo {
        InterfaceInfo {
            ifindex: self.ifindex,
            name: self.name.clone(),
            up: self.up,
            addresses: self.addresses.clone(),
            channels: self.channels.len(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct InterfaceInfo {
    pub ifindex: IfIndex,
    pub name: String,
    pub up: bool,
    pub addresses: Vec<IpAddr>,
    pub channels: usize,
}
