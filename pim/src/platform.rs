// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Traits that decouple the engine from the systems around it: the unicast
//! routing table, the packet layer that encodes join/prune messages, and the
//! multicast forwarding plane. Tests substitute in-memory fakes.

use crate::error::Error;
use crate::types::{ChannelKey, IfIndex, JoinPruneIntent, OifMap};
use pim_common::net::IpNet;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::sync::mpsc::Sender;
use std::time::Duration;

/// One candidate unicast route toward an address.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct Route {
    pub prefix: IpNet,
    /// Gateway address. `None` for connected routes.
    pub nexthop: Option<IpAddr>,
    /// Outgoing interface, if the routing table knows it.
    pub ifindex: Option<IfIndex>,
    pub metric: u32,
    /// Administrative preference (distance). Lower is better.
    pub preference: u8,
}

/// The unicast routing collaborator.
pub trait RouteSource {
    /// Return every candidate route of the longest prefix covering `addr`.
    /// An empty result means no covering route exists. Implementations must
    /// give up after `timeout` rather than block the caller.
    fn lookup_best_route(
        &self,
        addr: IpAddr,
        timeout: Duration,
    ) -> Result<Vec<Route>, Error>;

    /// Start delivering route and interface notifications for `instance`.
    fn register(&self, instance: &str) -> Result<(), Error>;

    /// Stop delivering notifications for `instance`.
    fn deregister(&self, instance: &str);
}

/// The multicast forwarding plane. Entries are replaced whole, never
/// edited one interface at a time. Both calls must give up after `timeout`
/// and report an error rather than block the caller; the entry is then
/// retried on a later sync.
pub trait ForwardingPlane {
    fn install_forwarding_entry(
        &self,
        key: ChannelKey,
        iif: IfIndex,
        oifs: &OifMap,
        timeout: Duration,
    ) -> Result<(), Error>;

    fn remove_forwarding_entry(
        &self,
        key: ChannelKey,
        timeout: Duration,
    ) -> Result<(), Error>;
}

/// The join/prune message layer. Returning `Ok` means the message was
/// accepted for transmission.
pub trait JoinPruneSender {
    fn send(&self, intent: JoinPruneIntent) -> Result<(), Error>;
}

impl JoinPruneSender for Sender<JoinPruneIntent> {
    fn send(&self, intent: JoinPruneIntent) -> Result<(), Error> {
        Sender::send(self, intent)
            .map_err(|e| Error::MessageLayer(e.to_string()))
    }
}
