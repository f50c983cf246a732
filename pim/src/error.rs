// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::types::{ChannelKey, IfIndex};
use std::net::IpAddr;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// No usable unicast route toward the source. This is a waiting state
    /// for the channel, not a failure of the engine.
    #[error("no usable route to {0}")]
    UnresolvedRoute(IpAddr),

    /// The route collaborator could not answer (timeout or transport
    /// failure). The previous RPF information stays in effect.
    #[error("route lookup for {0} failed: {1}")]
    RouteLookup(IpAddr, String),

    #[error("forwarding plane install failed for {0}: {1}")]
    ForwardingPlaneInstallFailure(ChannelKey, String),

    #[error("forwarding plane remove failed for {0}: {1}")]
    ForwardingPlaneRemoveFailure(ChannelKey, String),

    /// An event referenced table state that does not exist. Late and
    /// duplicate protocol messages produce these routinely.
    #[error("inconsistent transition on {ifindex} for {key}: {reason}")]
    InconsistentTransition {
        ifindex: IfIndex,
        key: ChannelKey,
        reason: String,
    },

    /// A timer fired for an entry that no longer exists or was recreated.
    #[error("stale timer for {0}")]
    TimerCancellationRace(String),

    #[error("message layer rejected {0}")]
    MessageLayer(String),

    #[error("unknown interface {0}")]
    UnknownInterface(IfIndex),

    #[error("interface {0} already exists")]
    InterfaceExists(IfIndex),

    #[error("config error: {0}")]
    Config(String),

    #[error("driver error: {0}")]
    Driver(String),
}
