// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! [Reverse Path Forwarding][RPF] resolution.
//!
//! Multicast traffic from a source is only accepted on the interface that
//! unicast routing says leads back toward that source. Resolution asks the
//! [`RouteSource`] for the candidate routes of the longest covering prefix
//! and picks one deterministically:
//!
//! 1. drop candidates whose outgoing interface is unknown or down,
//! 2. keep the candidates with the lowest preference,
//! 3. of those, keep the candidates with the lowest metric,
//! 4. of those, take the one with the highest next-hop address.
//!
//! Connected routes have no gateway, so the source itself is the neighbor.
//! Resolution has no side effects.
//!
//! [RPF]: https://datatracker.ietf.org/doc/html/rfc7761#section-4.2

use crate::error::Error;
use crate::platform::{Route, RouteSource};
use crate::types::{IfIndex, RpfInfo};
use itertools::Itertools;
use std::net::IpAddr;
use std::time::Duration;

/// Resolve the RPF interface and neighbor for `source`.
///
/// Returns [`Error::UnresolvedRoute`] when no usable route exists and
/// [`Error::RouteLookup`] when the collaborator itself failed.
pub fn resolve<R, U>(
    routes: &R,
    source: IpAddr,
    timeout: Duration,
    usable: U,
) -> Result<RpfInfo, Error>
where
    R: RouteSource + ?Sized,
    U: Fn(IfIndex) -> bool,
{
    let candidates = routes.lookup_best_route(source, timeout)?;
    select(source, &candidates, usable).ok_or(Error::UnresolvedRoute(source))
}

/// Apply the selection policy to a candidate set.
pub fn select<U>(source: IpAddr, candidates: &[Route], usable: U) -> Option<RpfInfo>
where
    U: Fn(IfIndex) -> bool,
{
    let best = candidates
        .iter()
        .filter(|r| r.ifindex.is_some_and(&usable))
        .filter(|r| r.prefix.contains(source))
        .min_set_by_key(|r| r.preference)
        .into_iter()
        .min_set_by_key(|r| r.metric)
        .into_iter()
        .max_by_key(|r| r.nexthop.unwrap_or(source))?;

    let ifindex = best.ifindex?;
    Some(RpfInfo::resolved(
        source,
        ifindex,
        best.nexthop.unwrap_or(source),
        best.metric,
        best.preference,
    ))
}
