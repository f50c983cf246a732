// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A PIM routing instance.
//!
//! The instance owns every table: interfaces and the channels they carry,
//! upstream entries, channel OILs, timers and the event queue. Nothing
//! outside the instance mutates them, and the instance itself only does so
//! while handling one event at a time. Entries refer to each other by key
//! and are looked up in the owning table when needed.

use crate::config::PimConfig;
use crate::error::Error;
use crate::event::{Event, JoinPrune};
use crate::ifchannel::{
    ChannelCtx, IfChannelInfo, IfChannelState, InterfaceChannel, Outcome,
};
use crate::interface::{Interface, InterfaceInfo};
use crate::log::{
    pim_log, UNIT_IFCHANNEL, UNIT_INSTANCE, UNIT_RPF, UNIT_SCHEDULER,
};
use crate::oil::{self, ChannelOilInfo, DesiredOil, OilCtx, OilDelta, OilTable};
use crate::platform::{ForwardingPlane, JoinPruneSender, RouteSource};
use crate::rpf;
use crate::scheduler::{RefreshScope, RpfScheduler};
use crate::stats::Stats;
use crate::timer::{TimerId, TimerKind, TimerQueue};
use crate::types::{ChannelKey, IfIndex, OifMap, RpfInfo};
use crate::upstream::{UpstreamCtx, UpstreamEntry, UpstreamInfo, UpstreamState};
use pim_common::log::instance_logger;
use pim_common::net::IpNet;
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::net::IpAddr;
use std::time::Duration;

macro_rules! upstream_cx {
    ($inst:ident) => {
        UpstreamCtx {
            now: $inst.now,
            timers: &mut $inst.timers,
            config: &$inst.config,
            sender: &$inst.sender,
            stats: &mut $inst.stats,
            log: &$inst.log,
        }
    };
}

macro_rules! channel_cx {
    ($inst:ident) => {
        ChannelCtx {
            now: $inst.now,
            timers: &mut $inst.timers,
            config: &$inst.config,
        }
    };
}

pub struct Instance<R, F, S>
where
    R: RouteSource,
    F: ForwardingPlane,
    S: JoinPruneSender,
{
    name: String,
    config: PimConfig,
    routes: R,
    fp: F,
    sender: S,
    log: Logger,
    /// Time since the instance started.
    now: Duration,
    timers: TimerQueue,
    queue: VecDeque<Event>,
    interfaces: BTreeMap<IfIndex, Interface>,
    upstreams: BTreeMap<ChannelKey, UpstreamEntry>,
    oils: OilTable,
    scheduler: RpfScheduler,
    scan_timer: Option<TimerId>,
    stats: Stats,
    next_generation: u64,
}

impl<R, F, S> Instance<R, F, S>
where
    R: RouteSource,
    F: ForwardingPlane,
    S: JoinPruneSender,
{
    /// Create an instance and register it with the route source.
    pub fn new(
        name: impl Into<String>,
        config: PimConfig,
        routes: R,
        fp: F,
        sender: S,
        log: &Logger,
    ) -> Result<Self, Error> {
        config.validate()?;
        let name = name.into();
        routes.register(&name)?;
        let log = instance_logger(log, &name);
        pim_log!(log, info, UNIT_INSTANCE, "instance created";
            "config" => format!("{config:?}")
        );
        let mut instance = Self {
            name,
            config,
            routes,
            fp,
            sender,
            log,
            now: Duration::ZERO,
            timers: TimerQueue::default(),
            queue: VecDeque::new(),
            interfaces: BTreeMap::new(),
            upstreams: BTreeMap::new(),
            oils: OilTable::default(),
            scheduler: RpfScheduler::default(),
            scan_timer: None,
            stats: Stats::default(),
            next_generation: 0,
        };
        instance.arm_scan();
        Ok(instance)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PimConfig {
        &self.config
    }

    pub fn now(&self) -> Duration {
        self.now
    }

    pub fn stats(&self) -> &Stats {
        &self.stats
    }

    pub fn routes(&self) -> &R {
        &self.routes
    }

    pub fn forwarding_plane(&self) -> &F {
        &self.fp
    }

    pub fn sender(&self) -> &S {
        &self.sender
    }

    pub fn timers(&self) -> &TimerQueue {
        &self.timers
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.timers.next_deadline()
    }

    // Event processing ------------------------------------------------------

    /// Queue an event without processing it.
    pub fn enqueue(&mut self, event: Event) {
        self.queue.push_back(event);
    }

    /// Queue an event and process the queue until it is empty.
    pub fn handle(&mut self, event: Event) {
        self.enqueue(event);
        self.process_events();
    }

    /// Process queued events in order, then any timers that are due now,
    /// until neither is left.
    pub fn process_events(&mut self) {
        loop {
            if let Some(event) = self.queue.pop_front() {
                self.dispatch_logged(event);
                continue;
            }
            match self.timers.pop_expired(self.now) {
                Some((id, _, kind)) => {
                    self.queue.push_back(Event::Timer(id, kind))
                }
                None => break,
            }
        }
    }

    /// Move the clock forward to `at`, firing every timer due on the way in
    /// deadline order. The clock never moves backward.
    pub fn advance_to(&mut self, at: Duration) {
        self.process_events();
        while let Some(deadline) = self.timers.next_deadline() {
            if deadline > at {
                break;
            }
            self.now = self.now.max(deadline);
            self.process_events();
        }
        self.now = self.now.max(at);
    }

    pub fn advance(&mut self, by: Duration) {
        self.advance_to(self.now + by);
    }

    fn dispatch_logged(&mut self, event: Event) {
        match self.dispatch(event) {
            Ok(()) => {}
            Err(e @ Error::TimerCancellationRace(_)) => {
                self.stats.stale_timers += 1;
                pim_log!(self.log, debug, UNIT_INSTANCE, "{}", e);
            }
            Err(e) => {
                self.stats.ignored_events += 1;
                pim_log!(self.log, warn, UNIT_INSTANCE, "event ignored: {}", e);
            }
        }
    }

    fn dispatch(&mut self, event: Event) -> Result<(), Error> {
        match event {
            Event::RouteChange(prefix) => {
                self.request_refresh(Some(prefix));
                Ok(())
            }
            Event::InterfaceAdd {
                ifindex,
                name,
                up,
                addresses,
            } => self.interface_add(ifindex, name, up, addresses),
            Event::InterfaceDelete(ifindex) => {
                self.interface_delete(ifindex).map(|_| ())
            }
            Event::InterfaceUp(ifindex) => self.interface_set_up(ifindex),
            Event::InterfaceDown(ifindex) => self.interface_set_down(ifindex),
            Event::InterfaceAddress { ifindex, addresses } => {
                self.interface_addresses(ifindex, addresses)
            }
            Event::JoinPrune(jp) => self.join_prune(jp),
            Event::LocalMembership {
                ifindex,
                key,
                present,
            } => self.membership(ifindex, key, present),
            Event::DataArrival { key, ifindex } => {
                self.traffic(key, ifindex);
                Ok(())
            }
            Event::UpdateAllInterfaces => {
                self.request_refresh(None);
                Ok(())
            }
            Event::ScanOil => {
                self.scan_all();
                Ok(())
            }
            Event::Timer(id, kind) => self.timer(id, kind),
        }
    }

    // Public operations -----------------------------------------------------

    /// Routes covering `prefix` changed. Re-resolution is coalesced.
    pub fn on_route_change(&mut self, prefix: IpNet) {
        self.handle(Event::RouteChange(prefix));
    }

    pub fn receive_join_prune(&mut self, jp: JoinPrune) {
        self.handle(Event::JoinPrune(jp));
    }

    pub fn local_membership(
        &mut self,
        ifindex: IfIndex,
        key: ChannelKey,
        present: bool,
    ) {
        self.handle(Event::LocalMembership {
            ifindex,
            key,
            present,
        });
    }

    pub fn data_arrival(&mut self, key: ChannelKey, ifindex: IfIndex) {
        self.handle(Event::DataArrival { key, ifindex });
    }

    pub fn add_interface(
        &mut self,
        ifindex: IfIndex,
        name: impl Into<String>,
        up: bool,
        addresses: Vec<IpAddr>,
    ) {
        self.handle(Event::InterfaceAdd {
            ifindex,
            name: name.into(),
            up,
            addresses,
        });
    }

    pub fn remove_interface(&mut self, ifindex: IfIndex) {
        self.handle(Event::InterfaceDelete(ifindex));
    }

    pub fn interface_up(&mut self, ifindex: IfIndex) {
        self.handle(Event::InterfaceUp(ifindex));
    }

    pub fn interface_down(&mut self, ifindex: IfIndex) {
        self.handle(Event::InterfaceDown(ifindex));
    }

    pub fn interface_address_change(
        &mut self,
        ifindex: IfIndex,
        addresses: Vec<IpAddr>,
    ) {
        self.handle(Event::InterfaceAddress { ifindex, addresses });
    }

    /// Re-resolve every upstream entry soon, e.g. after the route source
    /// reconnected.
    pub fn update_all_interfaces(&mut self) {
        self.handle(Event::UpdateAllInterfaces);
    }

    /// Move an interface from this instance to `other`. Its channels here
    /// are torn down; it arrives in `other` with none.
    pub fn set_master<R2, F2, S2>(
        &mut self,
        ifindex: IfIndex,
        other: &mut Instance<R2, F2, S2>,
    ) -> Result<(), Error>
    where
        R2: RouteSource,
        F2: ForwardingPlane,
        S2: JoinPruneSender,
    {
        if other.interfaces.contains_key(&ifindex) {
            return Err(Error::InterfaceExists(ifindex));
        }
        let intf = self.interface_delete(ifindex)?;
        self.process_events();
        pim_log!(self.log, info, UNIT_INSTANCE, "interface moved";
            "ifindex" => ifindex.to_string(),
            "to" => other.name.clone()
        );
        other.handle(Event::InterfaceAdd {
            ifindex,
            name: intf.name,
            up: intf.up,
            addresses: intf.addresses,
        });
        Ok(())
    }

    /// Resolve the RPF toward `source` against the current routes and
    /// interfaces without changing any state.
    pub fn resolve(&self, source: IpAddr) -> Result<RpfInfo, Error> {
        let interfaces = &self.interfaces;
        rpf::resolve(
            &self.routes,
            source,
            self.config.collaborator_timeout(),
            |ifindex| interfaces.get(&ifindex).is_some_and(|i| i.up),
        )
    }

    /// The delta [`Self::sync`] would apply for `key`.
    pub fn recompute(&self, key: ChannelKey) -> OilDelta {
        oil::diff(self.oils.get(&key), self.desired_oil(&key).as_ref())
    }

    /// Bring the forwarding entry for `key` in line with current state.
    pub fn sync(&mut self, key: ChannelKey) -> OilDelta {
        let desired = self.desired_oil(&key);
        let mut cx = OilCtx {
            config: &self.config,
            stats: &mut self.stats,
            log: &self.log,
        };
        self.oils.sync(key, desired, &self.fp, &mut cx)
    }

    /// Check a single channel's forwarding entry against upstream state,
    /// repairing the incoming interface if it drifted and retrying failed
    /// installs and removals.
    pub fn scan_individual_oil(&mut self, key: ChannelKey) -> OilDelta {
        let existed = self.oils.get(&key).is_some();
        let delta = self.sync(key);
        if existed && delta.iif.is_some() {
            self.stats.iif_repairs += 1;
            pim_log!(self.log, warn, UNIT_INSTANCE,
                "repaired incoming interface";
                "key" => key.to_string(),
                "iif" => format!("{:?}", delta.iif)
            );
        }
        delta
    }

    pub fn scan_oil(&mut self) {
        self.handle(Event::ScanOil);
    }

    /// Withdraw from every upstream neighbor, remove every forwarding
    /// entry, cancel every timer and deregister from the route source.
    pub fn shutdown(&mut self) {
        self.queue.clear();
        for intf in self.interfaces.values_mut() {
            intf.drain_channels(&mut self.timers);
        }
        for mut up in std::mem::take(&mut self.upstreams).into_values() {
            let mut cx = upstream_cx!(self);
            up.leave(&mut cx);
            up.cancel_timers(&mut self.timers);
        }
        let mut cx = OilCtx {
            config: &self.config,
            stats: &mut self.stats,
            log: &self.log,
        };
        self.oils.clear(&self.fp, &mut cx);
        self.scheduler.cancel(&mut self.timers);
        self.scan_timer = None;
        self.timers.clear();
        self.routes.deregister(&self.name);
        pim_log!(self.log, info, UNIT_INSTANCE, "instance shut down");
    }

    // Diagnostics -----------------------------------------------------------

    pub fn upstream(&self, key: &ChannelKey) -> Option<UpstreamInfo> {
        self.upstreams.get(key).map(|u| u.info(self.now))
    }

    pub fn upstreams(&self) -> Vec<UpstreamInfo> {
        self.upstreams.values().map(|u| u.info(self.now)).collect()
    }

    pub fn channel_oil(&self, key: &ChannelKey) -> Option<ChannelOilInfo> {
        self.oils.get(key).map(|o| o.info())
    }

    pub fn channel_oils(&self) -> Vec<ChannelOilInfo> {
        self.oils.iter().map(|o| o.info()).collect()
    }

    pub fn interface_channel(
        &self,
        ifindex: IfIndex,
        key: &ChannelKey,
    ) -> Option<IfChannelInfo> {
        self.interfaces
            .get(&ifindex)?
            .channel(key)
            .map(|c| c.info(self.now, &self.timers))
    }

    pub fn interfaces(&self) -> Vec<InterfaceInfo> {
        self.interfaces.values().map(|i| i.info()).collect()
    }

    /// Interfaces currently holding join state for `key`.
    pub fn joined_interfaces(&self, key: &ChannelKey) -> BTreeSet<IfIndex> {
        self.interfaces
            .values()
            .filter(|i| i.channel(key).is_some_and(|c| c.holds_join()))
            .map(|i| i.ifindex)
            .collect()
    }

    // Interfaces ------------------------------------------------------------

    fn interface_add(
        &mut self,
        ifindex: IfIndex,
        name: String,
        up: bool,
        addresses: Vec<IpAddr>,
    ) -> Result<(), Error> {
        if self.interfaces.contains_key(&ifindex) {
            return Err(Error::InterfaceExists(ifindex));
        }
        pim_log!(self.log, info, UNIT_INSTANCE, "interface added";
            "ifindex" => ifindex.to_string(),
            "name" => name.clone(),
            "up" => up
        );
        self.interfaces
            .insert(ifindex, Interface::new(ifindex, name, up, addresses));
        if up {
            self.reresolve_interface(ifindex, true);
        }
        Ok(())
    }

    fn interface_delete(&mut self, ifindex: IfIndex) -> Result<Interface, Error> {
        let mut intf = self
            .interfaces
            .remove(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        pim_log!(self.log, info, UNIT_INSTANCE, "interface removed";
            "ifindex" => ifindex.to_string(),
            "name" => intf.name.clone()
        );
        let joined = intf.drain_channels(&mut self.timers);
        self.release_interest(joined);
        self.reresolve_interface(ifindex, false);
        self.release_iif(ifindex);
        Ok(intf)
    }

    fn interface_set_up(&mut self, ifindex: IfIndex) -> Result<(), Error> {
        let intf = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        if intf.up {
            return Ok(());
        }
        intf.up = true;
        pim_log!(self.log, info, UNIT_INSTANCE, "interface up";
            "ifindex" => ifindex.to_string()
        );
        self.reresolve_interface(ifindex, true);
        Ok(())
    }

    fn interface_set_down(&mut self, ifindex: IfIndex) -> Result<(), Error> {
        let intf = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        if !intf.up {
            return Ok(());
        }
        intf.up = false;
        let joined = intf.drain_channels(&mut self.timers);
        pim_log!(self.log, info, UNIT_INSTANCE, "interface down";
            "ifindex" => ifindex.to_string(),
            "channels" => joined.len()
        );
        self.release_interest(joined);
        self.reresolve_interface(ifindex, false);
        self.release_iif(ifindex);
        Ok(())
    }

    fn interface_addresses(
        &mut self,
        ifindex: IfIndex,
        addresses: Vec<IpAddr>,
    ) -> Result<(), Error> {
        let intf = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        intf.addresses = addresses;
        // connected routes may have moved
        self.request_refresh(None);
        Ok(())
    }

    /// Drop one unit of interest per key and resync.
    fn release_interest(&mut self, keys: Vec<ChannelKey>) {
        for key in keys {
            if let Some(up) = self.upstreams.get_mut(&key) {
                let mut cx = upstream_cx!(self);
                up.remove_interest(&mut cx);
            }
            self.sync(key);
        }
    }

    /// Drop the incoming interface of entries still committed to `ifindex`
    /// after re-resolution and withdraw their forwarding entries.
    fn release_iif(&mut self, ifindex: IfIndex) {
        let mut lost = Vec::new();
        for up in self.upstreams.values_mut() {
            let mut cx = upstream_cx!(self);
            if up.iif_lost(ifindex, &mut cx) {
                lost.push(up.key());
            }
        }
        for key in lost {
            self.sync(key);
        }
    }

    // Downstream state ------------------------------------------------------

    fn join_prune(&mut self, jp: JoinPrune) -> Result<(), Error> {
        let JoinPrune {
            ifindex,
            neighbor,
            key,
            joined,
            holdtime,
        } = jp;
        match self.interfaces.get(&ifindex) {
            None => return Err(Error::UnknownInterface(ifindex)),
            Some(intf) if !intf.up => {
                return Err(inconsistent(ifindex, key, "interface down"))
            }
            Some(intf) if !joined && intf.channel(&key).is_none() => {
                return Err(inconsistent(ifindex, key, "prune without join"))
            }
            Some(_) => {}
        }
        if joined {
            self.ensure_upstream(key);
        }

        let now = self.now;
        let next_generation = &mut self.next_generation;
        let intf = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        let ch = intf.channels.entry(key).or_insert_with(|| {
            *next_generation += 1;
            InterfaceChannel::new(ifindex, key, *next_generation, now)
        });
        let before = ch.holds_join();
        let mut cx = channel_cx!(self);
        let outcome = if joined {
            ch.receive_join(neighbor, holdtime, &mut cx)
        } else {
            ch.receive_prune(neighbor, &mut cx)
        };
        self.channel_changed(ifindex, key, before);
        check(outcome, ifindex, key)
    }

    fn membership(
        &mut self,
        ifindex: IfIndex,
        key: ChannelKey,
        present: bool,
    ) -> Result<(), Error> {
        match self.interfaces.get(&ifindex) {
            None => return Err(Error::UnknownInterface(ifindex)),
            Some(intf) if present && !intf.up => {
                return Err(inconsistent(ifindex, key, "interface down"))
            }
            _ => {}
        }
        if present {
            self.ensure_upstream(key);
        }

        let now = self.now;
        let next_generation = &mut self.next_generation;
        let intf = self
            .interfaces
            .get_mut(&ifindex)
            .ok_or(Error::UnknownInterface(ifindex))?;
        let (before, outcome) = if present {
            let ch = intf.channels.entry(key).or_insert_with(|| {
                *next_generation += 1;
                InterfaceChannel::new(ifindex, key, *next_generation, now)
            });
            (ch.holds_join(), ch.local_join())
        } else {
            let ch = intf.channels.get_mut(&key).ok_or_else(|| {
                inconsistent(ifindex, key, "leave without membership")
            })?;
            (ch.holds_join(), ch.local_leave())
        };
        self.channel_changed(ifindex, key, before);
        check(outcome, ifindex, key)
    }

    /// Settle the consequences of a channel transition: garbage collect it
    /// if it reached NoInfo, adjust upstream interest if its membership
    /// flipped, and resync the channel's forwarding entry.
    fn channel_changed(&mut self, ifindex: IfIndex, key: ChannelKey, before: bool) {
        let mut after = false;
        if let Some(intf) = self.interfaces.get_mut(&ifindex) {
            if let Some(state) = intf.channels.get(&key).map(|c| c.state()) {
                after = state.holds_join();
                if state == IfChannelState::NoInfo {
                    if let Some(mut ch) = intf.channels.remove(&key) {
                        ch.cancel_timers(&mut self.timers);
                        pim_log!(self.log, debug, UNIT_IFCHANNEL,
                            "channel removed";
                            "key" => key.to_string(),
                            "ifindex" => ifindex.to_string()
                        );
                    }
                }
            }
        }
        if before != after {
            if let Some(up) = self.upstreams.get_mut(&key) {
                let mut cx = upstream_cx!(self);
                if after {
                    up.add_interest(&mut cx);
                } else {
                    up.remove_interest(&mut cx);
                }
            }
        }
        self.sync(key);
    }

    fn traffic(&mut self, key: ChannelKey, ifindex: IfIndex) {
        self.ensure_upstream(key);
        let now = self.now;
        if let Some(up) = self.upstreams.get_mut(&key) {
            up.traffic_seen(now);
            if up.iif().is_some_and(|iif| iif != ifindex) {
                pim_log!(self.log, debug, UNIT_INSTANCE,
                    "traffic on non-rpf interface";
                    "key" => key.to_string(),
                    "ifindex" => ifindex.to_string()
                );
            }
        }
    }

    // Upstream state --------------------------------------------------------

    fn ensure_upstream(&mut self, key: ChannelKey) {
        if self.upstreams.contains_key(&key) {
            return;
        }
        let rpf = self
            .lookup_rpf(key.source)
            .unwrap_or(RpfInfo::unresolved(key.source));
        self.next_generation += 1;
        let mut up =
            UpstreamEntry::new(key, rpf, self.next_generation, self.now);
        let mut cx = upstream_cx!(self);
        up.update(&mut cx);
        self.upstreams.insert(key, up);
        self.stats.upstreams_created += 1;
        pim_log!(self.log, info, UNIT_INSTANCE, "upstream created";
            "key" => key.to_string(),
            "rpf" => rpf.to_string()
        );
    }

    fn destroy_upstream(&mut self, key: ChannelKey) {
        let Some(mut up) = self.upstreams.remove(&key) else {
            return;
        };
        up.cancel_timers(&mut self.timers);
        self.stats.upstreams_destroyed += 1;
        pim_log!(self.log, info, UNIT_INSTANCE, "upstream destroyed";
            "key" => key.to_string()
        );
        self.sync(key);
    }

    /// Resolve `source`, or `None` if the route source could not answer.
    fn lookup_rpf(&mut self, source: IpAddr) -> Option<RpfInfo> {
        match self.resolve(source) {
            Ok(rpf) => Some(rpf),
            Err(Error::UnresolvedRoute(_)) => Some(RpfInfo::unresolved(source)),
            Err(e) => {
                self.stats.rpf_lookup_failures += 1;
                pim_log!(self.log, warn, UNIT_RPF,
                    "keeping previous rpf: {}", e;
                    "source" => source.to_string()
                );
                None
            }
        }
    }

    fn request_refresh(&mut self, prefix: Option<IpNet>) {
        self.stats.rpf_refresh_requests += 1;
        let at = self.now + self.config.rpf_refresh_delay();
        if self.scheduler.request(prefix, at, &mut self.timers) {
            pim_log!(self.log, debug, UNIT_SCHEDULER, "rpf refresh scheduled";
                "at_ms" => at.as_millis() as u64
            );
        }
    }

    fn refresh_rpf(&mut self, scope: RefreshScope) {
        self.stats.rpf_refresh_runs += 1;
        let keys: Vec<ChannelKey> = self
            .upstreams
            .keys()
            .filter(|k| scope.covers(k.source))
            .copied()
            .collect();
        pim_log!(self.log, debug, UNIT_SCHEDULER, "rpf refresh";
            "scope" => format!("{scope:?}"),
            "entries" => keys.len()
        );
        self.reresolve(keys);
    }

    /// Re-resolve right away the entries that depend on `ifindex`, and the
    /// unresolved ones if it may have opened a path.
    fn reresolve_interface(&mut self, ifindex: IfIndex, unresolved: bool) {
        let keys = self
            .upstreams
            .values()
            .filter(|u| {
                u.rpf().interface() == Some(ifindex)
                    || u.iif() == Some(ifindex)
                    || (unresolved && !u.rpf().is_resolved())
            })
            .map(|u| u.key())
            .collect();
        self.reresolve(keys);
    }

    /// Resolve each distinct source once and hand the result to its
    /// entries. Entries keep their RPF if the lookup failed.
    fn reresolve(&mut self, keys: Vec<ChannelKey>) {
        let mut resolved: BTreeMap<IpAddr, Option<RpfInfo>> = BTreeMap::new();
        for key in keys {
            let rpf = match resolved.get(&key.source) {
                Some(rpf) => *rpf,
                None => {
                    let rpf = self.lookup_rpf(key.source);
                    resolved.insert(key.source, rpf);
                    rpf
                }
            };
            if let Some(rpf) = rpf {
                self.upstream_rpf_changed(key, rpf);
            }
        }
    }

    fn upstream_rpf_changed(&mut self, key: ChannelKey, rpf: RpfInfo) {
        let Some(up) = self.upstreams.get_mut(&key) else {
            return;
        };
        let mut cx = upstream_cx!(self);
        if up.set_rpf(rpf, &mut cx).is_some() {
            self.sync(key);
        }
    }

    // Forwarding state ------------------------------------------------------

    /// The forwarding entry `key` should have: the committed incoming
    /// interface and every other up interface holding join state. `None`
    /// when the upstream is not joined, the incoming interface is not up,
    /// or nothing would be forwarded.
    fn desired_oil(&self, key: &ChannelKey) -> Option<DesiredOil> {
        let up = self.upstreams.get(key)?;
        if up.state() != UpstreamState::Joined {
            return None;
        }
        let iif = up.iif()?;
        if !self.interfaces.get(&iif).is_some_and(|i| i.up) {
            return None;
        }
        let oifs: OifMap = self
            .interfaces
            .values()
            .filter(|i| i.up && i.ifindex != iif)
            .filter_map(|i| i.channel(key))
            .filter(|c| c.holds_join())
            .map(|c| (c.ifindex(), c.oif_flags()))
            .collect();
        if oifs.is_empty() {
            return None;
        }
        Some(DesiredOil { iif, oifs })
    }

    fn scan_all(&mut self) {
        self.stats.oil_scans += 1;
        let keys: BTreeSet<ChannelKey> = self
            .oils
            .keys()
            .into_iter()
            .chain(self.upstreams.keys().copied())
            .collect();
        for key in keys {
            self.scan_individual_oil(key);
        }
    }

    // Timers ----------------------------------------------------------------

    fn arm_scan(&mut self) {
        let at = self.now + self.config.scan_interval();
        self.scan_timer = Some(self.timers.schedule(at, TimerKind::Scan));
    }

    fn timer(&mut self, id: TimerId, kind: TimerKind) -> Result<(), Error> {
        match kind {
            TimerKind::RpfRefresh => {
                if !self.scheduler.owns_timer(id) {
                    return Err(stale(kind));
                }
                let scope = self.scheduler.take();
                self.refresh_rpf(scope);
            }
            TimerKind::Scan => {
                if self.scan_timer != Some(id) {
                    return Err(stale(kind));
                }
                self.arm_scan();
                self.refresh_rpf(RefreshScope::Full);
                self.scan_all();
            }
            TimerKind::JoinExpiry {
                ifindex,
                key,
                generation,
            }
            | TimerKind::PrunePending {
                ifindex,
                key,
                generation,
            } => {
                let Some(ch) = self
                    .interfaces
                    .get_mut(&ifindex)
                    .and_then(|i| i.channels.get_mut(&key))
                    .filter(|c| c.generation() == generation && c.owns_timer(id))
                else {
                    return Err(stale(kind));
                };
                let before = ch.holds_join();
                let mut cx = channel_cx!(self);
                let outcome = match kind {
                    TimerKind::JoinExpiry { .. } => ch.join_expired(&mut cx),
                    _ => ch.prune_pending_expired(&mut cx),
                };
                pim_log!(self.log, debug, UNIT_IFCHANNEL, "{:?} fired", kind);
                self.channel_changed(ifindex, key, before);
                check(outcome, ifindex, key)?;
            }
            TimerKind::JoinRefresh { key, generation } => {
                let Some(up) = self
                    .upstreams
                    .get_mut(&key)
                    .filter(|u| u.generation() == generation && u.owns_timer(id))
                else {
                    return Err(stale(kind));
                };
                let mut cx = upstream_cx!(self);
                up.join_timer_expired(&mut cx);
                self.sync(key);
            }
            TimerKind::Keepalive { key, generation } => {
                let Some(up) = self
                    .upstreams
                    .get_mut(&key)
                    .filter(|u| u.generation() == generation && u.owns_timer(id))
                else {
                    return Err(stale(kind));
                };
                let mut cx = upstream_cx!(self);
                if up.keepalive_expired(&mut cx) {
                    self.destroy_upstream(key);
                }
            }
        }
        Ok(())
    }
}

fn inconsistent(ifindex: IfIndex, key: ChannelKey, reason: &str) -> Error {
    Error::InconsistentTransition {
        ifindex,
        key,
        reason: reason.to_string(),
    }
}

fn check(outcome: Outcome, ifindex: IfIndex, key: ChannelKey) -> Result<(), Error> {
    match outcome {
        Outcome::Applied => Ok(()),
        Outcome::Ignored(reason) => Err(inconsistent(ifindex, key, reason)),
    }
}

fn stale(kind: TimerKind) -> Error {
    Error::TimerCancellationRace(format!("{kind:?}"))
}
