// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per (S,G) upstream state machine.
//!
//! The state is a function of two inputs, the number of interface channels
//! holding a join (interest) and the RPF information:
//!
//! | interest | RPF        | state       |
//! |----------|------------|-------------|
//! | 0        | any        | NotJoined   |
//! | > 0      | resolved   | Joined      |
//! | > 0      | unresolved | JoinPending |
//!
//! Every change to either input runs [`UpstreamEntry::update`], which moves
//! to the implied state and emits the join/prune messages needed to get
//! there. When the RPF neighbor moves while joined, the old neighbor is
//! pruned before the new one is joined, and the incoming interface handed
//! to the forwarding plane only moves once the new join was accepted.
//!
//! A prune the message layer refuses is kept and retried on the join
//! refresh timer until it goes out, or until that neighbor is joined again.
//! If the committed incoming interface goes down the commitment is dropped
//! and a join toward the current RPF neighbor is retried.

use crate::config::PimConfig;
use crate::log::{pim_log, UNIT_UPSTREAM};
use crate::platform::JoinPruneSender;
use crate::stats::Stats;
use crate::timer::{TimerId, TimerKind, TimerQueue};
use crate::types::{
    ChannelKey, IfIndex, JoinPruneIntent, JoinPruneKind, RpfInfo, RpfPath,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::net::IpAddr;
use std::time::Duration;

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
pub enum UpstreamState {
    #[default]
    NotJoined,
    Joined,
    /// Downstream interest exists but there is no route to the source.
    JoinPending,
}

/// Transition context borrowed from the owning instance.
pub(crate) struct UpstreamCtx<'a, S: JoinPruneSender + ?Sized> {
    pub now: Duration,
    pub timers: &'a mut TimerQueue,
    pub config: &'a PimConfig,
    pub sender: &'a S,
    pub stats: &'a mut Stats,
    pub log: &'a Logger,
}

#[derive(Debug, Clone)]
pub struct UpstreamEntry {
    key: ChannelKey,
    rpf: RpfInfo,
    interest: usize,
    state: UpstreamState,
    join_desired: bool,
    last_transition: Duration,
    generation: u64,
    /// Incoming interface committed to the forwarding plane.
    iif: Option<IfIndex>,
    /// Where the last accepted join went.
    joined_upstream: Option<RpfPath>,
    /// Prune the message layer refused, retried with the join refresh.
    pending_prune: Option<RpfPath>,
    join_timer: Option<TimerId>,
    keepalive_timer: Option<TimerId>,
    last_traffic: Option<Duration>,
}

impl UpstreamEntry {
    pub(crate) fn new(
        key: ChannelKey,
        rpf: RpfInfo,
        generation: u64,
        now: Duration,
    ) -> Self {
        Self {
            key,
            rpf,
            interest: 0,
            state: UpstreamState::NotJoined,
            join_desired: false,
            last_transition: now,
            generation,
            iif: None,
            joined_upstream: None,
            pending_prune: None,
            join_timer: None,
            keepalive_timer: None,
            last_traffic: None,
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn rpf(&self) -> &RpfInfo {
        &self.rpf
    }

    pub fn state(&self) -> UpstreamState {
        self.state
    }

    pub fn interest(&self) -> usize {
        self.interest
    }

    pub fn join_desired(&self) -> bool {
        self.join_desired
    }

    pub fn iif(&self) -> Option<IfIndex> {
        self.iif
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn last_transition(&self) -> Duration {
        self.last_transition
    }

    pub(crate) fn owns_timer(&self, id: TimerId) -> bool {
        self.join_timer == Some(id) || self.keepalive_timer == Some(id)
    }

    pub(crate) fn add_interest<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.interest += 1;
        self.update(cx);
    }

    pub(crate) fn remove_interest<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.interest = self.interest.saturating_sub(1);
        self.update(cx);
    }

    /// Replace the RPF information. Returns the previous value if the
    /// interface or neighbor moved, after the state machine has reacted.
    pub(crate) fn set_rpf<S: JoinPruneSender + ?Sized>(
        &mut self,
        rpf: RpfInfo,
        cx: &mut UpstreamCtx<S>,
    ) -> Option<RpfInfo> {
        let old = std::mem::replace(&mut self.rpf, rpf);
        if old.same_path(&rpf) {
            return None;
        }
        cx.stats.rpf_changes += 1;
        pim_log!(cx.log, info, UNIT_UPSTREAM, "rpf changed";
            "key" => self.key.to_string(),
            "old" => old.to_string(),
            "new" => rpf.to_string()
        );
        self.update(cx);
        Some(old)
    }

    /// Move to the state implied by interest and RPF.
    pub(crate) fn update<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.join_desired = self.interest > 0;
        let target = match (self.join_desired, self.rpf.is_resolved()) {
            (false, _) => UpstreamState::NotJoined,
            (true, true) => UpstreamState::Joined,
            (true, false) => UpstreamState::JoinPending,
        };
        let want = match target {
            UpstreamState::Joined => self.rpf.path(),
            _ => None,
        };

        if self.joined_upstream != want {
            if let Some(old) = self.joined_upstream.take() {
                if old.neighbor != self.key.source {
                    self.prune(old, cx);
                }
            }
            if let Some(new) = want {
                self.join_toward(new, cx);
            }
        }

        if target != UpstreamState::Joined {
            self.iif = None;
            cx.timers.cancel_slot(&mut self.join_timer);
        }
        self.arm_prune_retry(cx);

        self.transition(target, cx);
        self.arm_keepalive(cx);
    }

    /// The interface the incoming interface was committed to went away.
    /// Returns true if the commitment was dropped.
    pub(crate) fn iif_lost<S: JoinPruneSender + ?Sized>(
        &mut self,
        ifindex: IfIndex,
        cx: &mut UpstreamCtx<S>,
    ) -> bool {
        if self.pending_prune.is_some_and(|p| p.ifindex == ifindex) {
            self.pending_prune = None;
        }
        if self.iif != Some(ifindex) {
            return false;
        }
        self.iif = None;
        if self.joined_upstream.is_some_and(|p| p.ifindex == ifindex) {
            self.joined_upstream = None;
        }
        pim_log!(cx.log, info, UNIT_UPSTREAM, "incoming interface lost";
            "key" => self.key.to_string(),
            "ifindex" => ifindex.to_string()
        );
        if self.state == UpstreamState::Joined && self.joined_upstream.is_none()
        {
            if let Some(path) = self.rpf.path().filter(|p| p.ifindex != ifindex)
            {
                self.join_toward(path, cx);
            }
        }
        true
    }

    /// Send a join toward `path` and commit the incoming interface if the
    /// message layer accepted it. Directly connected sources need no join.
    fn join_toward<S: JoinPruneSender + ?Sized>(
        &mut self,
        path: RpfPath,
        cx: &mut UpstreamCtx<S>,
    ) {
        cx.timers.cancel_slot(&mut self.join_timer);

        let direct = path.neighbor == self.key.source;
        let accepted =
            direct || self.send(JoinPruneKind::Join, path, cx).is_ok();

        if accepted {
            self.joined_upstream = Some(path);
            self.iif = Some(path.ifindex);
            if self.pending_prune == Some(path) {
                self.pending_prune = None;
            }
        }
        if !direct {
            // periodic refresh when accepted, retry otherwise
            self.arm_join_timer(cx);
        }
    }

    fn arm_join_timer<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.join_timer = Some(cx.timers.schedule(
            cx.now + cx.config.join_prune_period(),
            TimerKind::JoinRefresh {
                key: self.key,
                generation: self.generation,
            },
        ));
    }

    fn arm_prune_retry<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        if self.pending_prune.is_some() && self.join_timer.is_none() {
            self.arm_join_timer(cx);
        }
    }

    fn prune<S: JoinPruneSender + ?Sized>(
        &mut self,
        path: RpfPath,
        cx: &mut UpstreamCtx<S>,
    ) {
        match self.send(JoinPruneKind::Prune, path, cx) {
            Ok(()) if self.pending_prune == Some(path) => {
                self.pending_prune = None
            }
            Ok(()) => {}
            Err(_) => self.pending_prune = Some(path),
        }
    }

    pub(crate) fn join_timer_expired<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.join_timer = None;
        if let Some(path) = self.pending_prune {
            self.prune(path, cx);
        }
        if self.state == UpstreamState::Joined {
            match (self.joined_upstream, self.rpf.path()) {
                (Some(path), _) if path.neighbor == self.key.source => {}
                (Some(path), _) => {
                    let _ = self.send(JoinPruneKind::Join, path, cx);
                    self.arm_join_timer(cx);
                }
                (None, Some(path)) => self.join_toward(path, cx),
                (None, None) => {}
            }
        }
        self.arm_prune_retry(cx);
    }

    pub(crate) fn traffic_seen(&mut self, now: Duration) {
        self.last_traffic = Some(now);
    }

    /// Handle the end of the inactivity window. Returns true if the entry
    /// may be destroyed.
    pub(crate) fn keepalive_expired<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) -> bool {
        self.keepalive_timer = None;
        if self.state != UpstreamState::NotJoined || self.interest > 0 {
            return false;
        }
        if let Some(seen) = self.last_traffic {
            let quiet_until = seen + cx.config.keepalive_period();
            if cx.now < quiet_until {
                self.keepalive_timer = Some(cx.timers.schedule(
                    quiet_until,
                    TimerKind::Keepalive {
                        key: self.key,
                        generation: self.generation,
                    },
                ));
                return false;
            }
        }
        true
    }

    /// Withdraw from the upstream neighbor, if joined. Used at teardown.
    pub(crate) fn leave<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        self.interest = 0;
        self.update(cx);
    }

    pub(crate) fn cancel_timers(&mut self, timers: &mut TimerQueue) {
        timers.cancel_slot(&mut self.join_timer);
        timers.cancel_slot(&mut self.keepalive_timer);
    }

    fn arm_keepalive<S: JoinPruneSender + ?Sized>(
        &mut self,
        cx: &mut UpstreamCtx<S>,
    ) {
        let idle = self.state == UpstreamState::NotJoined && self.interest == 0;
        match (idle, self.keepalive_timer.is_some()) {
            (true, false) => {
                self.keepalive_timer = Some(cx.timers.schedule(
                    cx.now + cx.config.keepalive_period(),
                    TimerKind::Keepalive {
                        key: self.key,
                        generation: self.generation,
                    },
                ));
            }
            (false, true) => cx.timers.cancel_slot(&mut self.keepalive_timer),
            _ => {}
        }
    }

    fn transition<S: JoinPruneSender + ?Sized>(
        &mut self,
        to: UpstreamState,
        cx: &mut UpstreamCtx<S>,
    ) {
        if self.state == to {
            return;
        }
        pim_log!(cx.log, info, UNIT_UPSTREAM, "transition {:?} -> {:?}",
            self.state, to;
            "key" => self.key.to_string(),
            "rpf" => self.rpf.to_string(),
            "interest" => self.interest
        );
        self.state = to;
        self.last_transition = cx.now;
    }

    fn send<S: JoinPruneSender + ?Sized>(
        &self,
        kind: JoinPruneKind,
        path: RpfPath,
        cx: &mut UpstreamCtx<S>,
    ) -> Result<(), crate::Error> {
        let intent = JoinPruneIntent {
            kind,
            ifindex: path.ifindex,
            neighbor: path.neighbor,
            key: self.key,
            holdtime: cx.config.join_holdtime,
        };
        match cx.sender.send(intent) {
            Ok(()) => {
                match kind {
                    JoinPruneKind::Join => cx.stats.joins_sent += 1,
                    JoinPruneKind::Prune => cx.stats.prunes_sent += 1,
                }
                pim_log!(cx.log, debug, UNIT_UPSTREAM, "sent {}", intent);
                Ok(())
            }
            Err(e) => {
                cx.stats.send_failures += 1;
                pim_log!(cx.log, warn, UNIT_UPSTREAM, "send {} failed: {}",
                    intent, e;
                    "key" => self.key.to_string()
                );
                Err(e)
            }
        }
    }

    pub fn info(&self, now: Duration) -> UpstreamInfo {
        UpstreamInfo {
            key: self.key,
            state: self.state,
            rpf: self.rpf,
            interest: self.interest,
            join_desired: self.join_desired,
            iif: self.iif,
            upstream_neighbor: self.joined_upstream.map(|p| p.neighbor),
            pending_prune: self.pending_prune.map(|p| p.neighbor),
            since_transition: now.saturating_sub(self.last_transition).as_secs(),
            idle_for: self
                .last_traffic
                .map(|t| now.saturating_sub(t).as_secs()),
        }
    }
}

/// Read-only view of an upstream entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct UpstreamInfo {
    pub key: ChannelKey,
    pub state: UpstreamState,
    pub rpf: RpfInfo,
    pub interest: usize,
    pub join_desired: bool,
    pub iif: Option<IfIndex>,
    pub upstream_neighbor: Option<IpAddr>,
    /// Neighbor a refused prune is still owed to.
    pub pending_prune: Option<IpAddr>,
    /// Seconds since the last state transition.
    pub since_transition: u64,
    /// Seconds since traffic was last seen, if ever.
    pub idle_for: Option<u64>,
}
