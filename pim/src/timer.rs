// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Cooperative timers.
//!
//! Timers never touch protocol state. When a deadline passes the timer is
//! popped and turned into an [`crate::Event::Timer`] that goes through the
//! same queue as every other event. Deadlines are offsets from the start of
//! the owning instance, so tests can drive time explicitly.

use crate::types::{ChannelKey, IfIndex};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimerId(u64);

/// What a timer is for. Entry-scoped timers carry the generation of the
/// entry that armed them so a late firing can be recognized.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TimerKind {
    /// Downstream join holdtime ran out.
    JoinExpiry {
        ifindex: IfIndex,
        key: ChannelKey,
        generation: u64,
    },
    /// Prune override window closed with no overriding join.
    PrunePending {
        ifindex: IfIndex,
        key: ChannelKey,
        generation: u64,
    },
    /// Periodic join toward the upstream neighbor.
    JoinRefresh { key: ChannelKey, generation: u64 },
    /// Inactivity window of an upstream entry.
    Keepalive { key: ChannelKey, generation: u64 },
    /// Coalesced RPF refresh after route changes.
    RpfRefresh,
    /// Periodic full consistency scan.
    Scan,
}

#[derive(Debug, Default)]
pub struct TimerQueue {
    next_id: u64,
    by_deadline: BTreeMap<(Duration, TimerId), TimerKind>,
    deadlines: HashMap<TimerId, Duration>,
}

impl TimerQueue {
    pub fn schedule(&mut self, at: Duration, kind: TimerKind) -> TimerId {
        let id = TimerId(self.next_id);
        self.next_id += 1;
        self.by_deadline.insert((at, id), kind);
        self.deadlines.insert(id, at);
        id
    }

    /// Cancel a pending timer. Returns false if it already fired or was
    /// cancelled.
    pub fn cancel(&mut self, id: TimerId) -> bool {
        match self.deadlines.remove(&id) {
            Some(at) => self.by_deadline.remove(&(at, id)).is_some(),
            None => false,
        }
    }

    /// Cancel the timer in `slot`, if any, leaving `None` behind.
    pub fn cancel_slot(&mut self, slot: &mut Option<TimerId>) {
        if let Some(id) = slot.take() {
            self.cancel(id);
        }
    }

    pub fn deadline(&self, id: TimerId) -> Option<Duration> {
        self.deadlines.get(&id).copied()
    }

    pub fn next_deadline(&self) -> Option<Duration> {
        self.by_deadline.keys().next().map(|(at, _)| *at)
    }

    /// Remove and return the earliest timer due at or before `now`.
    pub fn pop_expired(
        &mut self,
        now: Duration,
    ) -> Option<(TimerId, Duration, TimerKind)> {
        let (&(at, id), _) = self.by_deadline.iter().next()?;
        if at > now {
            return None;
        }
        let kind = self.by_deadline.remove(&(at, id))?;
        self.deadlines.remove(&id);
        Some((id, at, kind))
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    /// Pending timers that belong to the given channel, in any role.
    pub fn count_for(&self, key: &ChannelKey) -> usize {
        self.by_deadline
            .values()
            .filter(|kind| match kind {
                TimerKind::JoinExpiry { key: k, .. }
                | TimerKind::PrunePending { key: k, .. }
                | TimerKind::JoinRefresh { key: k, .. }
                | TimerKind::Keepalive { key: k, .. } => k == key,
                TimerKind::RpfRefresh | TimerKind::Scan => false,
            })
            .count()
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}
