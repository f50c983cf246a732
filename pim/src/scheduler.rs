// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Coalescing of route change notifications.
//!
//! Route changes tend to arrive in bursts. Each notification only records
//! the affected prefix; the first one arms a short refresh timer and the
//! RPF cache is refreshed once when it fires, covering every prefix seen in
//! the meantime.

use crate::timer::{TimerId, TimerKind, TimerQueue};
use pim_common::net::IpNet;
use std::collections::BTreeSet;
use std::net::IpAddr;
use std::time::Duration;

/// Which upstream entries a refresh must re-resolve.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshScope {
    Full,
    Prefixes(BTreeSet<IpNet>),
}

impl RefreshScope {
    pub fn covers(&self, addr: IpAddr) -> bool {
        match self {
            Self::Full => true,
            Self::Prefixes(prefixes) => {
                prefixes.iter().any(|p| p.contains(addr))
            }
        }
    }
}

#[derive(Debug, Default)]
pub struct RpfScheduler {
    pending: BTreeSet<IpNet>,
    full_sweep: bool,
    timer: Option<TimerId>,
}

impl RpfScheduler {
    /// Record a change to `prefix`, or to everything when `None`. Returns
    /// true if this request armed the refresh timer.
    pub fn request(
        &mut self,
        prefix: Option<IpNet>,
        at: Duration,
        timers: &mut TimerQueue,
    ) -> bool {
        match prefix {
            Some(p) => {
                self.pending.insert(p);
            }
            None => self.full_sweep = true,
        }
        if self.timer.is_some() {
            return false;
        }
        self.timer = Some(timers.schedule(at, TimerKind::RpfRefresh));
        true
    }

    pub fn owns_timer(&self, id: TimerId) -> bool {
        self.timer == Some(id)
    }

    pub fn is_scheduled(&self) -> bool {
        self.timer.is_some()
    }

    /// Consume everything requested so far. The timer is considered fired.
    pub fn take(&mut self) -> RefreshScope {
        self.timer = None;
        let pending = std::mem::take(&mut self.pending);
        if std::mem::take(&mut self.full_sweep) {
            RefreshScope::Full
        } else {
            RefreshScope::Prefixes(pending)
        }
    }

    pub fn cancel(&mut self, timers: &mut TimerQueue) {
        timers.cancel_slot(&mut self.timer);
        self.pending.clear();
        self.full_sweep = false;
    }
}
