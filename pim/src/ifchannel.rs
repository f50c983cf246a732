// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per (interface, S, G) downstream join/prune state machine.
//!
//! ```text
//!                 join / local join
//!     +--------+ ------------------> +------+
//!     | NoInfo |                     | Join | <---+ join (refresh)
//!     +--------+ <------------------ +------+ ----+
//!         ^        join expiry          |  ^
//!         |                       prune |  | join (override)
//!         |                             v  |
//!         |   prune pending expiry  +--------------+
//!         +------------------------ | PrunePending |
//!                                   +--------------+
//! ```
//!
//! Join and PrunePending both hold the interface in the channel's OIL:
//! traffic keeps flowing during the override window so another downstream
//! router on the link can still override the prune. A channel that returns
//! to NoInfo is destroyed by its interface.

use crate::config::PimConfig;
use crate::timer::{TimerId, TimerKind, TimerQueue};
use crate::types::{ChannelKey, IfIndex, OifFlags};
use crate::HOLDTIME_INFINITE;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
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
pub enum IfChannelState {
    /// No downstream interest. Transient: channels in this state are
    /// removed.
    #[default]
    NoInfo,

    /// Downstream interest from a PIM join, local membership or both.
    Join,

    /// A prune was received and the override window is open.
    PrunePending,
}

impl IfChannelState {
    /// Whether the interface is a member of the channel's OIL in this
    /// state.
    pub fn holds_join(self) -> bool {
        matches!(self, Self::Join | Self::PrunePending)
    }
}

/// Protocol join lifetime.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum Expiry {
    /// No protocol join is held.
    None,
    At(TimerId),
    Never,
}

/// Result of feeding an event to the state machine.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Outcome {
    Applied,
    /// The event does not apply to the current state.
    Ignored(&'static str),
}

/// Transition context borrowed from the owning instance.
pub(crate) struct ChannelCtx<'a> {
    pub now: Duration,
    pub timers: &'a mut TimerQueue,
    pub config: &'a PimConfig,
}

#[derive(Debug, Clone)]
pub struct InterfaceChannel {
    ifindex: IfIndex,
    key: ChannelKey,
    state: IfChannelState,
    local_membership: bool,
    expiry: Expiry,
    prune_timer: Option<TimerId>,
    generation: u64,
    created: Duration,
    last_neighbor: Option<IpAddr>,
}

impl InterfaceChannel {
    pub(crate) fn new(
        ifindex: IfIndex,
        key: ChannelKey,
        generation: u64,
        now: Duration,
    ) -> Self {
        Self {
            ifindex,
            key,
            state: IfChannelState::NoInfo,
            local_membership: false,
            expiry: Expiry::None,
            prune_timer: None,
            generation,
            created: now,
            last_neighbor: None,
        }
    }

    pub fn ifindex(&self) -> IfIndex {
        self.ifindex
    }

    /// The (S,G) this channel contributes to. This is the only link to the
    /// upstream entry; it is resolved by table lookup.
    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn state(&self) -> IfChannelState {
        self.state
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn local_membership(&self) -> bool {
        self.local_membership
    }

    pub fn holds_join(&self) -> bool {
        self.state.holds_join()
    }

    pub fn oif_flags(&self) -> OifFlags {
        OifFlags {
            pim: self.expiry != Expiry::None,
            local: self.local_membership,
        }
    }

    /// Whether `id` is a timer this channel currently has armed.
    pub(crate) fn owns_timer(&self, id: TimerId) -> bool {
        self.expiry == Expiry::At(id) || self.prune_timer == Some(id)
    }

    pub(crate) fn receive_join(
        &mut self,
        neighbor: IpAddr,
        holdtime: u16,
        cx: &mut ChannelCtx,
    ) -> Outcome {
        self.last_neighbor = Some(neighbor);
        self.refresh_expiry(holdtime, cx);
        // an overriding join closes the override window
        cx.timers.cancel_slot(&mut self.prune_timer);
        self.state = IfChannelState::Join;
        Outcome::Applied
    }

    pub(crate) fn receive_prune(
        &mut self,
        neighbor: IpAddr,
        cx: &mut ChannelCtx,
    ) -> Outcome {
        match self.state {
            IfChannelState::NoInfo => Outcome::Ignored("prune without join"),
            IfChannelState::PrunePending => Outcome::Applied,
            IfChannelState::Join if self.expiry == Expiry::None => {
                Outcome::Ignored("prune for locally joined channel")
            }
            IfChannelState::Join => {
                self.last_neighbor = Some(neighbor);
                let window = cx.config.prune_override();
                if window.is_zero() {
                    return self.prune_pending_expired(cx);
                }
                self.prune_timer = Some(cx.timers.schedule(
                    cx.now + window,
                    TimerKind::PrunePending {
                        ifindex: self.ifindex,
                        key: self.key,
                        generation: self.generation,
                    },
                ));
                self.state = IfChannelState::PrunePending;
                Outcome::Applied
            }
        }
    }

    pub(crate) fn prune_pending_expired(
        &mut self,
        cx: &mut ChannelCtx,
    ) -> Outcome {
        match self.state {
            IfChannelState::PrunePending | IfChannelState::Join => {
                cx.timers.cancel_slot(&mut self.prune_timer);
                self.drop_protocol_join(cx.timers);
                Outcome::Applied
            }
            IfChannelState::NoInfo => Outcome::Ignored("not prune pending"),
        }
    }

    pub(crate) fn join_expired(&mut self, cx: &mut ChannelCtx) -> Outcome {
        if self.expiry == Expiry::None {
            return Outcome::Ignored("no protocol join");
        }
        // the expiry timer has already fired, only forget it
        self.expiry = Expiry::None;
        cx.timers.cancel_slot(&mut self.prune_timer);
        self.settle();
        Outcome::Applied
    }

    pub(crate) fn local_join(&mut self) -> Outcome {
        self.local_membership = true;
        if self.state == IfChannelState::NoInfo {
            self.state = IfChannelState::Join;
        }
        Outcome::Applied
    }

    pub(crate) fn local_leave(&mut self) -> Outcome {
        if !self.local_membership {
            return Outcome::Ignored("no local membership");
        }
        self.local_membership = false;
        self.settle();
        Outcome::Applied
    }

    /// Cancel every timer this channel owns. Must run before the channel is
    /// dropped.
    pub(crate) fn cancel_timers(&mut self, timers: &mut TimerQueue) {
        cancel_expiry(&mut self.expiry, timers);
        timers.cancel_slot(&mut self.prune_timer);
    }

    fn refresh_expiry(&mut self, holdtime: u16, cx: &mut ChannelCtx) {
        if holdtime == HOLDTIME_INFINITE {
            cancel_expiry(&mut self.expiry, cx.timers);
            self.expiry = Expiry::Never;
            return;
        }
        let deadline = cx.now + Duration::from_secs(u64::from(holdtime));
        match self.expiry {
            Expiry::Never => return,
            Expiry::At(id) => match cx.timers.deadline(id) {
                Some(current) if current >= deadline => return,
                _ => {
                    cx.timers.cancel(id);
                }
            },
            Expiry::None => {}
        }
        self.expiry = Expiry::At(cx.timers.schedule(
            deadline,
            TimerKind::JoinExpiry {
                ifindex: self.ifindex,
                key: self.key,
                generation: self.generation,
            },
        ));
    }

    fn drop_protocol_join(&mut self, timers: &mut TimerQueue) {
        cancel_expiry(&mut self.expiry, timers);
        self.settle();
    }

    /// Collapse to the state implied by what still holds the channel.
    fn settle(&mut self) {
        self.state = if self.local_membership {
            IfChannelState::Join
        } else if self.expiry != Expiry::None {
            match self.prune_timer {
                Some(_) => IfChannelState::PrunePending,
                None => IfChannelState::Join,
            }
        } else {
            IfChannelState::NoInfo
        };
    }

    pub fn info(&self, now: Duration, timers: &TimerQueue) -> IfChannelInfo {
        let expires_in = match self.expiry {
            Expiry::At(id) => timers
                .deadline(id)
                .map(|at| at.saturating_sub(now).as_secs()),
            Expiry::None | Expiry::Never => None,
        };
        IfChannelInfo {
            ifindex: self.ifindex,
            key: self.key,
            state: self.state,
            local_membership: self.local_membership,
            expires_in,
            prune_pending: self.prune_timer.is_some(),
            last_neighbor: self.last_neighbor,
            uptime: now.saturating_sub(self.created).as_secs(),
        }
    }
}

fn cancel_expiry(expiry: &mut Expiry, timers: &mut TimerQueue) {
    if let Expiry::At(id) = *expiry {
        timers.cancel(id);
    }
    *expiry = Expiry::None;
}

/// Read-only view of an interface channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct IfChannelInfo {
    pub ifindex: IfIndex,
    pub key: ChannelKey,
    pub state: IfChannelState,
    pub local_membership: bool,
    /// Seconds until the downstream join expires. `None` if it never does
    /// or no protocol join is held.
    pub expires_in: Option<u64>,
    pub prune_pending: bool,
    pub last_neighbor: Option<IpAddr>,
    pub uptime: u64,
}
