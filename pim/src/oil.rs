// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Channel outgoing interface lists and their synchronization with the
//! forwarding plane.
//!
//! The instance derives a [`DesiredOil`] for a channel from upstream and
//! interface-channel state. [`OilTable::sync`] diffs it against what was
//! last installed and, when anything differs, replaces the forwarding
//! entry as a whole. Install failures are retried on later syncs until the
//! retry limit, after which the entry is marked degraded and left alone
//! until its interface list changes again.

use crate::config::PimConfig;
use crate::log::{pim_log, UNIT_OIL};
use crate::platform::ForwardingPlane;
use crate::stats::Stats;
use crate::types::{ChannelKey, IfIndex, OifFlags, OifMap};
use itertools::{EitherOrBoth, Itertools};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use slog::Logger;
use std::collections::{BTreeMap, BTreeSet};

/// The forwarding entry a channel should have.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredOil {
    pub iif: IfIndex,
    /// Never contains `iif`.
    pub oifs: OifMap,
}

/// Minimal difference between the installed and the desired entry.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct OilDelta {
    /// New incoming interface, if it moved.
    pub iif: Option<IfIndex>,
    pub added: Vec<(IfIndex, OifFlags)>,
    pub removed: Vec<IfIndex>,
    /// Interfaces that stay but are now held for a different reason.
    pub changed: Vec<(IfIndex, OifFlags)>,
    /// The entry should no longer exist.
    pub withdraw: bool,
}

impl OilDelta {
    pub fn is_empty(&self) -> bool {
        self.iif.is_none()
            && self.added.is_empty()
            && self.removed.is_empty()
            && self.changed.is_empty()
            && !self.withdraw
    }
}

#[derive(Debug, Clone)]
pub struct ChannelOil {
    key: ChannelKey,
    iif: IfIndex,
    oifs: OifMap,
    /// The forwarding plane holds exactly this entry.
    installed: bool,
    /// The forwarding plane holds some entry for this key, maybe stale.
    programmed: bool,
    failures: u32,
    degraded: bool,
    last_error: Option<String>,
}

impl ChannelOil {
    fn new(key: ChannelKey, iif: IfIndex) -> Self {
        Self {
            key,
            iif,
            oifs: OifMap::new(),
            installed: false,
            programmed: false,
            failures: 0,
            degraded: false,
            last_error: None,
        }
    }

    pub fn key(&self) -> ChannelKey {
        self.key
    }

    pub fn iif(&self) -> IfIndex {
        self.iif
    }

    pub fn oifs(&self) -> &OifMap {
        &self.oifs
    }

    pub fn installed(&self) -> bool {
        self.installed
    }

    pub fn degraded(&self) -> bool {
        self.degraded
    }

    pub fn info(&self) -> ChannelOilInfo {
        ChannelOilInfo {
            key: self.key,
            iif: self.iif,
            oifs: self
                .oifs
                .iter()
                .map(|(ifindex, flags)| OifInfo {
                    ifindex: *ifindex,
                    pim: flags.pim,
                    local: flags.local,
                })
                .collect(),
            installed: self.installed,
            failures: self.failures,
            degraded: self.degraded,
            last_error: self.last_error.clone(),
        }
    }
}

/// Compute the delta that turns `current` into `desired`.
pub fn diff(
    current: Option<&ChannelOil>,
    desired: Option<&DesiredOil>,
) -> OilDelta {
    let mut delta = OilDelta::default();
    let empty = OifMap::new();
    let (from, to) = match (current, desired) {
        (None, None) => return delta,
        (Some(cur), None) => {
            delta.withdraw = true;
            (&cur.oifs, &empty)
        }
        (cur, Some(want)) => {
            if cur.map(|c| c.iif) != Some(want.iif) {
                delta.iif = Some(want.iif);
            }
            (cur.map(|c| &c.oifs).unwrap_or(&empty), &want.oifs)
        }
    };
    for entry in from.iter().merge_join_by(to.iter(), |a, b| a.0.cmp(b.0)) {
        match entry {
            EitherOrBoth::Left((ifindex, _)) => delta.removed.push(*ifindex),
            EitherOrBoth::Right((ifindex, flags)) => {
                delta.added.push((*ifindex, *flags))
            }
            EitherOrBoth::Both((_, old), (ifindex, new)) if old != new => {
                delta.changed.push((*ifindex, *new))
            }
            EitherOrBoth::Both(..) => {}
        }
    }
    delta
}

/// Borrowed instance state used while syncing.
pub(crate) struct OilCtx<'a> {
    pub config: &'a PimConfig,
    pub stats: &'a mut Stats,
    pub log: &'a Logger,
}

#[derive(Debug, Default)]
pub struct OilTable {
    oils: BTreeMap<ChannelKey, ChannelOil>,
    /// Keys whose forwarding entry could not be removed.
    pending_removal: BTreeSet<ChannelKey>,
}

impl OilTable {
    pub fn get(&self, key: &ChannelKey) -> Option<&ChannelOil> {
        self.oils.get(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChannelOil> {
        self.oils.values()
    }

    pub fn keys(&self) -> Vec<ChannelKey> {
        self.oils
            .keys()
            .chain(self.pending_removal.iter())
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.oils.len()
    }

    pub fn is_empty(&self) -> bool {
        self.oils.is_empty()
    }

    pub fn pending_removal(&self) -> &BTreeSet<ChannelKey> {
        &self.pending_removal
    }

    /// Bring the forwarding plane entry for `key` in line with `desired`.
    /// Returns the delta that was applied to the table.
    pub(crate) fn sync<F: ForwardingPlane + ?Sized>(
        &mut self,
        key: ChannelKey,
        desired: Option<DesiredOil>,
        fp: &F,
        cx: &mut OilCtx,
    ) -> OilDelta {
        let delta = diff(self.oils.get(&key), desired.as_ref());
        let Some(want) = desired else {
            let programmed = match self.oils.remove(&key) {
                Some(oil) => oil.programmed,
                None => false,
            };
            if programmed || self.pending_removal.contains(&key) {
                self.remove(key, fp, cx);
            }
            return delta;
        };

        let oil = self
            .oils
            .entry(key)
            .or_insert_with(|| ChannelOil::new(key, want.iif));
        if !delta.is_empty() {
            pim_log!(cx.log, debug, UNIT_OIL, "oil changed";
                "key" => key.to_string(),
                "iif" => want.iif.to_string(),
                "added" => format!("{:?}", delta.added),
                "removed" => format!("{:?}", delta.removed)
            );
            oil.iif = want.iif;
            oil.oifs = want.oifs;
            oil.installed = false;
            oil.failures = 0;
            oil.degraded = false;
        }
        if oil.installed || oil.degraded {
            return delta;
        }

        let timeout = cx.config.collaborator_timeout();
        match fp.install_forwarding_entry(key, oil.iif, &oil.oifs, timeout) {
            Ok(()) => {
                cx.stats.installs += 1;
                oil.installed = true;
                oil.programmed = true;
                oil.failures = 0;
                oil.last_error = None;
                self.pending_removal.remove(&key);
            }
            Err(e) => {
                cx.stats.install_failures += 1;
                oil.failures += 1;
                oil.last_error = Some(e.to_string());
                if oil.failures >= cx.config.install_retry_limit {
                    oil.degraded = true;
                    pim_log!(cx.log, error, UNIT_OIL,
                        "giving up on forwarding entry after {} attempts: {}",
                        oil.failures, e;
                        "key" => key.to_string()
                    );
                } else {
                    pim_log!(cx.log, warn, UNIT_OIL,
                        "forwarding entry install failed: {}", e;
                        "key" => key.to_string(),
                        "attempt" => oil.failures
                    );
                }
            }
        }
        delta
    }

    fn remove<F: ForwardingPlane + ?Sized>(
        &mut self,
        key: ChannelKey,
        fp: &F,
        cx: &mut OilCtx,
    ) {
        match fp.remove_forwarding_entry(key, cx.config.collaborator_timeout())
        {
            Ok(()) => {
                cx.stats.removals += 1;
                self.pending_removal.remove(&key);
                pim_log!(cx.log, debug, UNIT_OIL, "forwarding entry removed";
                    "key" => key.to_string()
                );
            }
            Err(e) => {
                cx.stats.removal_failures += 1;
                self.pending_removal.insert(key);
                pim_log!(cx.log, warn, UNIT_OIL,
                    "forwarding entry removal failed: {}", e;
                    "key" => key.to_string()
                );
            }
        }
    }

    /// Remove every entry from the forwarding plane and forget them.
    pub(crate) fn clear<F: ForwardingPlane + ?Sized>(
        &mut self,
        fp: &F,
        cx: &mut OilCtx,
    ) {
        for key in self.keys() {
            self.sync(key, None, fp, cx);
        }
        self.oils.clear();
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct OifInfo {
    pub ifindex: IfIndex,
    pub pim: bool,
    pub local: bool,
}

/// Read-only view of a channel's forwarding entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ChannelOilInfo {
    pub key: ChannelKey,
    pub iif: IfIndex,
    pub oifs: Vec<OifInfo>,
    pub installed: bool,
    pub failures: u32,
    pub degraded: bool,
    pub last_error: Option<String>,
}
