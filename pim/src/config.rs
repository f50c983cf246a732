// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Per-instance protocol timers and policy constants.
//!
//! Timer values are stored as plain integers (seconds unless the field name
//! says otherwise) so the config round trips through JSON unchanged.

use crate::error::Error;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_JOIN_PRUNE_PERIOD: u64 = 60;
pub const DEFAULT_JOIN_HOLDTIME: u16 = 210;
pub const DEFAULT_PRUNE_OVERRIDE_MS: u64 = 3000;
pub const DEFAULT_KEEPALIVE_PERIOD: u64 = 210;
pub const DEFAULT_RPF_REFRESH_DELAY_MS: u64 = 50;
pub const DEFAULT_SCAN_INTERVAL: u64 = 60;
pub const DEFAULT_INSTALL_RETRY_LIMIT: u32 = 3;
pub const DEFAULT_COLLABORATOR_TIMEOUT_MS: u64 = 1000;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(default)]
pub struct PimConfig {
    /// Interval between periodic joins sent toward the RPF neighbor.
    pub join_prune_period: u64,

    /// Holdtime advertised in the joins and prunes this router sends.
    pub join_holdtime: u16,

    /// How long a pruned interface keeps forwarding while waiting for an
    /// overriding join from another downstream router.
    pub prune_override_ms: u64,

    /// Inactivity window after which an upstream entry with no downstream
    /// interest and no traffic is destroyed.
    pub keepalive_period: u64,

    /// Delay used to coalesce route change notifications into a single
    /// RPF refresh pass.
    pub rpf_refresh_delay_ms: u64,

    /// Period of the full consistency scan over RPF and channel oil state.
    pub scan_interval: u64,

    /// Consecutive forwarding plane install failures tolerated before an
    /// entry is flagged as degraded.
    pub install_retry_limit: u32,

    /// Upper bound on any single route collaborator call.
    pub collaborator_timeout_ms: u64,
}

impl Default for PimConfig {
    fn default() -> Self {
        Self {
            join_prune_period: DEFAULT_JOIN_PRUNE_PERIOD,
            join_holdtime: DEFAULT_JOIN_HOLDTIME,
            prune_override_ms: DEFAULT_PRUNE_OVERRIDE_MS,
            keepalive_period: DEFAULT_KEEPALIVE_PERIOD,
            rpf_refresh_delay_ms: DEFAULT_RPF_REFRESH_DELAY_MS,
            scan_interval: DEFAULT_SCAN_INTERVAL,
            install_retry_limit: DEFAULT_INSTALL_RETRY_LIMIT,
            collaborator_timeout_ms: DEFAULT_COLLABORATOR_TIMEOUT_MS,
        }
    }
}

impl PimConfig {
    pub fn validate(&self) -> Result<(), Error> {
        if self.join_prune_period == 0 {
            return Err(Error::Config("join_prune_period must be nonzero".into()));
        }
        if self.scan_interval == 0 {
            return Err(Error::Config("scan_interval must be nonzero".into()));
        }
        if self.install_retry_limit == 0 {
            return Err(Error::Config(
                "install_retry_limit must be nonzero".into(),
            ));
        }
        if self.collaborator_timeout_ms == 0 {
            return Err(Error::Config(
                "collaborator_timeout_ms must be nonzero".into(),
            ));
        }
        Ok(())
    }

    pub fn join_prune_period(&self) -> Duration {
        Duration::from_secs(self.join_prune_period)
    }

    pub fn prune_override(&self) -> Duration {
        Duration::from_millis(self.prune_override_ms)
    }

    pub fn keepalive_period(&self) -> Duration {
        Duration::from_secs(self.keepalive_period)
    }

    pub fn rpf_refresh_delay(&self) -> Duration {
        Duration::from_millis(self.rpf_refresh_delay_ms)
    }

    pub fn scan_interval(&self) -> Duration {
        Duration::from_secs(self.scan_interval)
    }

    pub fn collaborator_timeout(&self) -> Duration {
        Duration::from_millis(self.collaborator_timeout_ms)
    }
}
