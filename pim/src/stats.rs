// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Per-instance counters.
#[derive(
    Debug, Default, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema,
)]
pub struct Stats {
    pub rpf_refresh_requests: u64,
    pub rpf_refresh_runs: u64,
    pub rpf_changes: u64,
    pub rpf_lookup_failures: u64,
    pub joins_sent: u64,
    pub prunes_sent: u64,
    pub send_failures: u64,
    pub installs: u64,
    pub install_failures: u64,
    pub removals: u64,
    pub removal_failures: u64,
    pub oil_scans: u64,
    pub iif_repairs: u64,
    pub upstreams_created: u64,
    pub upstreams_destroyed: u64,
    /// Events referring to table state that does not exist.
    pub ignored_events: u64,
    /// Timer firings discarded because their entry was gone or recreated.
    pub stale_timers: u64,
}
