// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! PIM sparse mode forwarding-state engine.
//!
//! For every (S,G) channel this crate resolves the reverse path toward the
//! source, tracks downstream join/prune state per interface, derives the
//! outgoing interface list and keeps the forwarding plane in sync with it.
//! All state belongs to an [`Instance`], which processes events strictly in
//! order from a single queue. Timers are events too, so replaying a fixed
//! sequence of events always produces the same tables.

pub mod config;
pub mod driver;
pub mod error;
pub mod event;
pub mod ifchannel;
pub mod instance;
pub mod interface;
pub mod oil;
pub mod platform;
pub mod rpf;
pub mod scheduler;
pub mod stats;
pub mod timer;
pub mod types;
pub mod upstream;

mod log;

#[cfg(test)]
mod proptest;
#[cfg(test)]
mod test;

pub use config::PimConfig;
pub use error::Error;
pub use event::{Event, JoinPrune};
pub use instance::Instance;
pub use types::*;

pub const COMPONENT_PIM: &str = "pim";
pub const MOD_ENGINE: &str = "engine";
pub const MOD_DRIVER: &str = "driver";

/// Holdtime value meaning a join never expires.
pub const HOLDTIME_INFINITE: u16 = 0xffff;
