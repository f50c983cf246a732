// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

pub(crate) const UNIT_RPF: &str = "rpf";
pub(crate) const UNIT_SCHEDULER: &str = "scheduler";
pub(crate) const UNIT_UPSTREAM: &str = "upstream";
pub(crate) const UNIT_IFCHANNEL: &str = "ifchannel";
pub(crate) const UNIT_OIL: &str = "oil";
pub(crate) const UNIT_INSTANCE: &str = "instance";
pub(crate) const UNIT_DRIVER: &str = "driver";

macro_rules! pim_log {
    ($log:expr, $level:ident, $unit:expr, $msg:expr; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_ENGINE,
            "unit" => $unit,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $unit:expr, $msg:expr, $($args:expr),*; $($key:expr => $value:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_ENGINE,
            "unit" => $unit,
            $($key => $value),*
        )
    };
    ($log:expr, $level:ident, $unit:expr, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_ENGINE,
            "unit" => $unit,
        )
    };
    ($log:expr, $level:ident, $unit:expr, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_ENGINE,
            "unit" => $unit,
        )
    };
}

macro_rules! driver_log {
    ($log:expr, $level:ident, $msg:expr) => {
        slog::$level!($log,
            $msg;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_DRIVER,
            "unit" => crate::log::UNIT_DRIVER,
        )
    };
    ($log:expr, $level:ident, $msg:expr, $($args:expr),*) => {
        slog::$level!($log,
            $msg, $($args),*;
            "component" => crate::COMPONENT_PIM,
            "module" => crate::MOD_DRIVER,
            "unit" => crate::log::UNIT_DRIVER,
        )
    };
}

pub(crate) use {driver_log, pim_log};
