//! Monitoring cadence: how often a policy's scheduler ticks.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::closed_enum;

closed_enum! {
    /// Unit of a trigger's `monitor_frequency_value`.
    pub enum FrequencyUnit as "monitor frequency unit" {
        Hour => "hour",
        Day => "day",
        Week => "week",
        Month => "month",
        Year => "year",
    }
}

const HOUR_SECS: u64 = 60 * 60;
const DAY_SECS: u64 = 24 * HOUR_SECS;

impl FrequencyUnit {
    /// Length of one unit. Months are 30 days and years 365 days.
    pub fn unit_duration(&self) -> Duration {
        match self {
            FrequencyUnit::Hour => Duration::from_secs(HOUR_SECS),
            FrequencyUnit::Day => Duration::from_secs(DAY_SECS),
            FrequencyUnit::Week => Duration::from_secs(7 * DAY_SECS),
            FrequencyUnit::Month => Duration::from_secs(30 * DAY_SECS),
            FrequencyUnit::Year => Duration::from_secs(365 * DAY_SECS),
        }
    }
}

/// `monitor_interval` units of `unit` between scheduler ticks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorCadence {
    pub interval: u32,
    pub unit: FrequencyUnit,
}

impl MonitorCadence {
    pub fn new(interval: u32, unit: FrequencyUnit) -> Self {
        Self {
            interval: interval.max(1),
            unit,
        }
    }

    pub fn to_duration(&self) -> Duration {
        self.unit.unit_duration() * self.interval.max(1)
    }

    pub fn to_chrono(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.to_duration())
            .unwrap_or_else(|_| chrono::Duration::days(365))
    }
}
