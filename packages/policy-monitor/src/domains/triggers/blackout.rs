//! Trigger blackout calendar.
//!
//! Stored as `{"periods":[{"start":"MM-DD","end":"MM-DD"}]}`. A period whose
//! end precedes its start wraps over the new year.

use chrono::{DateTime, Datelike, Utc};
use serde::{Deserialize, Serialize};

use super::error::EvaluationError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct MonthDay {
    pub month: u32,
    pub day: u32,
}

impl MonthDay {
    pub fn parse(raw: &str) -> Result<Self, EvaluationError> {
        let invalid = || EvaluationError::InvalidBlackout(format!("expected MM-DD, got {:?}", raw));
        let (month, day) = raw.trim().split_once('-').ok_or_else(invalid)?;
        let month: u32 = month.parse().map_err(|_| invalid())?;
        let day: u32 = day.parse().map_err(|_| invalid())?;
        if !(1..=12).contains(&month) || !(1..=31).contains(&day) {
            return Err(invalid());
        }
        Ok(Self { month, day })
    }

    pub fn of(at: DateTime<Utc>) -> Self {
        Self {
            month: at.month(),
            day: at.day(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlackoutPeriod {
    pub start: MonthDay,
    pub end: MonthDay,
}

impl BlackoutPeriod {
    pub fn contains(&self, day: MonthDay) -> bool {
        if self.start <= self.end {
            self.start <= day && day <= self.end
        } else {
            day >= self.start || day <= self.end
        }
    }
}

#[derive(Debug, Deserialize, Serialize)]
struct RawPeriod {
    start: String,
    end: String,
}

#[derive(Debug, Deserialize, Serialize)]
struct RawBlackout {
    #[serde(default)]
    periods: Vec<RawPeriod>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BlackoutPeriods {
    pub periods: Vec<BlackoutPeriod>,
}

impl BlackoutPeriods {
    pub fn from_json(raw: &serde_json::Value) -> Result<Self, EvaluationError> {
        let parsed: RawBlackout = serde_json::from_value(raw.clone())
            .map_err(|e| EvaluationError::InvalidBlackout(e.to_string()))?;
        let periods = parsed
            .periods
            .iter()
            .map(|p| {
                Ok(BlackoutPeriod {
                    start: MonthDay::parse(&p.start)?,
                    end: MonthDay::parse(&p.end)?,
                })
            })
            .collect::<Result<Vec<_>, EvaluationError>>()?;
        Ok(Self { periods })
    }

    pub fn is_blacked_out(&self, at: DateTime<Utc>) -> bool {
        let day = MonthDay::of(at);
        self.periods.iter().any(|p| p.contains(day))
    }
}
