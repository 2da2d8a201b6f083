//! UTC to local wall-clock conversion with a single fixed daylight-saving rule.
//!
//! No timezone database is consulted. The local offset is a constant standard
//! offset plus one hour whenever the UTC calendar date falls inside the DST
//! window computed by [`is_dst`].

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc};

use crate::config::ClockConfig;

const SECONDS_PER_HOUR: i32 = 3_600;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalTime {
    pub utc_epoch: i64,
    pub local_epoch: i64,
    pub dst: bool,
    pub local: DateTime<FixedOffset>,
}

impl LocalTime {
    pub fn hour(&self) -> u32 {
        self.local.hour()
    }

    pub fn minute(&self) -> u32 {
        self.local.minute()
    }

    pub fn minute_of_day(&self) -> u16 {
        (self.hour() * 60 + self.minute()) as u16
    }

    /// 12-hour clock text such as `"7:05"`, paired with `"AM"` / `"PM"`.
    pub fn twelve_hour(&self) -> (String, &'static str) {
        let hour = self.hour();
        let display_hour = if hour % 12 == 0 { 12 } else { hour % 12 };
        let suffix = if hour >= 12 { "PM" } else { "AM" };
        (format!("{}:{:02}", display_hour, self.minute()), suffix)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CivilTimeResolver {
    standard_offset_secs: i32,
    observe_dst: bool,
}

impl Default for CivilTimeResolver {
    fn default() -> Self {
        Self::from_config(&ClockConfig::default())
    }
}

impl CivilTimeResolver {
    pub fn from_config(config: &ClockConfig) -> Self {
        Self {
            standard_offset_secs: config.standard_offset_hours as i32 * SECONDS_PER_HOUR,
            observe_dst: config.observe_dst,
        }
    }

    pub fn resolve(&self, utc_epoch: i64) -> LocalTime {
        let utc = DateTime::<Utc>::from_timestamp(utc_epoch, 0).unwrap_or_default();
        let dst = self.observe_dst && is_dst(&utc);
        let offset_secs = self.standard_offset_secs + if dst { SECONDS_PER_HOUR } else { 0 };

        // ClockConfig::sanitize keeps the offset well inside chrono's +-24h.
        let offset = FixedOffset::east_opt(offset_secs).unwrap_or_else(|| Utc.fix());

        LocalTime {
            utc_epoch: utc.timestamp(),
            local_epoch: utc.timestamp() + offset.local_minus_utc() as i64,
            dst,
            local: utc.with_timezone(&offset),
        }
    }
}

/// Daylight-saving window test on UTC calendar fields.
///
/// April through September are always in DST, December through February never.
/// March enters DST once `day - weekday` reaches 8; October stays in DST only
/// while `day - weekday` is at most 0. This approximates the US rule and is
/// kept as-is so transition behavior stays reproducible.
pub fn is_dst(utc: &DateTime<Utc>) -> bool {
    let month = utc.month0();
    if !(2..=9).contains(&month) {
        return false;
    }
    if (3..=8).contains(&month) {
        return true;
    }

    let previous_sunday = utc.day() as i32 - utc.weekday().num_days_from_sunday() as i32;
    if month == 2 {
        previous_sunday >= 8
    } else {
        previous_sunday <= 0
    }
}
