//! Time-of-day windows and installation visibility schedules.
//!
//! Night mode, dim mode and per-installation schedules are all evaluated in
//! the device's local timezone. Windows are half-open (`[start, end)`) and
//! may wrap past midnight:
//!
//! ```yaml
//! # Visible on weekday mornings only
//! schedule:
//!   days: weekdays
//!   start: "06:00"
//!   end: "09:00"
//!
//! # Overnight window, active from 22:00 until 07:00
//! night_mode:
//!   enabled: true
//!   start: "22:00"
//!   end: "07:00"
//! ```

use chrono::{DateTime, Datelike, NaiveTime, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

/// A half-open time-of-day window, `[start, end)`.
///
/// When `start > end` the window wraps midnight and is active outside
/// `[end, start)`. A window with `start == end` is never active.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl TimeWindow {
    /// Build a window from two `HH:MM` strings.
    pub fn parse(start: &str, end: &str) -> Option<Self> {
        Some(Self {
            start: parse_time(start)?,
            end: parse_time(end)?,
        })
    }

    /// Check if `time` falls inside the window.
    pub fn contains(&self, time: NaiveTime) -> bool {
        if self.start <= self.end {
            // Normal range (e.g., 09:00 - 17:00)
            time >= self.start && time < self.end
        } else {
            // Overnight range (e.g., 23:00 - 06:00)
            time >= self.start || time < self.end
        }
    }
}

/// Day selector for visibility schedules.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DaySelector {
    /// A specific list of days (e.g., ["mon", "tue", "wed"])
    List(Vec<String>),
    /// A named group: "all", "weekdays", "weekends", or a single day name
    Named(String),
}

impl Default for DaySelector {
    fn default() -> Self {
        DaySelector::Named("all".to_string())
    }
}

impl DaySelector {
    /// Check if this selector includes the given weekday.
    pub fn matches(&self, weekday: Weekday) -> bool {
        match self {
            DaySelector::Named(name) => match name.to_lowercase().as_str() {
                "all" => true,
                "weekdays" => matches!(
                    weekday,
                    Weekday::Mon | Weekday::Tue | Weekday::Wed | Weekday::Thu | Weekday::Fri
                ),
                "weekends" => matches!(weekday, Weekday::Sat | Weekday::Sun),
                _ => weekday_from_str(name) == Some(weekday),
            },
            DaySelector::List(days) => days.iter().any(|d| weekday_from_str(d) == Some(weekday)),
        }
    }
}

/// When an installation is allowed to appear in rotation.
///
/// Missing `start`/`end` means "all day" on the selected days.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct VisibilitySchedule {
    #[serde(default)]
    pub days: DaySelector,
    #[serde(default)]
    pub start: Option<String>,
    #[serde(default)]
    pub end: Option<String>,
}

impl VisibilitySchedule {
    /// Evaluate the schedule at a local date-time.
    pub fn is_active_at<T: chrono::TimeZone>(&self, dt: &DateTime<T>) -> bool {
        if !self.days.matches(dt.weekday()) {
            return false;
        }

        match (self.start.as_deref(), self.end.as_deref()) {
            (Some(start), Some(end)) => match TimeWindow::parse(start, end) {
                Some(window) => window.contains(time_of_day(dt)),
                None => {
                    tracing::warn!("Ignoring unparseable schedule window {}-{}", start, end);
                    true
                }
            },
            _ => true,
        }
    }
}

/// Resolve an IANA timezone name, falling back to UTC.
pub fn resolve_timezone(name: Option<&str>) -> Tz {
    match name {
        Some(name) => name.parse().unwrap_or_else(|_| {
            tracing::warn!("Unknown timezone '{}', using UTC", name);
            Tz::UTC
        }),
        None => Tz::UTC,
    }
}

/// Convert a UTC instant to local time in `tz`.
pub fn local_time(now: DateTime<Utc>, tz: Tz) -> DateTime<Tz> {
    now.with_timezone(&tz)
}

/// Truncate a date-time to its minute-resolution time of day.
pub fn time_of_day<T: chrono::TimeZone>(dt: &DateTime<T>) -> NaiveTime {
    NaiveTime::from_hms_opt(dt.hour(), dt.minute(), 0).unwrap_or_default()
}

/// Parse a time string (HH:MM) into NaiveTime.
pub fn parse_time(s: &str) -> Option<NaiveTime> {
    let (hour, minute) = s.trim().split_once(':')?;
    let hour: u32 = hour.parse().ok()?;
    let minute: u32 = minute.parse().ok()?;
    NaiveTime::from_hms_opt(hour, minute, 0)
}

/// Convert a day name to Weekday.
fn weekday_from_str(s: &str) -> Option<Weekday> {
    match s.to_lowercase().as_str() {
        "mon" | "monday" => Some(Weekday::Mon),
        "tue" | "tuesday" => Some(Weekday::Tue),
        "wed" | "wednesday" => Some(Weekday::Wed),
        "thu" | "thursday" => Some(Weekday::Thu),
        "fri" | "friday" => Some(Weekday::Fri),
        "sat" | "saturday" => Some(Weekday::Sat),
        "sun" | "sunday" => Some(Weekday::Sun),
        _ => None,
    }
}
