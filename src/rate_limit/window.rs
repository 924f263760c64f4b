//! Business-hour send windows.
//!
//! A [`SendSchedule`] is seven weekday windows (Monday first) interpreted in
//! one IANA timezone. Windows are half-open `[start, end)`; an end of 23:59
//! or later runs to midnight.

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveTime, TimeZone, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

const WEEKDAY_NAMES: [&str; 7] = [
    "monday",
    "tuesday",
    "wednesday",
    "thursday",
    "friday",
    "saturday",
    "sunday",
];

fn end_of_day() -> NaiveTime {
    NaiveTime::from_hms_opt(23, 59, 0).unwrap_or(NaiveTime::MIN)
}

/// Send window for one weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DayWindow {
    pub enabled: bool,
    #[serde(with = "hhmm")]
    pub start_time: NaiveTime,
    #[serde(with = "hhmm")]
    pub end_time: NaiveTime,
}

impl DayWindow {
    pub fn open(start: NaiveTime, end: NaiveTime) -> Self {
        Self {
            enabled: true,
            start_time: start,
            end_time: end,
        }
    }

    pub fn closed() -> Self {
        Self {
            enabled: false,
            start_time: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN),
            end_time: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN),
        }
    }

    pub fn contains(&self, time: NaiveTime) -> bool {
        self.enabled
            && time >= self.start_time
            && (time < self.end_time || self.end_time >= end_of_day())
    }
}

/// Weekly send windows in a sender's timezone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendSchedule {
    pub timezone: Tz,
    /// Monday first.
    pub days: [DayWindow; 7],
}

impl Default for SendSchedule {
    fn default() -> Self {
        let nine = NaiveTime::from_hms_opt(9, 0, 0).unwrap_or(NaiveTime::MIN);
        let five = NaiveTime::from_hms_opt(17, 0, 0).unwrap_or(NaiveTime::MIN);
        Self::weekdays(Tz::UTC, nine, five)
    }
}

impl SendSchedule {
    /// Monday to Friday between `start` and `end`, weekends closed.
    pub fn weekdays(timezone: Tz, start: NaiveTime, end: NaiveTime) -> Self {
        let mut days = [DayWindow::open(start, end); 7];
        days[5] = DayWindow::closed();
        days[6] = DayWindow::closed();
        Self { timezone, days }
    }

    /// Every day, all day.
    pub fn always(timezone: Tz) -> Self {
        Self {
            timezone,
            days: [DayWindow::open(NaiveTime::MIN, end_of_day()); 7],
        }
    }

    pub fn validate(&self) -> Result<(), ValidationError> {
        if !self.days.iter().any(|d| d.enabled) {
            return Err(ValidationError::NoSendDays);
        }
        for (idx, day) in self.days.iter().enumerate() {
            if day.enabled && day.start_time >= day.end_time {
                return Err(ValidationError::InvalidWindow {
                    day: WEEKDAY_NAMES[idx].to_string(),
                    reason: format!(
                        "start {} must be before end {}",
                        day.start_time.format("%H:%M"),
                        day.end_time.format("%H:%M")
                    ),
                });
            }
        }
        Ok(())
    }

    fn window_for(&self, date: NaiveDate) -> &DayWindow {
        &self.days[date.weekday().num_days_from_monday() as usize]
    }

    /// Whether `at` falls inside an enabled window.
    pub fn is_open(&self, at: DateTime<Utc>) -> bool {
        let local = at.with_timezone(&self.timezone);
        self.window_for(local.date_naive()).contains(local.time())
    }

    /// Earliest instant at or after `from` that is inside a window.
    ///
    /// Returns `None` only when no weekday is enabled.
    pub fn next_open(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if self.is_open(from) {
            return Some(from);
        }
        let local = from.with_timezone(&self.timezone);
        let today = local.date_naive();

        for offset in 0..=7u64 {
            let date = today.checked_add_days(Days::new(offset))?;
            let window = self.window_for(date);
            if !window.enabled {
                continue;
            }
            if offset == 0 && local.time() >= window.start_time {
                // Already past today's window.
                continue;
            }
            if let Some(start) = self.localize(date, window.start_time) {
                return Some(start);
            }
        }
        None
    }

    /// Resolve a local wall-clock time, skipping forward over DST gaps.
    fn localize(&self, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
        let naive = date.and_time(time);
        self.timezone
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                self.timezone
                    .from_local_datetime(&(naive + chrono::Duration::hours(1)))
                    .earliest()
            })
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// `"HH:MM"` (or `"HH:MM:SS"`) serde for window bounds.
mod hhmm {
    use chrono::NaiveTime;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(time: &NaiveTime, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&time.format("%H:%M").to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<NaiveTime, D::Error> {
        let raw = String::deserialize(deserializer)?;
        NaiveTime::parse_from_str(&raw, "%H:%M")
            .or_else(|_| NaiveTime::parse_from_str(&raw, "%H:%M:%S"))
            .map_err(|e| serde::de::Error::custom(format!("invalid time '{raw}': {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn utc(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    fn hm(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn default_is_weekday_business_hours() {
        let schedule = SendSchedule::default();
        // 2026-10-19 is a Monday.
        assert!(schedule.is_open(utc("2026-10-19T09:00:00Z")));
        assert!(schedule.is_open(utc("2026-10-19T16:59:00Z")));
        assert!(!schedule.is_open(utc("2026-10-19T17:00:00Z")));
        assert!(!schedule.is_open(utc("2026-10-19T08:59:59Z")));
        assert!(!schedule.is_open(utc("2026-10-24T12:00:00Z"))); // Saturday
    }

    #[test]
    fn next_open_inside_window_is_identity() {
        let schedule = SendSchedule::default();
        let at = utc("2026-10-20T10:30:00Z");
        assert_eq!(schedule.next_open(at), Some(at));
    }

    #[test]
    fn next_open_before_start_rolls_to_same_day() {
        let schedule = SendSchedule::default();
        assert_eq!(
            schedule.next_open(utc("2026-10-20T06:00:00Z")),
            Some(utc("2026-10-20T09:00:00Z"))
        );
    }

    #[test]
    fn next_open_friday_evening_rolls_to_monday() {
        let schedule = SendSchedule::default();
        assert_eq!(
            schedule.next_open(utc("2026-10-23T18:00:00Z")),
            Some(utc("2026-10-26T09:00:00Z"))
        );
    }

    #[test]
    fn windows_follow_sender_timezone() {
        let schedule = SendSchedule::weekdays(chrono_tz::America::New_York, hm(9, 0), hm(17, 0));
        // 09:00 EDT is 13:00 UTC.
        assert!(!schedule.is_open(utc("2026-10-20T12:59:00Z")));
        assert!(schedule.is_open(utc("2026-10-20T13:00:00Z")));
        assert_eq!(
            schedule.next_open(utc("2026-10-20T02:00:00Z")),
            Some(utc("2026-10-20T13:00:00Z"))
        );
    }

    #[test]
    fn single_enabled_day_wraps_a_week() {
        let mut schedule = SendSchedule::weekdays(Tz::UTC, hm(9, 0), hm(10, 0));
        for day in schedule.days.iter_mut().skip(1) {
            day.enabled = false;
        }
        // Monday 10:30, just past the only window.
        assert_eq!(
            schedule.next_open(utc("2026-10-19T10:30:00Z")),
            Some(utc("2026-10-26T09:00:00Z"))
        );
    }

    #[test]
    fn always_runs_to_midnight() {
        let schedule = SendSchedule::always(Tz::UTC);
        assert!(schedule.is_open(utc("2026-10-24T23:59:30Z")));
        assert!(schedule.is_open(utc("2026-10-25T00:00:00Z")));
    }

    #[test]
    fn no_enabled_days_has_no_next_open() {
        let mut schedule = SendSchedule::default();
        for day in schedule.days.iter_mut() {
            day.enabled = false;
        }
        assert!(schedule.next_open(utc("2026-10-19T10:00:00Z")).is_none());
        assert_eq!(schedule.validate(), Err(ValidationError::NoSendDays));
    }

    #[test]
    fn validate_rejects_inverted_window() {
        let mut schedule = SendSchedule::default();
        schedule.days[2] = DayWindow::open(hm(17, 0), hm(9, 0));
        let err = schedule.validate().unwrap_err();
        assert!(matches!(err, ValidationError::InvalidWindow { ref day, .. } if day == "wednesday"));
    }

    #[test]
    fn serde_uses_hh_mm() {
        let schedule = SendSchedule::weekdays(chrono_tz::Europe::Berlin, hm(8, 30), hm(18, 0));
        let json = serde_json::to_value(&schedule).unwrap();
        assert_eq!(json["timezone"], "Europe/Berlin");
        assert_eq!(json["days"][0]["startTime"], "08:30");
        assert_eq!(json["days"][6]["enabled"], false);

        let back: SendSchedule = serde_json::from_value(json).unwrap();
        assert_eq!(back, schedule);
    }
}
