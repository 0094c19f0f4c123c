//! Time policy — pure functions, no I/O.
//!
//! All scheduler arithmetic is whole-second on naive local time; the process
//! runs in one timezone configured at the OS level. The wall clock itself is
//! behind the [`Clock`] trait so tests can pin it.

use chrono::{Duration, NaiveDate, NaiveDateTime, Timelike};
use serde::{Deserialize, Serialize};

use postpilot_core::{Result, SchedulerError};

/// Hour-of-day range during which a task may be dispatched, half-open:
/// `start <= hour < end`, with `0 <= start < end <= 24`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HourWindow {
    pub start: u32,
    pub end: u32,
}

impl HourWindow {
    pub fn new(start: u32, end: u32) -> Result<Self> {
        if start >= end || end > 24 {
            return Err(SchedulerError::Invalid(format!(
                "hour window must satisfy 0 <= start < end <= 24, got [{start}, {end})"
            )));
        }
        Ok(Self { start, end })
    }
}

/// True iff `t` falls inside the window. No window means no restriction.
pub fn in_window(t: NaiveDateTime, range: Option<HourWindow>) -> bool {
    match range {
        None => true,
        Some(w) => w.start <= t.hour() && t.hour() < w.end,
    }
}

/// Earliest in-window instant `>= t`. `t` itself when already in-window;
/// same-day window start when the day's window has not opened yet; next-day
/// window start once it has closed.
pub fn advance_to_next_valid(t: NaiveDateTime, range: Option<HourWindow>) -> NaiveDateTime {
    let Some(w) = range else { return t };
    if in_window(t, range) {
        return t;
    }
    let start_of = |d: NaiveDate| d.and_hms_opt(w.start, 0, 0).expect("window start < 24");
    if t.hour() < w.start {
        start_of(t.date())
    } else {
        start_of(t.date() + Duration::days(1))
    }
}

/// Next time the task should run, or `None` when nothing schedulable remains
/// before `end_date`.
///
/// First dispatch (`last_execution` = None) is anchored at `now`; every later
/// one at `last_execution + interval`. The candidate is then pulled forward
/// into the validity window, and both the raw and the adjusted instant must
/// fall on a calendar day strictly before `end_date`.
pub fn next_execution(
    now: NaiveDateTime,
    last_execution: Option<NaiveDateTime>,
    interval_secs: u32,
    range: Option<HourWindow>,
    end_date: NaiveDate,
) -> Option<NaiveDateTime> {
    let candidate = match last_execution {
        None => now,
        Some(last) => last + Duration::seconds(i64::from(interval_secs)),
    };
    if candidate.date() >= end_date {
        return None;
    }
    let adjusted = advance_to_next_valid(candidate, range);
    if adjusted.date() >= end_date {
        return None;
    }
    Some(adjusted)
}

/// Wall-clock source, swappable for tests.
pub trait Clock: Send + Sync {
    /// Current instant in the process-local timezone.
    fn now(&self) -> NaiveDateTime;

    fn today(&self) -> NaiveDate {
        self.now().date()
    }
}

/// Production clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        chrono::Local::now().naive_local()
    }
}

/// Test clock pinned to a settable instant.
#[derive(Debug, Default)]
pub struct FixedClock {
    now: std::sync::Mutex<NaiveDateTime>,
}

impl FixedClock {
    pub fn at(now: NaiveDateTime) -> Self {
        Self {
            now: std::sync::Mutex::new(now),
        }
    }

    pub fn set(&self, now: NaiveDateTime) {
        *self.now.lock().unwrap() = now;
    }

    pub fn advance_secs(&self, secs: i64) {
        let mut t = self.now.lock().unwrap();
        *t += Duration::seconds(secs);
    }
}

impl Clock for FixedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn dt(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d)
            .unwrap()
            .and_hms_opt(h, min, s)
            .unwrap()
    }

    fn window(start: u32, end: u32) -> Option<HourWindow> {
        Some(HourWindow::new(start, end).unwrap())
    }

    #[test]
    fn window_is_half_open() {
        let w = window(8, 22);
        assert!(!in_window(dt(2026, 3, 1, 7, 59, 59), w));
        assert!(in_window(dt(2026, 3, 1, 8, 0, 0), w));
        assert!(in_window(dt(2026, 3, 1, 21, 59, 59), w));
        assert!(!in_window(dt(2026, 3, 1, 22, 0, 0), w));
        assert!(in_window(dt(2026, 3, 1, 3, 0, 0), None));
    }

    #[test]
    fn window_validation() {
        assert!(HourWindow::new(0, 24).is_ok());
        assert!(HourWindow::new(8, 8).is_err());
        assert!(HourWindow::new(9, 8).is_err());
        assert!(HourWindow::new(8, 25).is_err());
    }

    #[test]
    fn advance_keeps_in_window_instant() {
        let t = dt(2026, 3, 1, 12, 30, 0);
        assert_eq!(advance_to_next_valid(t, window(8, 22)), t);
        assert_eq!(advance_to_next_valid(t, None), t);
    }

    #[test]
    fn advance_before_open_snaps_to_same_day() {
        let t = dt(2026, 3, 1, 7, 30, 0);
        assert_eq!(
            advance_to_next_valid(t, window(8, 22)),
            dt(2026, 3, 1, 8, 0, 0)
        );
    }

    #[test]
    fn advance_after_close_wraps_to_next_day() {
        let t = dt(2026, 3, 1, 22, 45, 30);
        assert_eq!(
            advance_to_next_valid(t, window(8, 22)),
            dt(2026, 3, 2, 8, 0, 0)
        );
    }

    #[test]
    fn first_dispatch_defers_to_window_open() {
        // created at 07:30 with window [8, 22): first run at 08:00 today
        let now = dt(2026, 3, 1, 7, 30, 0);
        let end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let next = next_execution(now, None, 3600, window(8, 22), end).unwrap();
        assert_eq!(next, dt(2026, 3, 1, 8, 0, 0));
    }

    #[test]
    fn overnight_wrap_when_interval_lands_past_close() {
        // run finished at 21:45:30, interval 1h -> 22:45:30 is out of window
        let now = dt(2026, 3, 1, 21, 45, 30);
        let end = NaiveDate::from_ymd_opt(2026, 3, 31).unwrap();
        let next = next_execution(now, Some(now), 3600, window(8, 22), end).unwrap();
        assert_eq!(next, dt(2026, 3, 2, 8, 0, 0));
    }

    #[test]
    fn end_date_cuts_off_raw_candidate() {
        let last = dt(2026, 3, 1, 23, 30, 0);
        let end = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(next_execution(last, Some(last), 3600, None, end), None);
    }

    #[test]
    fn end_date_cuts_off_adjusted_candidate() {
        // candidate is in-range today but the window pushes it onto end_date
        let last = dt(2026, 3, 1, 22, 30, 0);
        let end = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        assert_eq!(
            next_execution(last, Some(last), 3600, window(8, 22), end),
            None
        );
    }

    #[test]
    fn next_always_beyond_last() {
        let last = dt(2026, 3, 1, 10, 0, 0);
        let end = NaiveDate::from_ymd_opt(2026, 4, 1).unwrap();
        for interval in [900u32, 3600, 10800] {
            let next = next_execution(last, Some(last), interval, window(8, 22), end).unwrap();
            assert!(next > last);
        }
    }
}
