//! Composite score formula and weekly window math.
//!
//! The score is a frozen business rule: spins carry the signal, reach adds
//! a 25% bonus per reporting station. It is computed twice on purpose:
//! once per row at ingest time (stored for audit) and again from the
//! aggregated spins/reach at ranking time, so a formula change replays
//! over history without re-ingesting the archive.

use chrono::{Datelike, NaiveDate, Weekday};

/// Bonus applied per station of reach.
pub const REACH_WEIGHT: f64 = 0.25;

/// Composite weekly score: `spins x (1 + reach x REACH_WEIGHT)`.
pub fn composite_score(spins: i64, reach: i64) -> f64 {
    spins as f64 * (1.0 + reach as f64 * REACH_WEIGHT)
}

/// Inclusive date bounds of one weekly ranking window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WeekWindow {
    pub year: i32,
    pub week: u32,
}

impl WeekWindow {
    /// Monday of the ISO week, used as the window key.
    pub fn start(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Mon)
    }

    /// Sunday of the ISO week.
    pub fn end(&self) -> Option<NaiveDate> {
        NaiveDate::from_isoywd_opt(self.year, self.week, Weekday::Sun)
    }

    /// Recover the window from a stored `window_start` date.
    pub fn from_start(start: NaiveDate) -> Self {
        let iso = start.iso_week();
        Self {
            year: iso.year(),
            week: iso.week(),
        }
    }
}
