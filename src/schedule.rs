//! Work-hours timestamp generation.
//!
//! Given a commit count and a calendar window, [`generate`] draws that many
//! timestamps on working days inside the working day, nudges each one by a
//! bounded jitter, and hands them back oldest first.

use chrono::{Datelike, Duration, NaiveDate, NaiveDateTime, NaiveTime, Timelike, Weekday};
use thiserror::Error;

/// A local wall-clock instant. No zone is attached here; it is resolved
/// against the local zone only when a commit is written.
pub type Timestamp = NaiveDateTime;

/// A source of uniform integer draws.
///
/// Every [`rand::Rng`] qualifies, so callers normally pass
/// `rand::thread_rng()`. Tests can plug in a seeded or scripted source.
pub trait RandomSource {
    /// Draw an integer uniformly from `low..=high`.
    fn uniform(&mut self, low: i64, high: i64) -> i64;
}

impl<R: rand::Rng + ?Sized> RandomSource for R {
    fn uniform(&mut self, low: i64, high: i64) -> i64 {
        self.gen_range(low..=high)
    }
}

/// Inclusive range of calendar dates commits may land on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateWindow {
    start: NaiveDate,
    end: NaiveDate,
}

impl DateWindow {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, Error> {
        if start > end {
            return Err(Error::InvalidConfig(format!(
                "start date {start} is after end date {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveDate {
        self.start
    }

    pub fn end(&self) -> NaiveDate {
        self.end
    }

    /// Every date in the window, oldest first, optionally without weekends.
    pub fn workdays(&self, skip_weekends: bool) -> Vec<NaiveDate> {
        self.start
            .iter_days()
            .take_while(|day| *day <= self.end)
            .filter(|day| !skip_weekends || !is_weekend(*day))
            .collect()
    }
}

/// The working day, `start` inclusive through `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkHours {
    start: NaiveTime,
    end: NaiveTime,
}

impl WorkHours {
    pub fn new(start: NaiveTime, end: NaiveTime) -> Result<Self, Error> {
        if start >= end {
            return Err(Error::InvalidConfig(format!(
                "work day must start before it ends (got {} to {})",
                start.format("%H:%M"),
                end.format("%H:%M")
            )));
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> NaiveTime {
        self.start
    }

    pub fn end(&self) -> NaiveTime {
        self.end
    }

    /// Whether `time` falls inside the working day, both ends included.
    pub fn contains(&self, time: NaiveTime) -> bool {
        self.start <= time && time <= self.end
    }
}

/// Everything [`generate`] needs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScheduleRequest {
    pub count: usize,
    pub window: DateWindow,
    pub hours: WorkHours,
    /// Maximum perturbation in minutes, applied in both directions.
    pub jitter: u32,
    pub skip_weekends: bool,
}

/// Produce `request.count` timestamps, sorted ascending.
///
/// Each timestamp is drawn independently: a date picked with replacement
/// from the usable days, a base time in `[hours.start, hours.end)`, then a
/// jitter of up to `request.jitter` minutes either way. The jittered time
/// is clamped back into the working day so it never leaves it and never
/// spills onto a neighbouring date. Duplicate dates and equal timestamps
/// are allowed.
pub fn generate(
    request: &ScheduleRequest,
    rng: &mut impl RandomSource,
) -> Result<Vec<Timestamp>, Error> {
    if request.count == 0 {
        return Ok(Vec::new());
    }

    let days = request.window.workdays(request.skip_weekends);
    if days.is_empty() {
        return Err(Error::EmptySchedule {
            start: request.window.start,
            end: request.window.end,
        });
    }

    let last_day = days.len() as i64 - 1;
    let open = i64::from(request.hours.start.num_seconds_from_midnight());
    let close = i64::from(request.hours.end.num_seconds_from_midnight());
    let jitter = i64::from(request.jitter);

    let mut stamps: Vec<Timestamp> = (0..request.count)
        .map(|_| {
            let day = days[rng.uniform(0, last_day).clamp(0, last_day) as usize];
            let base = rng.uniform(open, close - 1);
            let shift = if jitter == 0 {
                0
            } else {
                rng.uniform(-jitter, jitter) * 60
            };
            let seconds = (base + shift).clamp(open, close);
            day.and_time(NaiveTime::MIN + Duration::seconds(seconds))
        })
        .collect();

    stamps.sort();
    Ok(stamps)
}

/// Parse a `YYYY-MM-DD` calendar date.
pub fn parse_date(input: &str) -> Result<NaiveDate, Error> {
    NaiveDate::parse_from_str(input.trim(), "%Y-%m-%d").map_err(|e| {
        Error::InvalidConfig(format!("invalid date '{input}' (expected YYYY-MM-DD): {e}"))
    })
}

/// Parse an `HH:MM` (or `HH:MM:SS`) time of day.
pub fn parse_time(input: &str) -> Result<NaiveTime, Error> {
    let trimmed = input.trim();
    NaiveTime::parse_from_str(trimmed, "%H:%M")
        .or_else(|_| NaiveTime::parse_from_str(trimmed, "%H:%M:%S"))
        .map_err(|e| Error::InvalidConfig(format!("invalid time '{input}' (expected HH:MM): {e}")))
}

fn is_weekend(day: NaiveDate) -> bool {
    matches!(day.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Errors from building or running a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("no usable working days between {start} and {end}")]
    EmptySchedule { start: NaiveDate, end: NaiveDate },
}
