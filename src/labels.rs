//! Time labels and visit-duration histograms.
//!
//! Every sample is tagged with two labels: a day class (weekday/weekend)
//! and one of six 4-hour time-of-day buckets. Histograms accumulate visit
//! seconds under both labels, so their keys are drawn from the closed set
//! [`TimeLabel::ALL`].

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Datelike, FixedOffset, Offset, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

/// Weekday or weekend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DayClass {
    Weekday,
    Weekend,
}

/// Time-of-day bucket, 4 hours each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeOfDay {
    /// 00:00 - 04:00
    Night,
    /// 04:00 - 08:00
    EarlyMorning,
    /// 08:00 - 12:00
    Morning,
    /// 12:00 - 16:00
    Afternoon,
    /// 16:00 - 20:00
    Evening,
    /// 20:00 - 24:00
    LateEvening,
}

impl TimeOfDay {
    /// Bucket for an hour of the day (0-23).
    pub fn from_hour(hour: u32) -> Self {
        match hour {
            0..=3 => TimeOfDay::Night,
            4..=7 => TimeOfDay::EarlyMorning,
            8..=11 => TimeOfDay::Morning,
            12..=15 => TimeOfDay::Afternoon,
            16..=19 => TimeOfDay::Evening,
            _ => TimeOfDay::LateEvening,
        }
    }
}

/// Histogram key: either a day class or a time-of-day bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeLabel {
    Weekday,
    Weekend,
    Night,
    EarlyMorning,
    Morning,
    Afternoon,
    Evening,
    LateEvening,
}

impl TimeLabel {
    /// Every label, in persisted column order.
    pub const ALL: [TimeLabel; 8] = [
        TimeLabel::Weekday,
        TimeLabel::Weekend,
        TimeLabel::Night,
        TimeLabel::EarlyMorning,
        TimeLabel::Morning,
        TimeLabel::Afternoon,
        TimeLabel::Evening,
        TimeLabel::LateEvening,
    ];

    /// Column name used when persisting histograms.
    pub fn column_name(self) -> &'static str {
        match self {
            TimeLabel::Weekday => "weekday",
            TimeLabel::Weekend => "weekend",
            TimeLabel::Night => "night",
            TimeLabel::EarlyMorning => "early_morning",
            TimeLabel::Morning => "morning",
            TimeLabel::Afternoon => "afternoon",
            TimeLabel::Evening => "evening",
            TimeLabel::LateEvening => "late_evening",
        }
    }
}

impl fmt::Display for TimeLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.column_name())
    }
}

impl From<DayClass> for TimeLabel {
    fn from(day: DayClass) -> Self {
        match day {
            DayClass::Weekday => TimeLabel::Weekday,
            DayClass::Weekend => TimeLabel::Weekend,
        }
    }
}

impl From<TimeOfDay> for TimeLabel {
    fn from(time: TimeOfDay) -> Self {
        match time {
            TimeOfDay::Night => TimeLabel::Night,
            TimeOfDay::EarlyMorning => TimeLabel::EarlyMorning,
            TimeOfDay::Morning => TimeLabel::Morning,
            TimeOfDay::Afternoon => TimeLabel::Afternoon,
            TimeOfDay::Evening => TimeLabel::Evening,
            TimeOfDay::LateEvening => TimeLabel::LateEvening,
        }
    }
}

/// The label pair attached to one timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeLabels {
    pub day: DayClass,
    pub time: TimeOfDay,
}

impl TimeLabels {
    pub fn new(day: DayClass, time: TimeOfDay) -> Self {
        Self { day, time }
    }
}

/// Maps a timestamp to its label pair.
///
/// The engine only needs the pair; where the day boundary falls (time zone,
/// locale) is up to the implementation.
pub trait TimeLabeler: Send + Sync {
    fn labels(&self, timestamp: i64) -> TimeLabels;
}

/// Labels timestamps in a fixed offset from UTC.
#[derive(Debug, Clone, Copy)]
pub struct UtcOffsetLabeler {
    offset: FixedOffset,
}

impl UtcOffsetLabeler {
    /// Labeler for the given offset in seconds east of UTC.
    ///
    /// Returns `None` if the offset is not within +/- 24 hours.
    pub fn new(offset_secs: i32) -> Option<Self> {
        FixedOffset::east_opt(offset_secs).map(|offset| Self { offset })
    }

    pub fn utc() -> Self {
        Self {
            offset: Utc.fix(),
        }
    }
}

impl Default for UtcOffsetLabeler {
    fn default() -> Self {
        Self::utc()
    }
}

impl TimeLabeler for UtcOffsetLabeler {
    fn labels(&self, timestamp: i64) -> TimeLabels {
        let utc = DateTime::from_timestamp(timestamp, 0).unwrap_or_else(|| {
            log::debug!("[PlaceEngine] Timestamp {} out of range, labelling as epoch", timestamp);
            DateTime::<Utc>::default()
        });
        let local = utc.with_timezone(&self.offset);

        let day = match local.weekday() {
            Weekday::Sat | Weekday::Sun => DayClass::Weekend,
            _ => DayClass::Weekday,
        };

        TimeLabels::new(day, TimeOfDay::from_hour(local.hour()))
    }
}

/// `seconds * 95 / 100`, truncated, without overflowing on large inputs.
pub(crate) fn decayed(seconds: u64) -> u64 {
    seconds / 100 * 95 + seconds % 100 * 95 / 100
}

/// Accumulated visit seconds per time label.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Histogram {
    bins: BTreeMap<TimeLabel, u64>,
}

impl Histogram {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `seconds` under a single label, saturating at `u64::MAX`.
    pub fn add(&mut self, label: TimeLabel, seconds: u64) {
        let bin = self.bins.entry(label).or_insert(0);
        *bin = bin.saturating_add(seconds);
    }

    /// Add `seconds` under both labels of the pair.
    pub fn add_labels(&mut self, labels: TimeLabels, seconds: u64) {
        self.add(labels.day.into(), seconds);
        self.add(labels.time.into(), seconds);
    }

    /// Sum `other` into this histogram, creating missing keys.
    pub fn merge(&mut self, other: &Histogram) {
        for (&label, &seconds) in &other.bins {
            self.add(label, seconds);
        }
    }

    /// Scale every bin by 95/100 with integer truncation.
    pub fn decay(&mut self) {
        for seconds in self.bins.values_mut() {
            *seconds = decayed(*seconds);
        }
    }

    /// Seconds recorded under a label (0 when absent).
    pub fn get(&self, label: TimeLabel) -> u64 {
        self.bins.get(&label).copied().unwrap_or(0)
    }

    /// Total visit time. Every sample lands in exactly one day bin, so
    /// this is the sum of the weekday and weekend bins.
    pub fn total(&self) -> u64 {
        self.get(TimeLabel::Weekday) + self.get(TimeLabel::Weekend)
    }

    pub fn contains(&self, label: TimeLabel) -> bool {
        self.bins.contains_key(&label)
    }

    pub fn iter(&self) -> impl Iterator<Item = (TimeLabel, u64)> + '_ {
        self.bins.iter().map(|(&label, &seconds)| (label, seconds))
    }

    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }

    pub fn len(&self) -> usize {
        self.bins.len()
    }

    pub fn clear(&mut self) {
        self.bins.clear();
    }
}

impl FromIterator<(TimeLabel, u64)> for Histogram {
    fn from_iter<I: IntoIterator<Item = (TimeLabel, u64)>>(iter: I) -> Self {
        let mut histogram = Histogram::new();
        for (label, seconds) in iter {
            histogram.add(label, seconds);
        }
        histogram
    }
}
