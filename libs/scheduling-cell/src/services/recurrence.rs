// libs/scheduling-cell/src/services/recurrence.rs
//
// Expands a recurrence rule into concrete occurrence times. All arithmetic is
// on the clinic's wall clock (naive date/time); callers convert to UTC.

use std::collections::BTreeSet;

use chrono::{Datelike, Days, Duration, Months, NaiveDate, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Frequency {
    Weekly,
    Biweekly,
    Monthly,
}

impl Frequency {
    fn cycle_days(&self) -> Option<u64> {
        match self {
            Frequency::Weekly => Some(7),
            Frequency::Biweekly => Some(14),
            Frequency::Monthly => None,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Termination {
    /// Stop after this many occurrences, counted from the anchor.
    Count(u32),
    /// Last date (inclusive) an occurrence may start on.
    Until(NaiveDate),
    /// Bounded only by the requested range.
    Indefinite,
}

/// What a monthly rule does in months too short for the anchor's day.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum MonthDayPolicy {
    /// No occurrence that month (a rule on the 31st skips April).
    #[default]
    Skip,
    /// Use the last day of the month instead.
    Clamp,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RecurrenceRule {
    pub frequency: Frequency,
    /// Days emitted in each weekly/biweekly cycle. Ignored for monthly rules.
    #[serde(default)]
    pub weekdays: Vec<Weekday>,
    pub start_time: NaiveTime,
    pub duration_minutes: u32,
    pub termination: Termination,
    #[serde(default)]
    pub month_day_policy: MonthDayPolicy,
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum RecurrenceError {
    #[error("a {0:?} rule needs at least one weekday")]
    NoWeekdays(Frequency),

    #[error("duration must be at least one minute")]
    ZeroDuration,

    #[error("occurrence count must be at least one")]
    ZeroCount,

    #[error("end date {until} is before the first date {anchor}")]
    EndsBeforeAnchor { anchor: NaiveDate, until: NaiveDate },
}

/// One generated occurrence, in wall-clock time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedSlot {
    pub date: NaiveDate,
    pub start: NaiveDateTime,
    pub end: NaiveDateTime,
}

impl RecurrenceRule {
    pub fn weekly(weekdays: Vec<Weekday>, start_time: NaiveTime, duration_minutes: u32, termination: Termination) -> Self {
        Self {
            frequency: Frequency::Weekly,
            weekdays,
            start_time,
            duration_minutes,
            termination,
            month_day_policy: MonthDayPolicy::default(),
        }
    }

    /// Rejects rules that could never produce a sensible series.
    pub fn validate(&self, anchor: NaiveDate) -> Result<(), RecurrenceError> {
        if self.frequency != Frequency::Monthly && self.weekdays.is_empty() {
            return Err(RecurrenceError::NoWeekdays(self.frequency));
        }
        if self.duration_minutes == 0 {
            return Err(RecurrenceError::ZeroDuration);
        }
        match self.termination {
            Termination::Count(0) => Err(RecurrenceError::ZeroCount),
            Termination::Until(until) if until < anchor => {
                Err(RecurrenceError::EndsBeforeAnchor { anchor, until })
            }
            _ => Ok(()),
        }
    }

    pub fn duration(&self) -> Duration {
        Duration::minutes(self.duration_minutes as i64)
    }

    /// Occurrences starting in `[range_start, range_end)`.
    ///
    /// Counting for `Termination::Count` always starts at the anchor, so the
    /// same rule yields the same dates whatever range is asked for.
    pub fn expand(&self, anchor: NaiveDate, range_start: NaiveDateTime, range_end: NaiveDateTime) -> RecurrenceIter<'_> {
        RecurrenceIter::new(self, anchor, range_start, range_end)
    }

    /// Like [`expand`](Self::expand) but leaves out exception dates. Exceptions
    /// still count towards a fixed occurrence count.
    pub fn expand_excluding<'a>(
        &'a self,
        anchor: NaiveDate,
        range_start: NaiveDateTime,
        range_end: NaiveDateTime,
        exceptions: &'a BTreeSet<NaiveDate>,
    ) -> impl Iterator<Item = GeneratedSlot> + 'a {
        self.expand(anchor, range_start, range_end)
            .filter(move |slot| !exceptions.contains(&slot.date))
    }
}

pub struct RecurrenceIter<'a> {
    rule: &'a RecurrenceRule,
    anchor: NaiveDate,
    /// Days after Monday, sorted and deduplicated.
    weekday_offsets: Vec<u64>,
    cycle: u64,
    position: usize,
    emitted: u32,
    range_start: NaiveDateTime,
    range_end: NaiveDateTime,
    finished: bool,
}

impl<'a> RecurrenceIter<'a> {
    fn new(rule: &'a RecurrenceRule, anchor: NaiveDate, range_start: NaiveDateTime, range_end: NaiveDateTime) -> Self {
        let mut weekday_offsets: Vec<u64> = rule.weekdays.iter()
            .map(|d| d.num_days_from_monday() as u64)
            .collect();
        weekday_offsets.sort_unstable();
        weekday_offsets.dedup();

        let finished = range_end <= range_start
            || (rule.frequency != Frequency::Monthly && weekday_offsets.is_empty());

        let mut iter = Self {
            rule,
            anchor,
            weekday_offsets,
            cycle: 0,
            position: 0,
            emitted: 0,
            range_start,
            range_end,
            finished,
        };
        iter.cycle = iter.first_useful_cycle();
        iter
    }

    /// Without a count to honour, cycles wholly before the range can be skipped.
    fn first_useful_cycle(&self) -> u64 {
        if matches!(self.rule.termination, Termination::Count(_)) {
            return 0;
        }
        let target = self.range_start.date();
        if target <= self.anchor {
            return 0;
        }

        match self.rule.frequency.cycle_days() {
            Some(step) => {
                let days = (target - self.week_zero()).num_days().max(0) as u64;
                (days / step).saturating_sub(1)
            }
            None => {
                let months = (target.year() - self.anchor.year()) * 12
                    + target.month() as i32 - self.anchor.month() as i32;
                (months.max(0) as u64).saturating_sub(1)
            }
        }
    }

    fn week_zero(&self) -> NaiveDate {
        self.anchor - Days::new(self.anchor.weekday().num_days_from_monday() as u64)
    }

    /// Next date the rule lands on, ignoring termination and range.
    fn next_candidate(&mut self) -> Option<NaiveDate> {
        match self.rule.frequency.cycle_days() {
            Some(step) => loop {
                if self.position >= self.weekday_offsets.len() {
                    self.position = 0;
                    self.cycle += 1;
                }
                let offset = self.weekday_offsets[self.position];
                self.position += 1;

                let date = self.week_zero()
                    .checked_add_days(Days::new(self.cycle * step + offset))?;
                if date >= self.anchor {
                    return Some(date);
                }
            },
            None => loop {
                let month_start = self.anchor.with_day(1)?
                    .checked_add_months(Months::new(u32::try_from(self.cycle).ok()?))?;
                self.cycle += 1;

                match month_start.with_day(self.anchor.day()) {
                    Some(date) => return Some(date),
                    None if self.rule.month_day_policy == MonthDayPolicy::Clamp => {
                        return Some(last_day_of_month(month_start));
                    }
                    None => continue,
                }
            },
        }
    }
}

impl Iterator for RecurrenceIter<'_> {
    type Item = GeneratedSlot;

    fn next(&mut self) -> Option<Self::Item> {
        while !self.finished {
            let Some(date) = self.next_candidate() else {
                self.finished = true;
                break;
            };

            let exhausted = match self.rule.termination {
                Termination::Count(limit) => self.emitted >= limit,
                Termination::Until(until) => date > until,
                Termination::Indefinite => false,
            };
            let start = date.and_time(self.rule.start_time);
            if exhausted || start >= self.range_end {
                self.finished = true;
                break;
            }

            self.emitted += 1;
            if start < self.range_start {
                continue;
            }

            return Some(GeneratedSlot {
                date,
                start,
                end: start + self.rule.duration(),
            });
        }
        None
    }
}

fn last_day_of_month(month_start: NaiveDate) -> NaiveDate {
    month_start
        .checked_add_months(Months::new(1))
        .and_then(|next| next.pred_opt())
        .unwrap_or(month_start)
}
