//! Job triggers.
//!
//! A trigger answers one question: given the last fire time, when is the next
//! one? Interval triggers work purely on the monotonic clock. Cron triggers are
//! defined on local wall-clock time and are mapped onto the monotonic clock at
//! the moment of the query.

pub mod cron;

use std::time::Duration;

use chrono::{Local, NaiveDateTime, TimeDelta};
use tokio::time::Instant;

pub use cron::{CronError, CronSpec, CronTrigger};

/// Fires every `interval`, starting at `start`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IntervalTrigger {
    interval: Duration,
    start: Instant,
}

impl IntervalTrigger {
    /// A zero interval is bumped to one millisecond so the trigger always
    /// advances.
    pub fn new(interval: Duration, start: Instant) -> Self {
        Self {
            interval: interval.max(Duration::from_millis(1)),
            start,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    pub fn start(&self) -> Instant {
        self.start
    }

    /// Earliest fire time strictly after `after`.
    pub fn next_fire_time(&self, after: Instant) -> Instant {
        if after < self.start {
            return self.start;
        }
        self.fire_time(self.periods_until(after) + 1)
            .unwrap_or_else(|| after + self.interval)
    }

    /// Latest fire time at or before `now`, if `now` is past the start.
    pub fn last_fire_time(&self, now: Instant) -> Option<Instant> {
        if now < self.start {
            return None;
        }
        Some(self.fire_time(self.periods_until(now)).unwrap_or(now))
    }

    /// Whole intervals between the start and `at`.
    fn periods_until(&self, at: Instant) -> u128 {
        at.saturating_duration_since(self.start).as_nanos() / self.interval.as_nanos()
    }

    /// The `periods`-th fire time, or `None` if it is beyond what an
    /// `Instant` can represent.
    fn fire_time(&self, periods: u128) -> Option<Instant> {
        let nanos = periods.checked_mul(self.interval.as_nanos())?;
        let offset = Duration::from_nanos(u64::try_from(nanos).ok()?);
        self.start.checked_add(offset)
    }
}

/// What causes a job to run.
#[derive(Debug, Clone)]
pub enum Trigger {
    Interval(IntervalTrigger),
    Cron(CronTrigger),
}

impl Trigger {
    /// First time the job should run, judged at `now`.
    ///
    /// For interval triggers this is always the start, even one a few
    /// milliseconds in the past.
    pub fn first_fire_time(&self, now: Instant) -> Option<Instant> {
        match self {
            // A start already behind `now` is due at once; misfire grace
            // decides whether it still runs.
            Trigger::Interval(interval) => Some(interval.start()),
            Trigger::Cron(_) => self.next_fire_time(now),
        }
    }

    /// Next time the job should run after `after`. `None` once the trigger
    /// is exhausted.
    pub fn next_fire_time(&self, after: Instant) -> Option<Instant> {
        match self {
            Trigger::Interval(interval) => Some(interval.next_fire_time(after)),
            Trigger::Cron(cron) => {
                let next = cron.next_fire_time(wall_clock_at(after))?;
                Some(instant_at(next))
            }
        }
    }

    /// Latest fire time in `[from, now]`, and how many fire times that range
    /// holds.
    ///
    /// Used to collapse a backlog of missed runs into one.
    pub fn backlog(&self, from: Instant, now: Instant) -> Option<(Instant, usize)> {
        if from > now {
            return None;
        }
        match self {
            Trigger::Interval(interval) => {
                let last = interval.last_fire_time(now)?;
                let count = last.saturating_duration_since(from).as_nanos()
                    / interval.interval().as_nanos()
                    + 1;
                Some((last, usize::try_from(count).unwrap_or(usize::MAX)))
            }
            Trigger::Cron(_) => {
                let mut last = from;
                let mut count = 1;
                while let Some(next) = self.next_fire_time(last) {
                    if next > now {
                        break;
                    }
                    last = next;
                    count += 1;
                }
                Some((last, count))
            }
        }
    }
}

/// Local wall-clock time corresponding to a monotonic instant.
fn wall_clock_at(instant: Instant) -> NaiveDateTime {
    let now = Instant::now();
    let wall_now = Local::now().naive_local();
    let shifted = if instant >= now {
        wall_now.checked_add_signed(delta(instant.duration_since(now)))
    } else {
        wall_now.checked_sub_signed(delta(now.duration_since(instant)))
    };
    shifted.unwrap_or(wall_now)
}

/// Monotonic instant corresponding to a local wall-clock time.
fn instant_at(wall: NaiveDateTime) -> Instant {
    let now = Instant::now();
    let wall_now = Local::now().naive_local();
    match (wall - wall_now).to_std() {
        Ok(ahead) => now + ahead,
        // Already past; due immediately
        Err(_) => now,
    }
}

fn delta(duration: Duration) -> TimeDelta {
    TimeDelta::from_std(duration).unwrap_or(TimeDelta::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interval_next_fire_time() {
        let start = Instant::now();
        let trigger = IntervalTrigger::new(Duration::from_secs(5), start);

        assert_eq!(trigger.next_fire_time(start - Duration::from_secs(1)), start);
        assert_eq!(trigger.next_fire_time(start), start + Duration::from_secs(5));
        assert_eq!(
            trigger.next_fire_time(start + Duration::from_millis(7_500)),
            start + Duration::from_secs(10)
        );
    }

    #[test]
    fn test_interval_last_fire_time() {
        let start = Instant::now();
        let trigger = IntervalTrigger::new(Duration::from_secs(5), start);

        assert_eq!(trigger.last_fire_time(start - Duration::from_secs(1)), None);
        assert_eq!(trigger.last_fire_time(start), Some(start));
        assert_eq!(
            trigger.last_fire_time(start + Duration::from_secs(14)),
            Some(start + Duration::from_secs(10))
        );
    }

    #[test]
    fn test_interval_backlog_counts_missed_ticks() {
        let start = Instant::now();
        let trigger = Trigger::Interval(IntervalTrigger::new(Duration::from_secs(5), start));

        // Paused at +5s, resumed at +21s: ticks at 5, 10, 15, 20
        let (last, count) = trigger
            .backlog(start + Duration::from_secs(5), start + Duration::from_secs(21))
            .unwrap();
        assert_eq!(last, start + Duration::from_secs(20));
        assert_eq!(count, 4);
    }

    #[test]
    fn test_first_fire_time_honors_future_start() {
        let now = Instant::now();
        let start = now + Duration::from_millis(400);
        let trigger = Trigger::Interval(IntervalTrigger::new(Duration::from_secs(5), start));

        assert_eq!(trigger.first_fire_time(now), Some(start));
    }

    #[test]
    fn test_first_fire_time_keeps_a_start_just_passed() {
        let start = Instant::now();
        let trigger = Trigger::Interval(IntervalTrigger::new(Duration::from_secs(5), start));

        let now = start + Duration::from_millis(3);
        assert_eq!(trigger.first_fire_time(now), Some(start));
    }

    #[test]
    fn test_interval_fire_times_past_u32_periods() {
        // A 1ms interval passes u32::MAX periods after about 50 days
        let start = Instant::now();
        let trigger = IntervalTrigger::new(Duration::from_millis(1), start);
        let sixty_days = Duration::from_secs(60 * 24 * 3600);
        let now = start + sixty_days + Duration::from_micros(500);

        assert_eq!(trigger.last_fire_time(now), Some(start + sixty_days));
        assert_eq!(
            trigger.next_fire_time(now),
            start + sixty_days + Duration::from_millis(1)
        );

        let (last, count) = Trigger::Interval(trigger)
            .backlog(start + sixty_days - Duration::from_millis(2), now)
            .unwrap();
        assert_eq!(last, start + sixty_days);
        assert_eq!(count, 3);
    }
}
