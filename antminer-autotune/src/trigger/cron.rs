//! Cron-style calendar trigger.
//!
//! Fields, most significant first: `year`, `month`, `day`, `week` (ISO week),
//! `day_of_week`, `hour`, `minute`, `second`. Each field takes a
//! comma-separated list of:
//!
//! | Expression | Meaning                                   |
//! |------------|-------------------------------------------|
//! | `*`        | every value                               |
//! | `*/n`      | every `n`th value from the field minimum  |
//! | `a`        | exactly `a`                               |
//! | `a/n`      | every `n`th value from `a` up             |
//! | `a-b`      | `a` through `b`                           |
//! | `a-b/n`    | every `n`th value from `a` through `b`    |
//! | `last`     | last day of the month (`day` only)        |
//!
//! `month` accepts `jan`..`dec` and `day_of_week` accepts `mon`..`sun`, with
//! Monday as 0.
//!
//! Unset fields more significant than the least significant set field match
//! everything. Unset fields below it take their minimum, except `week` and
//! `day_of_week` which always default to everything. So `hour: 3` means
//! 03:00:00 every day, and `minute: "*/15"` means every quarter hour.

use chrono::{Datelike, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, Timelike};

/// Searches stop past this year.
const MAX_YEAR: i32 = 9999;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("invalid {field} expression {expr:?}: {reason}")]
    InvalidExpression {
        field: &'static str,
        expr: String,
        reason: String,
    },

    #[error("invalid date {0:?}, expected YYYY-MM-DD or YYYY-MM-DD HH:MM:SS")]
    InvalidDate(String),

    #[error("no time fields given")]
    NoFields,

    #[error("end date {end} is before start date {start}")]
    EmptyRange {
        start: NaiveDateTime,
        end: NaiveDateTime,
    },
}

/// Unparsed cron fields as they appear in configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CronSpec {
    pub year: Option<String>,
    pub month: Option<String>,
    pub day: Option<String>,
    pub week: Option<String>,
    pub day_of_week: Option<String>,
    pub hour: Option<String>,
    pub minute: Option<String>,
    pub second: Option<String>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}

impl CronSpec {
    fn expressions(&self) -> [Option<&str>; 8] {
        [
            self.year.as_deref(),
            self.month.as_deref(),
            self.day.as_deref(),
            self.week.as_deref(),
            self.day_of_week.as_deref(),
            self.hour.as_deref(),
            self.minute.as_deref(),
            self.second.as_deref(),
        ]
    }
}

/// Parse a start or end date.
pub fn parse_date(text: &str) -> Result<NaiveDateTime, CronError> {
    let text = text.trim();
    for format in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(datetime) = NaiveDateTime::parse_from_str(text, format) {
            return Ok(datetime);
        }
    }
    NaiveDate::parse_from_str(text, "%Y-%m-%d")
        .map(|date| date.and_time(NaiveTime::MIN))
        .map_err(|_| CronError::InvalidDate(text.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FieldKind {
    Year,
    Month,
    Day,
    Week,
    DayOfWeek,
    Hour,
    Minute,
    Second,
}

const FIELD_ORDER: [FieldKind; 8] = [
    FieldKind::Year,
    FieldKind::Month,
    FieldKind::Day,
    FieldKind::Week,
    FieldKind::DayOfWeek,
    FieldKind::Hour,
    FieldKind::Minute,
    FieldKind::Second,
];

const MONTHS: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const WEEKDAYS: [&str; 7] = ["mon", "tue", "wed", "thu", "fri", "sat", "sun"];

impl FieldKind {
    fn name(self) -> &'static str {
        match self {
            FieldKind::Year => "year",
            FieldKind::Month => "month",
            FieldKind::Day => "day",
            FieldKind::Week => "week",
            FieldKind::DayOfWeek => "day_of_week",
            FieldKind::Hour => "hour",
            FieldKind::Minute => "minute",
            FieldKind::Second => "second",
        }
    }

    fn bounds(self) -> (u32, u32) {
        match self {
            FieldKind::Year => (1970, MAX_YEAR as u32),
            FieldKind::Month => (1, 12),
            FieldKind::Day => (1, 31),
            FieldKind::Week => (1, 53),
            FieldKind::DayOfWeek => (0, 6),
            FieldKind::Hour => (0, 23),
            FieldKind::Minute | FieldKind::Second => (0, 59),
        }
    }

    /// Expression used when the field is unset and below the least
    /// significant set field.
    fn low_default(self) -> &'static str {
        match self {
            FieldKind::Year | FieldKind::Week | FieldKind::DayOfWeek => "*",
            FieldKind::Month | FieldKind::Day => "1",
            FieldKind::Hour | FieldKind::Minute | FieldKind::Second => "0",
        }
    }

    fn parse_value(self, text: &str) -> Option<u32> {
        if let Ok(value) = text.parse::<u32>() {
            return Some(value);
        }
        let names: &[&str] = match self {
            FieldKind::Month => &MONTHS,
            FieldKind::DayOfWeek => &WEEKDAYS,
            _ => return None,
        };
        let index = names.iter().position(|name| *name == text)? as u32;
        Some(if self == FieldKind::Month { index + 1 } else { index })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Part {
    Every { step: u32 },
    Range { lo: u32, hi: u32, step: u32 },
    LastDay,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    kind: FieldKind,
    parts: Vec<Part>,
}

impl Field {
    fn parse(kind: FieldKind, expr: &str) -> Result<Self, CronError> {
        let invalid = |reason: &str| CronError::InvalidExpression {
            field: kind.name(),
            expr: expr.to_string(),
            reason: reason.to_string(),
        };

        let (min, max) = kind.bounds();
        let mut parts = Vec::new();

        for item in expr.split(',') {
            let item = item.trim().to_ascii_lowercase();
            if item.is_empty() {
                return Err(invalid("empty list item"));
            }

            if item == "last" {
                if kind != FieldKind::Day {
                    return Err(invalid("`last` is only valid for day"));
                }
                parts.push(Part::LastDay);
                continue;
            }

            let (base, step) = match item.split_once('/') {
                Some((base, step)) => {
                    let step = step
                        .parse::<u32>()
                        .ok()
                        .filter(|step| *step > 0)
                        .ok_or_else(|| invalid("step must be a positive integer"))?;
                    (base, step)
                }
                None => (item.as_str(), 1),
            };

            let value = |text: &str| {
                kind.parse_value(text)
                    .filter(|v| (min..=max).contains(v))
                    .ok_or_else(|| invalid(&format!("value must be within {min}-{max}")))
            };

            let part = if base == "*" {
                Part::Every { step }
            } else if let Some((lo, hi)) = base.split_once('-') {
                let (lo, hi) = (value(lo)?, value(hi)?);
                if lo > hi {
                    return Err(invalid("range start is after range end"));
                }
                Part::Range { lo, hi, step }
            } else {
                let lo = value(base)?;
                let hi = if step > 1 { max } else { lo };
                Part::Range { lo, hi, step }
            };
            parts.push(part);
        }

        Ok(Self { kind, parts })
    }

    fn matches(&self, value: u32, last_day: u32) -> bool {
        let (min, _) = self.kind.bounds();
        self.parts.iter().any(|part| match *part {
            Part::Every { step } => value.checked_sub(min).is_some_and(|v| v % step == 0),
            Part::Range { lo, hi, step } => (lo..=hi).contains(&value) && (value - lo) % step == 0,
            Part::LastDay => value == last_day,
        })
    }

    fn matches_simple(&self, value: u32) -> bool {
        self.matches(value, 0)
    }
}

/// Calendar trigger evaluated on local wall-clock time.
#[derive(Debug, Clone, PartialEq)]
pub struct CronTrigger {
    year: Field,
    month: Field,
    day: Field,
    week: Field,
    day_of_week: Field,
    hour: Field,
    minute: Field,
    second: Field,
    start_date: Option<NaiveDateTime>,
    end_date: Option<NaiveDateTime>,
}

impl CronTrigger {
    pub fn new(spec: &CronSpec) -> Result<Self, CronError> {
        let expressions = spec.expressions();
        let least_significant = expressions
            .iter()
            .rposition(Option::is_some)
            .ok_or(CronError::NoFields)?;

        if let (Some(start), Some(end)) = (spec.start_date, spec.end_date) {
            if end < start {
                return Err(CronError::EmptyRange { start, end });
            }
        }

        let field = |index: usize| {
            let kind = FIELD_ORDER[index];
            let expr = match expressions[index] {
                Some(expr) => expr,
                None if index > least_significant => kind.low_default(),
                None => "*",
            };
            Field::parse(kind, expr)
        };

        Ok(Self {
            year: field(0)?,
            month: field(1)?,
            day: field(2)?,
            week: field(3)?,
            day_of_week: field(4)?,
            hour: field(5)?,
            minute: field(6)?,
            second: field(7)?,
            start_date: spec.start_date,
            end_date: spec.end_date,
        })
    }

    /// Earliest matching whole second strictly after `after`.
    pub fn next_fire_time(&self, after: NaiveDateTime) -> Option<NaiveDateTime> {
        let mut start = after
            .with_nanosecond(0)?
            .checked_add_signed(TimeDelta::seconds(1))?;
        if let Some(start_date) = self.start_date {
            start = start.max(start_date);
        }

        let mut date = start.date();
        loop {
            if date.year() > MAX_YEAR {
                return None;
            }
            if let Some(end) = self.end_date {
                if date > end.date() {
                    return None;
                }
            }

            if !self.year.matches_simple(date.year() as u32) {
                date = NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)?;
                continue;
            }
            if !self.month.matches_simple(date.month()) {
                date = first_of_next_month(date)?;
                continue;
            }

            if self.date_matches(date) {
                let from = if date == start.date() {
                    start.time()
                } else {
                    NaiveTime::MIN
                };
                if let Some(time) = self.first_time_from(from) {
                    let fire = date.and_time(time);
                    return match self.end_date {
                        Some(end) if fire > end => None,
                        _ => Some(fire),
                    };
                }
            }

            date = date.succ_opt()?;
        }
    }

    fn date_matches(&self, date: NaiveDate) -> bool {
        self.day.matches(date.day(), last_day_of_month(date))
            && self.week.matches_simple(date.iso_week().week())
            && self
                .day_of_week
                .matches_simple(date.weekday().num_days_from_monday())
    }

    fn first_time_from(&self, from: NaiveTime) -> Option<NaiveTime> {
        for hour in from.hour()..24 {
            if !self.hour.matches_simple(hour) {
                continue;
            }
            let first_minute = if hour == from.hour() { from.minute() } else { 0 };
            for minute in first_minute..60 {
                if !self.minute.matches_simple(minute) {
                    continue;
                }
                let first_second = if hour == from.hour() && minute == from.minute() {
                    from.second()
                } else {
                    0
                };
                if let Some(second) = (first_second..60).find(|s| self.second.matches_simple(*s)) {
                    return NaiveTime::from_hms_opt(hour, minute, second);
                }
            }
        }
        None
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

fn last_day_of_month(date: NaiveDate) -> u32 {
    first_of_next_month(date)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}
