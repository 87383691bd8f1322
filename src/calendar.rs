//! CF calendar arithmetic.
//!
//! Converts between `(year, month, day, hour, minute, second)` dates and
//! floating-point offsets in CF unit strings such as
//! `"days since 2000-01-01 00:00:00"`. Supports the CF calendars the
//! reader and the executive need: standard (gregorian with the julian
//! reform of 1582), proleptic gregorian, julian, noleap/365_day,
//! all_leap/366_day and 360_day. The source uses this service to convert
//! per-file time axes onto a common base; the executive uses it to
//! resolve date ranges to step indices.

use std::fmt;
use std::sync::OnceLock;

use regex::Regex;

use crate::error::{Error, Result};

const CUM_DAYS: [i64; 12] = [0, 31, 59, 90, 120, 151, 181, 212, 243, 273, 304, 334];
const CUM_DAYS_LEAP: [i64; 12] = [0, 31, 60, 91, 121, 152, 182, 213, 244, 274, 305, 335];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Calendar {
    /// Gregorian calendar with the julian calendar before 1582-10-15.
    Standard,
    Gregorian,
    ProlepticGregorian,
    Julian,
    /// 365-day years, no leap days.
    NoLeap,
    /// 366-day years, every year a leap year.
    AllLeap,
    /// Twelve 30-day months.
    Day360,
}

impl Calendar {
    pub fn parse(name: &str) -> Result<Self> {
        Ok(match name.trim().to_ascii_lowercase().as_str() {
            "" | "standard" => Calendar::Standard,
            "gregorian" => Calendar::Gregorian,
            "proleptic_gregorian" => Calendar::ProlepticGregorian,
            "julian" => Calendar::Julian,
            "noleap" | "365_day" => Calendar::NoLeap,
            "all_leap" | "366_day" => Calendar::AllLeap,
            "360_day" => Calendar::Day360,
            other => {
                return Err(Error::semantic(format!("unsupported calendar '{other}'")));
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            Calendar::Standard => "standard",
            Calendar::Gregorian => "gregorian",
            Calendar::ProlepticGregorian => "proleptic_gregorian",
            Calendar::Julian => "julian",
            Calendar::NoLeap => "noleap",
            Calendar::AllLeap => "all_leap",
            Calendar::Day360 => "360_day",
        }
    }

    fn is_leap(&self, year: i64) -> bool {
        match self {
            Calendar::NoLeap | Calendar::Day360 => false,
            Calendar::AllLeap => true,
            Calendar::Julian => year.rem_euclid(4) == 0,
            Calendar::Gregorian | Calendar::ProlepticGregorian => gregorian_leap(year),
            // The reform only moved dates, not the leap rule boundary that
            // matters here: years after 1582 follow the gregorian rule.
            Calendar::Standard => {
                if year > 1582 {
                    gregorian_leap(year)
                } else {
                    year.rem_euclid(4) == 0
                }
            }
        }
    }

    fn days_in_month(&self, year: i64, month: u32) -> u32 {
        if *self == Calendar::Day360 {
            return 30;
        }
        match month {
            1 | 3 | 5 | 7 | 8 | 10 | 12 => 31,
            4 | 6 | 9 | 11 => 30,
            2 => {
                if self.is_leap(year) {
                    29
                } else {
                    28
                }
            }
            _ => 0,
        }
    }
}

fn gregorian_leap(year: i64) -> bool {
    year.rem_euclid(4) == 0 && (year.rem_euclid(100) != 0 || year.rem_euclid(400) == 0)
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DateTime {
    pub year: i64,
    pub month: u32,
    pub day: u32,
    pub hour: u32,
    pub minute: u32,
    pub second: f64,
}

impl DateTime {
    pub fn new(year: i64, month: u32, day: u32) -> Self {
        Self {
            year,
            month,
            day,
            hour: 0,
            minute: 0,
            second: 0.0,
        }
    }

    /// Parses `"YYYY-MM-DD"` with an optional `" hh:mm:ss"` suffix.
    pub fn parse(text: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(
                r"^\s*(-?\d{1,6})-(\d{1,2})-(\d{1,2})([ Tt](\d{1,2}):(\d{1,2}):(\d{1,2}(?:\.\d+)?))?\s*$",
            )
            .expect("static regex")
        });
        let caps = re
            .captures(text)
            .ok_or_else(|| Error::semantic(format!("cannot parse date '{text}'")))?;
        let field = |i: usize| caps.get(i).map(|m| m.as_str());
        Ok(Self {
            year: field(1).unwrap().parse().unwrap(),
            month: field(2).unwrap().parse().unwrap(),
            day: field(3).unwrap().parse().unwrap(),
            hour: field(5).map_or(0, |s| s.parse().unwrap()),
            minute: field(6).map_or(0, |s| s.parse().unwrap()),
            second: field(7).map_or(0.0, |s| s.parse().unwrap()),
        })
    }

    fn day_fraction(&self) -> f64 {
        (self.hour as f64 * 3600.0 + self.minute as f64 * 60.0 + self.second) / 86400.0
    }

    fn validate(&self, calendar: Calendar) -> Result<()> {
        let ok = (1..=12).contains(&self.month)
            && self.day >= 1
            && self.day <= calendar.days_in_month(self.year, self.month)
            && self.hour < 24
            && self.minute < 60
            && self.second < 60.0;
        if !ok {
            return Err(Error::semantic(format!(
                "date {self} out of range for calendar {}",
                calendar.name()
            )));
        }
        // The ten days removed by the 1582 reform never existed.
        if calendar == Calendar::Standard
            && self.year == 1582
            && self.month == 10
            && (5..15).contains(&self.day)
        {
            return Err(Error::semantic(format!(
                "date {self} out of range for calendar standard"
            )));
        }
        Ok(())
    }
}

impl fmt::Display for DateTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:04}-{:02}-{:02} {:02}:{:02}:{:06.3}",
            self.year, self.month, self.day, self.hour, self.minute, self.second
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeUnit {
    Seconds,
    Minutes,
    Hours,
    Days,
}

impl TimeUnit {
    fn per_day(&self) -> f64 {
        match self {
            TimeUnit::Seconds => 86400.0,
            TimeUnit::Minutes => 1440.0,
            TimeUnit::Hours => 24.0,
            TimeUnit::Days => 1.0,
        }
    }
}

/// A CF unit string: measure + origin, e.g. `"hours since 1900-01-01"`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeUnits {
    pub unit: TimeUnit,
    pub origin: DateTime,
}

impl TimeUnits {
    pub fn parse(text: &str) -> Result<Self> {
        static PATTERN: OnceLock<Regex> = OnceLock::new();
        let re = PATTERN.get_or_init(|| {
            Regex::new(r"^\s*(seconds?|minutes?|hours?|days?)\s+since\s+(.+?)\s*$")
                .expect("static regex")
        });
        let caps = re
            .captures(text)
            .ok_or_else(|| Error::semantic(format!("cannot parse time units '{text}'")))?;
        let unit = match caps[1].to_ascii_lowercase().as_str() {
            "second" | "seconds" => TimeUnit::Seconds,
            "minute" | "minutes" => TimeUnit::Minutes,
            "hour" | "hours" => TimeUnit::Hours,
            _ => TimeUnit::Days,
        };
        Ok(Self {
            unit,
            origin: DateTime::parse(&caps[2])?,
        })
    }
}

/// Absolute day count (with fractional time of day) of `date` on the
/// calendar's own continuous day line.
fn absolute_days(date: &DateTime, calendar: Calendar) -> Result<f64> {
    date.validate(calendar)?;
    let y = date.year;
    let m = date.month as i64;
    let d = date.day as i64;
    let whole = match calendar {
        Calendar::Day360 => y * 360 + (m - 1) * 30 + (d - 1),
        Calendar::NoLeap => {
            y * 365 + CUM_DAYS[(m - 1) as usize] + (d - 1)
        }
        Calendar::AllLeap => {
            y * 366 + CUM_DAYS_LEAP[(m - 1) as usize] + (d - 1)
        }
        Calendar::Gregorian | Calendar::ProlepticGregorian => gregorian_day_number(y, m, d),
        Calendar::Julian => julian_day_number(y, m, d),
        Calendar::Standard => {
            // Reform boundary: 1582-10-04 (julian) is followed by
            // 1582-10-15 (gregorian).
            if (y, m, d) >= (1582, 10, 15) {
                gregorian_day_number(y, m, d)
            } else {
                julian_day_number(y, m, d)
            }
        }
    };
    Ok(whole as f64 + date.day_fraction())
}

fn gregorian_day_number(year: i64, month: i64, day: i64) -> i64 {
    let a = (14 - month).div_euclid(12);
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    day + (153 * m + 2).div_euclid(5) + 365 * y + y.div_euclid(4) - y.div_euclid(100)
        + y.div_euclid(400)
        - 32045
}

fn julian_day_number(year: i64, month: i64, day: i64) -> i64 {
    let a = (14 - month).div_euclid(12);
    let y = year + 4800 - a;
    let m = month + 12 * a - 3;
    day + (153 * m + 2).div_euclid(5) + 365 * y + y.div_euclid(4) - 32083
}

/// Inverse of [`absolute_days`] for the whole-day part.
fn date_from_absolute(days: i64, calendar: Calendar) -> DateTime {
    match calendar {
        Calendar::Day360 => {
            let year = days.div_euclid(360);
            let rem = days.rem_euclid(360);
            DateTime::new(year, (rem / 30 + 1) as u32, (rem % 30 + 1) as u32)
        }
        Calendar::NoLeap => fixed_year_date(days, 365, &CUM_DAYS),
        Calendar::AllLeap => fixed_year_date(days, 366, &CUM_DAYS_LEAP),
        Calendar::Gregorian | Calendar::ProlepticGregorian => gregorian_from_day_number(days),
        Calendar::Julian => julian_from_day_number(days),
        Calendar::Standard => {
            // 2299161 is the day number of 1582-10-15.
            if days >= 2299161 {
                gregorian_from_day_number(days)
            } else {
                julian_from_day_number(days)
            }
        }
    }
}

fn fixed_year_date(days: i64, year_len: i64, cumulative: &[i64; 12]) -> DateTime {
    let year = days.div_euclid(year_len);
    let doy = days.rem_euclid(year_len);
    let month = cumulative.iter().rposition(|c| *c <= doy).unwrap_or(0);
    DateTime::new(year, (month + 1) as u32, (doy - cumulative[month] + 1) as u32)
}

fn gregorian_from_day_number(jdn: i64) -> DateTime {
    let a = jdn + 32044;
    let b = (4 * a + 3).div_euclid(146097);
    let c = a - (146097 * b).div_euclid(4);
    let d = (4 * c + 3).div_euclid(1461);
    let e = c - (1461 * d).div_euclid(4);
    let m = (5 * e + 2).div_euclid(153);
    DateTime::new(
        100 * b + d - 4800 + m.div_euclid(10),
        (m + 3 - 12 * m.div_euclid(10)) as u32,
        (e - (153 * m + 2).div_euclid(5) + 1) as u32,
    )
}

fn julian_from_day_number(jdn: i64) -> DateTime {
    let c = jdn + 32082;
    let d = (4 * c + 3).div_euclid(1461);
    let e = c - (1461 * d).div_euclid(4);
    let m = (5 * e + 2).div_euclid(153);
    DateTime::new(
        d - 4800 + m.div_euclid(10),
        (m + 3 - 12 * m.div_euclid(10)) as u32,
        (e - (153 * m + 2).div_euclid(5) + 1) as u32,
    )
}

/// Offset of `date` in `units` on `calendar`.
pub fn date_to_offset(date: &DateTime, units: &TimeUnits, calendar: Calendar) -> Result<f64> {
    let days = absolute_days(date, calendar)? - absolute_days(&units.origin, calendar)?;
    Ok(days * units.unit.per_day())
}

/// Date at `offset` in `units` on `calendar`.
pub fn offset_to_date(offset: f64, units: &TimeUnits, calendar: Calendar) -> Result<DateTime> {
    let absolute = absolute_days(&units.origin, calendar)? + offset / units.unit.per_day();
    let whole = absolute.floor();
    let mut date = date_from_absolute(whole as i64, calendar);
    let mut seconds = (absolute - whole) * 86400.0;
    // Guard against accumulated floating point pushing us to 24:00:00.
    if seconds >= 86399.9995 {
        return offset_to_date(
            (whole + 1.0 - absolute_days(&units.origin, calendar)?) * units.unit.per_day(),
            units,
            calendar,
        );
    }
    date.hour = (seconds / 3600.0) as u32;
    seconds -= date.hour as f64 * 3600.0;
    date.minute = (seconds / 60.0) as u32;
    date.second = seconds - date.minute as f64 * 60.0;
    Ok(date)
}

/// Re-expresses `offset` given in `from` units as an offset in `to` units.
/// Both axes must share the calendar; the caller checks that.
pub fn convert_offset(
    offset: f64,
    from: &TimeUnits,
    to: &TimeUnits,
    calendar: Calendar,
) -> Result<f64> {
    let days = offset / from.unit.per_day() + absolute_days(&from.origin, calendar)?
        - absolute_days(&to.origin, calendar)?;
    Ok(days * to.unit.per_day())
}
