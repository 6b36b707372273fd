//! MQ-004: Period resolution. Named periods to half-open date windows.

use super::error::CompileError;
use super::types::{DateRange, PeriodSpec};
use chrono::{Datelike, Duration, NaiveDate};

/// Resolve a period to `[start, end)`.
pub fn resolve(spec: &PeriodSpec) -> Result<DateRange, CompileError> {
    let (start, end) = match *spec {
        PeriodSpec::Year { year } => (ymd(year, 1, 1)?, ymd(year + 1, 1, 1)?),
        PeriodSpec::Quarter { year, quarter } => {
            if !(1..=4).contains(&quarter) {
                return Err(CompileError::InvalidPeriod(format!(
                    "quarter {} is not 1-4",
                    quarter
                )));
            }
            let start = ymd(year, (quarter - 1) * 3 + 1, 1)?;
            (start, add_months(start, 3)?)
        }
        PeriodSpec::Month { year, month } => {
            if !(1..=12).contains(&month) {
                return Err(CompileError::InvalidPeriod(format!(
                    "month {} is not 1-12",
                    month
                )));
            }
            let start = ymd(year, month, 1)?;
            (start, add_months(start, 1)?)
        }
        PeriodSpec::Day { date } => (date, next_day(date)?),
        PeriodSpec::Range { start, end } => (start, end),
    };
    DateRange::new(start, end).map_err(CompileError::InvalidPeriod)
}

fn ymd(year: i32, month: u32, day: u32) -> Result<NaiveDate, CompileError> {
    NaiveDate::from_ymd_opt(year, month, day).ok_or_else(|| {
        CompileError::InvalidPeriod(format!("{:04}-{:02}-{:02} is not a date", year, month, day))
    })
}

fn next_day(date: NaiveDate) -> Result<NaiveDate, CompileError> {
    date.succ_opt()
        .ok_or_else(|| CompileError::InvalidPeriod(format!("{} has no successor", date)))
}

/// First day of the month `months` after the month containing `date`.
pub fn add_months(date: NaiveDate, months: i32) -> Result<NaiveDate, CompileError> {
    let index = date.year() * 12 + date.month0() as i32 + months;
    ymd(index.div_euclid(12), index.rem_euclid(12) as u32 + 1, 1)
}

/// First day of the month containing `date`.
pub fn month_start(date: NaiveDate) -> NaiveDate {
    date.with_day(1).unwrap_or(date)
}

/// First day of the quarter containing `date`.
pub fn quarter_start(date: NaiveDate) -> NaiveDate {
    let month = date.month0() / 3 * 3 + 1;
    NaiveDate::from_ymd_opt(date.year(), month, 1).unwrap_or(date)
}

/// Monday of the week containing `date`.
pub fn week_start(date: NaiveDate) -> NaiveDate {
    date - Duration::days(date.weekday().num_days_from_monday() as i64)
}
