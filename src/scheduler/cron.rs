//! Five-field cron expressions (minute hour day-of-month month day-of-week)
//! evaluated in an IANA time zone. Standard vixie-cron day semantics: when
//! both day fields are restricted, either may match.

use chrono::{Datelike, TimeZone, Timelike, Utc};
use chrono_tz::Tz;
use std::collections::BTreeSet;

const MAX_SEARCH_MINUTES: i64 = 60 * 24 * 366 * 5;

#[derive(Debug, Clone)]
struct CronField {
    any: bool,
    values: BTreeSet<u32>,
}

impl CronField {
    fn matches(&self, value: u32) -> bool {
        self.any || self.values.contains(&value)
    }
}

#[derive(Debug, Clone)]
pub struct CronExpression {
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

pub fn parse_cron_expression(raw: &str) -> Result<CronExpression, String> {
    let fields: Vec<&str> = raw.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(
            "cron expression must use 5 fields: minute hour day_of_month month day_of_week"
                .to_string(),
        );
    }

    Ok(CronExpression {
        minute: parse_cron_field(fields[0], 0, 59, AliasKind::None)?,
        hour: parse_cron_field(fields[1], 0, 23, AliasKind::None)?,
        day_of_month: parse_cron_field(fields[2], 1, 31, AliasKind::None)?,
        month: parse_cron_field(fields[3], 1, 12, AliasKind::Month)?,
        day_of_week: parse_cron_field(fields[4], 0, 7, AliasKind::Weekday)?,
    })
}

fn cron_matches(expr: &CronExpression, unix_secs: i64, timezone: &Tz) -> bool {
    let Some(utc_dt) = Utc.timestamp_opt(unix_secs, 0).single() else {
        return false;
    };
    let local = utc_dt.with_timezone(timezone);

    if !expr.minute.matches(local.minute())
        || !expr.hour.matches(local.hour())
        || !expr.month.matches(local.month())
    {
        return false;
    }

    let day_of_month_match = expr.day_of_month.matches(local.day());
    let day_of_week = local.weekday().num_days_from_sunday();
    let day_of_week_match = expr.day_of_week.matches(day_of_week);

    if expr.day_of_month.any || expr.day_of_week.any {
        day_of_month_match && day_of_week_match
    } else {
        day_of_month_match || day_of_week_match
    }
}

/// First matching instant strictly after `after_ms`, as unix milliseconds.
/// The search walks whole minutes, so results land on minute boundaries.
pub fn next_cron_occurrence(
    expr: &CronExpression,
    after_ms: i64,
    timezone: &Tz,
) -> Result<i64, String> {
    let mut candidate_secs = ((after_ms / 1_000) / 60 + 1) * 60;
    for _ in 0..MAX_SEARCH_MINUTES {
        if cron_matches(expr, candidate_secs, timezone) {
            return Ok(candidate_secs * 1_000);
        }
        candidate_secs = candidate_secs.saturating_add(60);
    }
    Err("no matching instant within the cron search horizon".to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AliasKind {
    None,
    Month,
    Weekday,
}

fn parse_cron_field(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
) -> Result<CronField, String> {
    if raw == "*" {
        return Ok(CronField {
            any: true,
            values: BTreeSet::new(),
        });
    }

    let mut values = BTreeSet::new();
    for segment in raw.split(',') {
        parse_cron_segment(segment, min, max, aliases, &mut values)?;
    }
    if values.is_empty() {
        return Err(format!("invalid cron field `{raw}`"));
    }
    Ok(CronField { any: false, values })
}

fn parse_cron_segment(
    raw: &str,
    min: u32,
    max: u32,
    aliases: AliasKind,
    values: &mut BTreeSet<u32>,
) -> Result<(), String> {
    let (range_raw, step) = match raw.split_once('/') {
        Some((range, step_raw)) => {
            let step = step_raw
                .parse::<u32>()
                .map_err(|_| format!("invalid cron step `{step_raw}`"))?;
            if step == 0 {
                return Err("cron step must be >= 1".to_string());
            }
            (range, step)
        }
        None => (raw, 1),
    };

    let (start, end) = if range_raw == "*" {
        (min, max)
    } else if let Some((start_raw, end_raw)) = range_raw.split_once('-') {
        (
            parse_cron_atom(start_raw, min, max, aliases)?,
            parse_cron_atom(end_raw, min, max, aliases)?,
        )
    } else {
        let value = parse_cron_atom(range_raw, min, max, aliases)?;
        (value, value)
    };

    if start > end {
        return Err(format!("invalid cron range `{raw}`"));
    }

    let mut value = start;
    while value <= end {
        // cron treats both 0 and 7 as Sunday
        let normalized = if aliases == AliasKind::Weekday && value == 7 {
            0
        } else {
            value
        };
        values.insert(normalized);
        match value.checked_add(step) {
            Some(next) => value = next,
            None => break,
        }
    }
    Ok(())
}

fn parse_cron_atom(raw: &str, min: u32, max: u32, aliases: AliasKind) -> Result<u32, String> {
    let value = match aliases {
        AliasKind::None => raw
            .parse::<u32>()
            .map_err(|_| format!("invalid cron value `{raw}`"))?,
        AliasKind::Month => match raw.to_ascii_lowercase().as_str() {
            "jan" => 1,
            "feb" => 2,
            "mar" => 3,
            "apr" => 4,
            "may" => 5,
            "jun" => 6,
            "jul" => 7,
            "aug" => 8,
            "sep" => 9,
            "oct" => 10,
            "nov" => 11,
            "dec" => 12,
            other => other
                .parse::<u32>()
                .map_err(|_| format!("invalid cron month `{raw}`"))?,
        },
        AliasKind::Weekday => match raw.to_ascii_lowercase().as_str() {
            "sun" => 0,
            "mon" => 1,
            "tue" => 2,
            "wed" => 3,
            "thu" => 4,
            "fri" => 5,
            "sat" => 6,
            other => other
                .parse::<u32>()
                .map_err(|_| format!("invalid cron weekday `{raw}`"))?,
        },
    };

    if value < min || value > max {
        return Err(format!(
            "cron value `{raw}` out of range {min}..={max}"
        ));
    }
    Ok(value)
}
