// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! 5-field cron expression parsing and local-time fire walking.
//!
//! Supports the standard `minute hour day-of-month month day-of-week` form
//! with `*`, `*/N`, single values, ranges `a-b`, stepped ranges `a-b/N` and
//! comma lists. Day-of-week accepts 0-7 with both 0 and 7 meaning Sunday.
//!
//! Fire times are walked in LOCAL time and converted to UTC for storage:
//! an ambiguous local minute during a fall-back transition fires once at
//! the earliest instant, and a local minute skipped by spring-forward does
//! not fire at all.

use chrono::{DateTime, Datelike, Duration, NaiveDateTime, TimeZone, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CoreError;

/// Cap on the local minutes walked in one call, as a runaway guard.
const MAX_WALK_MINUTES: i64 = 4 * 24 * 60;

/// A parsed 5-field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    minutes: Vec<u32>,
    hours: Vec<u32>,
    days_of_month: Vec<u32>,
    months: Vec<u32>,
    days_of_week: Vec<u32>,
}

impl CronExpr {
    /// Whether the given local time matches this expression.
    ///
    /// Seconds are ignored; cron resolution is one minute.
    pub fn matches(&self, local: NaiveDateTime) -> bool {
        let dow = local.weekday().num_days_from_sunday();
        self.minutes.contains(&local.minute())
            && self.hours.contains(&local.hour())
            && self.days_of_month.contains(&local.day())
            && self.months.contains(&local.month())
            && self.days_of_week.contains(&dow)
    }

    /// Fire times in `(after, until]`, walked in `tz` local time.
    ///
    /// Returns UTC instants in ascending order. The walk is capped at
    /// [`MAX_WALK_MINUTES`]; fire times beyond the cap are left for the
    /// next scheduler cycle.
    pub fn fire_times(&self, tz: Tz, after: DateTime<Utc>, until: DateTime<Utc>) -> Vec<DateTime<Utc>> {
        let mut fires = Vec::new();
        if until <= after {
            return fires;
        }

        // Truncate to the minute after `after` and walk local wall time.
        let start_local = (after.with_timezone(&tz) + Duration::minutes(1))
            .naive_local()
            .with_second(0)
            .and_then(|t| t.with_nanosecond(0))
            .unwrap_or_else(|| after.with_timezone(&tz).naive_local());
        let end_local = until.with_timezone(&tz).naive_local();

        let mut candidate = start_local;
        let mut walked = 0i64;
        while candidate <= end_local && walked < MAX_WALK_MINUTES {
            if self.matches(candidate) {
                // Ambiguous local times fire once at the earliest instant;
                // nonexistent local times (spring-forward gap) are skipped.
                if let Some(instant) = tz.from_local_datetime(&candidate).earliest() {
                    let utc = instant.with_timezone(&Utc);
                    if utc > after && utc <= until {
                        fires.push(utc);
                    }
                }
            }
            candidate += Duration::minutes(1);
            walked += 1;
        }

        fires
    }
}

impl std::str::FromStr for CronExpr {
    type Err = CoreError;

    fn from_str(expr: &str) -> Result<Self, Self::Err> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid_cron(expr, "expected 5 fields"));
        }

        Ok(CronExpr {
            minutes: parse_field(fields[0], 0, 59, false)
                .ok_or_else(|| invalid_cron(expr, "bad minute field"))?,
            hours: parse_field(fields[1], 0, 23, false)
                .ok_or_else(|| invalid_cron(expr, "bad hour field"))?,
            days_of_month: parse_field(fields[2], 1, 31, false)
                .ok_or_else(|| invalid_cron(expr, "bad day-of-month field"))?,
            months: parse_field(fields[3], 1, 12, false)
                .ok_or_else(|| invalid_cron(expr, "bad month field"))?,
            days_of_week: parse_field(fields[4], 0, 7, true)
                .ok_or_else(|| invalid_cron(expr, "bad day-of-week field"))?,
        })
    }
}

fn invalid_cron(expr: &str, reason: &str) -> CoreError {
    CoreError::ValidationError {
        field: "cron_expr".to_string(),
        message: format!("'{}': {}", expr, reason),
    }
}

/// Parse one cron field into the sorted set of matching values.
///
/// For day-of-week, 7 is folded onto 0 (Sunday) after parsing.
fn parse_field(field: &str, min: u32, max: u32, is_dow: bool) -> Option<Vec<u32>> {
    let mut values = Vec::new();

    for part in field.split(',') {
        let part = part.trim();
        if part.is_empty() {
            return None;
        }

        let (base, step) = match part.split_once('/') {
            Some((base, step_text)) => {
                let step: u32 = step_text.parse().ok()?;
                if step == 0 {
                    return None;
                }
                (base, step)
            }
            None => (part, 1),
        };

        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((lo_text, hi_text)) = base.split_once('-') {
            let lo: u32 = lo_text.parse().ok()?;
            let hi: u32 = hi_text.parse().ok()?;
            if lo > hi || lo < min || hi > max {
                return None;
            }
            (lo, hi)
        } else {
            let value: u32 = base.parse().ok()?;
            if value < min || value > max {
                return None;
            }
            (value, value)
        };

        let mut v = lo;
        while v <= hi {
            values.push(if is_dow && v == 7 { 0 } else { v });
            v += step;
        }
    }

    values.sort_unstable();
    values.dedup();
    if values.is_empty() { None } else { Some(values) }
}
