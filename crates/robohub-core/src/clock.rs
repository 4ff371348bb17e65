// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wall-clock helpers, timezone resolution, and schedule windows.

use chrono::{DateTime, NaiveTime, Timelike, Utc};
use chrono_tz::Tz;

use crate::error::CoreError;

/// Current wall-clock time in UTC.
pub fn now_utc() -> DateTime<Utc> {
    Utc::now()
}

/// Resolve an IANA timezone name, falling back to `fallback` and then UTC.
///
/// Schedules keep whatever name they were created with; a name that later
/// becomes unresolvable must not take the scheduler down.
pub fn resolve_timezone(name: &str, fallback: &str) -> Tz {
    if let Ok(tz) = name.parse::<Tz>() {
        return tz;
    }
    fallback.parse::<Tz>().unwrap_or(chrono_tz::UTC)
}

/// Parse an "HH:MM" string into a time of day.
pub fn parse_hhmm(value: &str) -> Result<NaiveTime, CoreError> {
    let invalid = || CoreError::ValidationError {
        field: "time".to_string(),
        message: format!("'{}' is not a valid HH:MM time", value),
    };
    let (hour_str, minute_str) = value.split_once(':').ok_or_else(invalid)?;
    let hour: u32 = hour_str.parse().map_err(|_| invalid())?;
    let minute: u32 = minute_str.parse().map_err(|_| invalid())?;
    NaiveTime::from_hms_opt(hour, minute, 0).ok_or_else(invalid)
}

/// Whether the local time of `instant` in `tz` falls inside the window.
///
/// Both bounds inclusive. A window whose start is after its end wraps
/// around midnight (e.g. 22:00-06:00). An unset window always matches.
pub fn within_window(
    instant: DateTime<Utc>,
    tz: Tz,
    window_start: Option<&str>,
    window_end: Option<&str>,
) -> Result<bool, CoreError> {
    let (Some(start_raw), Some(end_raw)) = (window_start, window_end) else {
        return Ok(true);
    };
    let start = parse_hhmm(start_raw)?;
    let end = parse_hhmm(end_raw)?;
    let local = instant.with_timezone(&tz);
    let now = NaiveTime::from_hms_opt(local.hour(), local.minute(), local.second())
        .unwrap_or_default();

    if start <= end {
        Ok(start <= now && now <= end)
    } else {
        Ok(now >= start || now <= end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_parse_hhmm() {
        assert_eq!(
            parse_hhmm("08:30").unwrap(),
            NaiveTime::from_hms_opt(8, 30, 0).unwrap()
        );
        assert!(parse_hhmm("8h30").is_err());
        assert!(parse_hhmm("25:00").is_err());
    }

    #[test]
    fn test_resolve_timezone_fallback() {
        assert_eq!(
            resolve_timezone("America/Sao_Paulo", "UTC"),
            chrono_tz::America::Sao_Paulo
        );
        assert_eq!(resolve_timezone("Not/AZone", "UTC"), chrono_tz::UTC);
        assert_eq!(
            resolve_timezone("Not/AZone", "Europe/Warsaw"),
            chrono_tz::Europe::Warsaw
        );
    }

    #[test]
    fn test_window_plain() {
        let tz = chrono_tz::UTC;
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(within_window(noon, tz, Some("09:00"), Some("18:00")).unwrap());
        assert!(!within_window(noon, tz, Some("13:00"), Some("18:00")).unwrap());
        assert!(within_window(noon, tz, None, None).unwrap());
    }

    #[test]
    fn test_window_wraps_midnight() {
        let tz = chrono_tz::UTC;
        let late = Utc.with_ymd_and_hms(2025, 6, 1, 23, 30, 0).unwrap();
        let early = Utc.with_ymd_and_hms(2025, 6, 1, 5, 0, 0).unwrap();
        let noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        assert!(within_window(late, tz, Some("22:00"), Some("06:00")).unwrap());
        assert!(within_window(early, tz, Some("22:00"), Some("06:00")).unwrap());
        assert!(!within_window(noon, tz, Some("22:00"), Some("06:00")).unwrap());
    }

    #[test]
    fn test_window_respects_timezone() {
        let tz = chrono_tz::America::Sao_Paulo; // UTC-3
        let utc_noon = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        // 09:00 local in Sao Paulo
        assert!(within_window(utc_noon, tz, Some("08:00"), Some("10:00")).unwrap());
        assert!(!within_window(utc_noon, tz, Some("11:00"), Some("13:00")).unwrap());
    }
}
