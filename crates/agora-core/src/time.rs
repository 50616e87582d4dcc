//! Timestamp normalization between forum text, canonical epoch seconds and relative ages.
//!
//! Every conversion takes the current instant explicitly and never fails: unusable input
//! collapses to [`INVALID_EPOCH`] or [`UNKNOWN_RELATIVE`].

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone};
use tracing::debug;

/// Sentinel epoch for timestamps that could not be understood.
pub const INVALID_EPOCH: i64 = -1;

/// Sentinel relative-age text for epochs that cannot be rendered.
pub const UNKNOWN_RELATIVE: &str = "Unknown";

const SECONDS_PER_MINUTE: i64 = 60;
const SECONDS_PER_HOUR: i64 = 3_600;
const SECONDS_PER_DAY: i64 = 86_400;

/// Convert absolute forum timestamp text into epoch seconds.
///
/// Naive inputs are read in the offset carried by `now` (the forum's local time).
pub fn absolute_to_epoch(raw: &str, now: DateTime<FixedOffset>) -> i64 {
    match parse_absolute(raw.trim(), now) {
        Some(instant) => instant.timestamp(),
        None => {
            debug!(input = raw, "unrecognized absolute timestamp");
            INVALID_EPOCH
        }
    }
}

fn parse_absolute(text: &str, now: DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
    if text.is_empty() {
        return None;
    }

    if text.contains('T') && text.ends_with('Z') {
        let naive = NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.fZ").ok()?;
        return Some(naive.and_utc().fixed_offset());
    }

    if text.contains('/') {
        let parts = text.split_whitespace().collect::<Vec<_>>();
        return match parts.as_slice() {
            [date] => {
                let date = NaiveDate::parse_from_str(date, "%m/%d/%Y").ok()?;
                in_offset(now, date.and_hms_opt(0, 0, 0)?)
            }
            [day_month, time] => parse_day_month_time(day_month, time, now),
            _ => None,
        };
    }

    if text.split(':').count() == 3 {
        let upper = text.to_ascii_uppercase();
        let time = if upper.contains("AM") || upper.contains("PM") {
            NaiveTime::parse_from_str(&upper, "%I:%M:%S %p").ok()?
        } else {
            NaiveTime::parse_from_str(text, "%H:%M:%S").ok()?
        };
        return in_latest_past_year(now.month(), now.day(), time, now);
    }

    None
}

/// `D/M HH:MM:SS`: the date is given, only the year is inferred.
fn parse_day_month_time(
    day_month: &str,
    time: &str,
    now: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    let (day, month) = day_month.split_once('/')?;
    let day: u32 = day.trim().parse().ok()?;
    let month: u32 = month.trim().parse().ok()?;
    let time = NaiveTime::parse_from_str(time, "%H:%M:%S").ok()?;
    in_latest_past_year(month, day, time, now)
}

/// Current year, or the previous one when that reading lands after `now`.
fn in_latest_past_year(
    month: u32,
    day: u32,
    time: NaiveTime,
    now: DateTime<FixedOffset>,
) -> Option<DateTime<FixedOffset>> {
    [now.year(), now.year() - 1].into_iter().find_map(|year| {
        let candidate = in_offset(now, NaiveDate::from_ymd_opt(year, month, day)?.and_time(time))?;
        (candidate <= now).then_some(candidate)
    })
}

fn in_offset(now: DateTime<FixedOffset>, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
    now.offset().from_local_datetime(&naive).single()
}

/// Render the distance between `epoch` and `now` as `<n>d`, `<n>h`, `<n>m` or `<n>s`.
///
/// Past and future instants are treated alike. The invalid sentinel renders as `"Unknown"`.
pub fn epoch_to_relative(epoch: i64, now: DateTime<FixedOffset>) -> String {
    if epoch < 0 || DateTime::from_timestamp(epoch, 0).is_none() {
        debug!(epoch, "epoch cannot be rendered as a relative age");
        return UNKNOWN_RELATIVE.to_string();
    }

    let elapsed = (now.timestamp() - epoch).abs();
    let days = elapsed / SECONDS_PER_DAY;
    let rest = elapsed % SECONDS_PER_DAY;
    if days > 0 {
        format!("{days}d")
    } else if rest >= SECONDS_PER_HOUR {
        format!("{}h", rest / SECONDS_PER_HOUR)
    } else if rest >= SECONDS_PER_MINUTE {
        format!("{}m", rest / SECONDS_PER_MINUTE)
    } else {
        format!("{rest}s")
    }
}

/// Same as [`epoch_to_relative`] for epochs that arrive as text.
pub fn epoch_text_to_relative(raw: &str, now: DateTime<FixedOffset>) -> String {
    match raw.trim().parse::<i64>() {
        Ok(epoch) => epoch_to_relative(epoch, now),
        Err(_) => {
            debug!(input = raw, "non-numeric epoch");
            UNKNOWN_RELATIVE.to_string()
        }
    }
}

/// Convert a relative age token (`43s`, `5m`, `2h`, `3j`) into epoch seconds.
///
/// The magnitude may carry a sign; `-3m` lands three minutes after `now`.
pub fn relative_to_epoch(raw: &str, now: DateTime<FixedOffset>) -> i64 {
    match parse_relative(raw.trim(), now) {
        Some(epoch) => epoch,
        None => {
            debug!(input = raw, "unrecognized relative timestamp");
            INVALID_EPOCH
        }
    }
}

fn parse_relative(text: &str, now: DateTime<FixedOffset>) -> Option<i64> {
    let mut chars = text.chars();
    let unit = chars.next_back()?.to_ascii_lowercase();
    let signed = chars.as_str();
    let (negative, magnitude) = match signed.as_bytes().first() {
        Some(b'-') => (true, &signed[1..]),
        Some(b'+') => (false, &signed[1..]),
        _ => (false, signed),
    };
    if magnitude.is_empty() || !magnitude.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let magnitude: i64 = magnitude.parse().ok()?;
    let unit_seconds = match unit {
        's' => 1,
        'm' => SECONDS_PER_MINUTE,
        'h' => SECONDS_PER_HOUR,
        'j' => SECONDS_PER_DAY,
        _ => return None,
    };
    let offset = magnitude.checked_mul(unit_seconds)?;
    let offset = if negative { -offset } else { offset };
    now.timestamp().checked_sub(offset)
}
