//! Timestamp normalization. Every parser emits `YYYY-MM-DD HH:MM:SS`.

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Timelike, Utc};

pub const FORMAT: &str = "%Y-%m-%d %H:%M:%S";

pub fn format(dt: NaiveDateTime) -> String {
    dt.format(FORMAT).to_string()
}

/// Milliseconds since the Unix epoch, rendered in UTC.
pub fn from_epoch_millis(millis: i64) -> Option<String> {
    Utc.timestamp_millis_opt(millis).single().map(|dt| format(dt.naive_utc()))
}

/// RFC 2822 date as sent in `Date:` headers.
pub fn parse_http_date(text: &str) -> Option<DateTime<FixedOffset>> {
    DateTime::parse_from_rfc2822(text.trim()).ok()
}

/// Best-effort normalization of the timestamp spellings found in exports.
///
/// Zone names in `Tue Mar 15 10:20:31 EDT 2016` style dates are dropped; the
/// wall-clock time is kept as written.
pub fn normalize(text: &str) -> String {
    let text = text.trim();
    if text.is_empty() {
        return String::new();
    }
    if let Some(dt) = parse_http_date(text) {
        return format(dt.naive_local());
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return format(dt.naive_local());
    }
    for pattern in [FORMAT, "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S", "%d/%m/%Y %H:%M:%S"] {
        if let Ok(dt) = NaiveDateTime::parse_from_str(text, pattern) {
            return format(dt);
        }
    }
    let parts: Vec<&str> = text.split_whitespace().collect();
    if parts.len() == 6 {
        let zoneless = [parts[0], parts[1], parts[2], parts[3], parts[5]].join(" ");
        if let Ok(dt) = NaiveDateTime::parse_from_str(&zoneless, "%a %b %d %H:%M:%S %Y") {
            return format(dt);
        }
    }
    String::new()
}

/// `8:42:17 PM` or `20:42:17`.
pub fn parse_time_of_day(text: &str) -> Option<NaiveTime> {
    let text = text.trim();
    let upper = text.to_ascii_uppercase();
    if upper.ends_with("AM") || upper.ends_with("PM") {
        let (clock, meridiem) = upper.split_at(upper.len() - 2);
        let spaced = format!("{} {meridiem}", clock.trim());
        return NaiveTime::parse_from_str(&spaced, "%I:%M:%S %p").ok();
    }
    NaiveTime::parse_from_str(text, "%H:%M:%S").ok()
}

/// Pick the calendar day for a time-of-day-only log marker.
///
/// The `Date` header's own day wins when it parses. Otherwise the marker is
/// assumed to be from today, or from yesterday when its hour is later than
/// the current hour. This is approximate: logs older than one day get the
/// wrong date.
pub fn synthesize(time_of_day: &str, date_header: Option<&str>, now: NaiveDateTime) -> String {
    let Some(time) = parse_time_of_day(time_of_day) else {
        return String::new();
    };
    let day: NaiveDate = match date_header.and_then(parse_http_date) {
        Some(date) => date.date_naive(),
        None if time.hour() > now.hour() => now.date() - Duration::days(1),
        None => now.date(),
    };
    format(day.and_time(time))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn at(y: i32, m: u32, d: u32, h: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(y, m, d).unwrap().and_hms_opt(h, 0, 0).unwrap()
    }

    #[test]
    fn test_epoch_millis() {
        assert_eq!(from_epoch_millis(0).as_deref(), Some("1970-01-01 00:00:00"));
        assert_eq!(from_epoch_millis(1_300_000_000_123).as_deref(), Some("2011-03-13 07:06:40"));
    }

    #[test]
    fn test_normalize_variants() {
        assert_eq!(normalize("Tue, 15 Nov 1994 08:12:31 GMT"), "1994-11-15 08:12:31");
        assert_eq!(normalize("2016-03-15T10:20:31Z"), "2016-03-15 10:20:31");
        assert_eq!(normalize("2016-03-15 10:20:31"), "2016-03-15 10:20:31");
        assert_eq!(normalize("Tue Mar 15 10:20:31 EDT 2016"), "2016-03-15 10:20:31");
        assert_eq!(normalize("yesterday-ish"), "");
        assert_eq!(normalize("  "), "");
    }

    #[test]
    fn test_time_of_day() {
        assert_eq!(parse_time_of_day("8:42:17 PM"), NaiveTime::from_hms_opt(20, 42, 17));
        assert_eq!(parse_time_of_day("12:05:00 AM"), NaiveTime::from_hms_opt(0, 5, 0));
        assert_eq!(parse_time_of_day("08:42:17pm"), NaiveTime::from_hms_opt(20, 42, 17));
        assert_eq!(parse_time_of_day("20:42:17"), NaiveTime::from_hms_opt(20, 42, 17));
        assert!(parse_time_of_day("noon").is_none());
    }

    #[test]
    fn test_synthesize_uses_date_header_day() {
        let out = synthesize("8:42:17 PM", Some("Wed, 02 Mar 2011 20:42:18 GMT"), at(2020, 1, 1, 3));
        assert_eq!(out, "2011-03-02 20:42:17");
    }

    #[test]
    fn test_synthesize_same_day() {
        let out = synthesize("9:00:00 AM", None, at(2024, 5, 10, 14));
        assert_eq!(out, "2024-05-10 09:00:00");
    }

    #[test]
    fn test_synthesize_rolls_back_one_day() {
        let out = synthesize("11:30:00 PM", Some("garbage"), at(2024, 3, 1, 1));
        assert_eq!(out, "2024-02-29 23:30:00");
    }

    #[test]
    fn test_synthesize_bad_marker_time() {
        assert_eq!(synthesize("??", None, at(2024, 1, 1, 0)), "");
    }
}
