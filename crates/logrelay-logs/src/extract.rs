use chrono::{DateTime, NaiveDateTime, Utc};
use regex::Regex;
use std::borrow::Cow;
use std::collections::BTreeMap;

use logrelay_types::{ConfigError, StructuredRecord};

const TIME_GROUP: &str = "time";
const MESSAGE_GROUP: &str = "message";

/// Pulls `time`, `message` and any other named groups out of a record
#[derive(Clone, Debug)]
pub struct Extractor {
    pattern: Regex,

    /// chrono format tried after RFC 3339
    time_format: String,
}

impl Extractor {
    pub fn new(pattern: &str, time_format: &str) -> Result<Self, ConfigError> {
        let pattern = Regex::new(pattern)?;

        for group in [TIME_GROUP, MESSAGE_GROUP] {
            if !pattern.capture_names().flatten().any(|name| name == group) {
                return Err(ConfigError::MissingGroup(group));
            }
        }

        Ok(Self {
            pattern,
            time_format: time_format.to_string(),
        })
    }

    /// Turn a reassembled record into its structured form
    ///
    /// Never fails: a record the pattern does not match comes back with
    /// `time = None` and the whole text as its message.
    pub fn extract(&self, text: String, line_count: usize) -> StructuredRecord {
        let extracted = self.pattern.captures(&text).map(|caps| {
            let time = caps
                .name(TIME_GROUP)
                .and_then(|m| self.parse_time(m.as_str()));

            let message = caps.name(MESSAGE_GROUP).map(|m| m.as_str().to_string());

            let labels: BTreeMap<String, String> = self
                .pattern
                .capture_names()
                .flatten()
                .filter(|name| *name != TIME_GROUP && *name != MESSAGE_GROUP)
                .filter_map(|name| caps.name(name).map(|m| (name.to_string(), m.as_str().to_string())))
                .collect();

            (time, message, labels)
        });

        let Some((time, message, labels)) = extracted else {
            return StructuredRecord::degraded(text, line_count);
        };

        StructuredRecord {
            time,
            // `message` group present but not taking part in the match
            message: message.unwrap_or(text),
            line_count,
            labels,
        }
    }

    /// Parse a captured timestamp, assuming UTC when it carries no offset
    pub fn parse_time(&self, raw: &str) -> Option<DateTime<Utc>> {
        let raw = raw.trim();
        if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
            return Some(ts.with_timezone(&Utc));
        }

        let normalized = normalize_fraction(raw);

        if let Ok(ts) = DateTime::parse_from_str(&normalized, &self.time_format) {
            return Some(ts.with_timezone(&Utc));
        }
        if let Ok(naive) = NaiveDateTime::parse_from_str(&normalized, &self.time_format) {
            return Some(naive.and_utc());
        }
        // `2024-01-01T10:00:00` against a space-separated format
        let spaced = normalized.replacen('T', " ", 1);
        NaiveDateTime::parse_from_str(&spaced, &self.time_format)
            .ok()
            .map(|naive| naive.and_utc())
    }
}

/// Rewrite Python-style `10:00:00,123` to `10:00:00.123`
///
/// Only a comma between the seconds and the fraction is touched; commas the
/// time format itself uses stay put.
fn normalize_fraction(raw: &str) -> Cow<'_, str> {
    let bytes = raw.as_bytes();
    let comma = (3..bytes.len().saturating_sub(1)).find(|&i| {
        bytes[i] == b','
            && bytes[i - 3] == b':'
            && bytes[i - 2].is_ascii_digit()
            && bytes[i - 1].is_ascii_digit()
            && bytes[i + 1].is_ascii_digit()
    });

    match comma {
        Some(i) => Cow::Owned(format!("{}.{}", &raw[..i], &raw[i + 1..])),
        None => Cow::Borrowed(raw),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const FORMAT: &str = "%Y-%m-%d %H:%M:%S%.f";

    fn extractor(pattern: &str) -> Extractor {
        Extractor::new(pattern, FORMAT).unwrap()
    }

    #[test]
    fn test_missing_group_rejected() {
        let err = Extractor::new(r"(?P<time>\S+)", FORMAT).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGroup("message")));

        let err = Extractor::new(r"(?P<message>.*)", FORMAT).unwrap_err();
        assert!(matches!(err, ConfigError::MissingGroup("time")));
    }

    #[test]
    fn test_extract_time_and_message() {
        let ex = extractor(r"(?s)^(?P<time>\S+ \S+) (?P<level>[A-Z]+) (?P<message>.*)$");
        let record = ex.extract("2024-01-01 10:00:00 ERROR boom\n  at main".to_string(), 2);

        assert_eq!(record.time, Some(Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap()));
        assert_eq!(record.message, "boom\n  at main");
        assert_eq!(record.line_count, 2);
        assert_eq!(record.labels.get("level").map(String::as_str), Some("ERROR"));
    }

    #[test]
    fn test_mismatch_degrades() {
        let ex = extractor(r"^(?P<time>\d{4}-\d{2}-\d{2}) (?P<message>.*)$");
        let record = ex.extract("no timestamp here".to_string(), 1);

        assert!(record.is_degraded());
        assert_eq!(record.message, "no timestamp here");
        assert!(record.labels.is_empty());
    }

    #[test]
    fn test_unparseable_time_keeps_message() {
        let ex = extractor(r"^(?P<time>\S+) (?P<message>.*)$");
        let record = ex.extract("yesterday something happened".to_string(), 1);

        assert_eq!(record.time, None);
        assert_eq!(record.message, "something happened");
    }

    #[test]
    fn test_parse_time_variants() {
        let ex = extractor(r"(?P<time>x)(?P<message>y)");
        let expected = Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap();

        assert_eq!(ex.parse_time("2024-01-15T10:30:00Z"), Some(expected));
        assert_eq!(ex.parse_time("2024-01-15T12:30:00+02:00"), Some(expected));
        assert_eq!(ex.parse_time("2024-01-15 10:30:00"), Some(expected));
        assert_eq!(ex.parse_time("2024-01-15T10:30:00"), Some(expected));

        let with_millis = ex.parse_time("2024-01-15 10:30:00,250").unwrap();
        assert_eq!(with_millis.timestamp_subsec_millis(), 250);
    }

    #[test]
    fn test_time_format_with_comma() {
        let ex = Extractor::new(r"(?P<time>x)(?P<message>y)", "%d %b, %Y %H:%M:%S%.f").unwrap();

        let parsed = ex.parse_time("15 Jan, 2024 10:30:00").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2024, 1, 15, 10, 30, 0).unwrap());

        let with_millis = ex.parse_time("15 Jan, 2024 10:30:00,125").unwrap();
        assert_eq!(with_millis.timestamp_subsec_millis(), 125);
    }

    #[test]
    fn test_normalize_fraction_only_touches_seconds() {
        assert_eq!(normalize_fraction("2024-01-15 10:30:00,250"), "2024-01-15 10:30:00.250");
        assert_eq!(normalize_fraction("15 Jan, 2024 10:30:00"), "15 Jan, 2024 10:30:00");
        assert_eq!(normalize_fraction("1,2"), "1,2");
    }
}
