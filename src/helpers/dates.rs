//! Loose date parsing for scraped metadata

use chrono::{DateTime, NaiveDate, NaiveDateTime};

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%d %H:%M",
    "%d.%m.%Y %H:%M",
];

const DATE_FORMATS: &[&str] = &[
    "%Y-%m-%d",
    "%Y/%m/%d",
    "%d.%m.%Y",
    "%d/%m/%Y",
    "%d %B %Y",
    "%d %b %Y",
    "%B %d, %Y",
    "%b %d, %Y",
    "%Y%m%d",
];

/// Converts a scraped date string into ISO 8601
///
/// Timestamps with an offset keep it (RFC 3339), naive timestamps render as
/// `YYYY-MM-DDTHH:MM:SS` and plain dates as `YYYY-MM-DD`. Returns `None`
/// for anything unrecognised.
///
/// ```
/// use sumi_pipeline::helpers::dates::iso_date;
///
/// assert_eq!(iso_date("3 March 2021").as_deref(), Some("2021-03-03"));
/// assert_eq!(iso_date("not a date"), None);
/// ```
pub fn iso_date(value: &str) -> Option<String> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(value) {
        return Some(parsed.to_rfc3339());
    }
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        return Some(parsed.to_rfc3339());
    }
    for format in DATETIME_FORMATS {
        if let Ok(parsed) = NaiveDateTime::parse_from_str(value, format) {
            return Some(parsed.format("%Y-%m-%dT%H:%M:%S").to_string());
        }
    }
    DATE_FORMATS
        .iter()
        .find_map(|format| NaiveDate::parse_from_str(value, format).ok())
        .map(|date| date.format("%Y-%m-%d").to_string())
}
