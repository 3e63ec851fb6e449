use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, TimeZone, Utc};

/// Format the backend writes for datetime fields.
const BACKEND_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3fZ";
const BACKEND_PARSE_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.fZ";

/// Parse a backend datetime string.
///
/// The hosted backend emits `2024-03-01 08:30:00.000Z`; RFC 3339 and bare
/// `YYYY-MM-DD` dates are accepted as well (the latter at midnight UTC).
pub fn parse_datetime(raw: &str) -> Result<DateTime<Utc>, chrono::ParseError> {
    let raw = raw.trim();
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    match NaiveDateTime::parse_from_str(raw, BACKEND_PARSE_FORMAT) {
        Ok(naive) => Ok(Utc.from_utc_datetime(&naive)),
        Err(err) => match NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
            Ok(date) => Ok(Utc.from_utc_datetime(&date.and_time(NaiveTime::default()))),
            Err(_) => Err(err),
        },
    }
}

pub fn format_datetime(value: &DateTime<Utc>) -> String {
    value.format(BACKEND_FORMAT).to_string()
}

/// Serde adapter for optional datetimes. Empty strings are `None`.
pub mod datetime_opt {
    use super::{format_datetime, parse_datetime};
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(value) => serializer.serialize_str(&format_datetime(value)),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_datetime(raw)
                .map(Some)
                .map_err(serde::de::Error::custom),
        }
    }
}

/// Serde adapter for optional calendar dates stored in datetime fields.
pub mod date_opt {
    use super::parse_datetime;
    use chrono::NaiveDate;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(date) => serializer.serialize_str(&format!("{} 00:00:00.000Z", date.format("%Y-%m-%d"))),
            None => serializer.serialize_str(""),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        match raw.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_datetime(raw)
                .map(|value| Some(value.date_naive()))
                .map_err(serde::de::Error::custom),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    #[test]
    fn parses_backend_format() {
        let parsed = parse_datetime("2024-03-01 08:30:00.000Z").unwrap();
        assert_eq!(parsed.hour(), 8);
        assert_eq!(parsed.minute(), 30);
        assert_eq!(format_datetime(&parsed), "2024-03-01 08:30:00.000Z");
    }

    #[test]
    fn parses_rfc3339_and_plain_dates() {
        let parsed = parse_datetime("2024-03-01T10:00:00+02:00").unwrap();
        assert_eq!(parsed.hour(), 8);

        let parsed = parse_datetime("2024-12-31").unwrap();
        assert_eq!(parsed.day(), 31);
        assert_eq!(parsed.hour(), 0);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_datetime("next tuesday").is_err());
    }
}
