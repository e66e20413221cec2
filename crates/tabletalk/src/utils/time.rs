use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Result, bail};
use time::format_description::well_known::Rfc3339;
use time::{Date, Month, OffsetDateTime, UtcOffset};

const NANOS_PER_MILLI: i128 = 1_000_000;

#[must_use]
pub fn unix_timestamp_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

#[must_use]
pub fn now_utc_rfc3339() -> String {
    format_unix_ms(unix_timestamp_millis())
}

#[must_use]
pub fn format_unix_ms(timestamp_unix_ms: u64) -> String {
    let nanos = i128::from(timestamp_unix_ms)
        .checked_mul(NANOS_PER_MILLI)
        .unwrap_or(i128::MAX);
    let dt = OffsetDateTime::from_unix_timestamp_nanos(nanos)
        .unwrap_or(OffsetDateTime::UNIX_EPOCH)
        .to_offset(UtcOffset::UTC);
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}.{:03}Z",
        dt.year(),
        u8::from(dt.month()),
        dt.day(),
        dt.hour(),
        dt.minute(),
        dt.second(),
        dt.millisecond()
    )
}

pub fn parse_rfc3339_to_unix_ms(raw: &str) -> Result<u64> {
    let parsed = OffsetDateTime::parse(raw.trim(), &Rfc3339)?;
    let millis = parsed.unix_timestamp_nanos() / NANOS_PER_MILLI;
    u64::try_from(millis).map_err(|_| anyhow::anyhow!("timestamp precedes unix epoch: {raw}"))
}

/// Parses a `YYYY-MM-DD` literal into a calendar date, rejecting impossible days.
pub fn parse_calendar_date(raw: &str) -> Result<Date> {
    let mut parts = raw.trim().splitn(3, '-');
    let (Some(year), Some(month), Some(day)) = (parts.next(), parts.next(), parts.next()) else {
        bail!("date must look like YYYY-MM-DD: {raw}");
    };
    if year.len() != 4 || month.len() != 2 || day.len() != 2 {
        bail!("date must look like YYYY-MM-DD: {raw}");
    }
    let year = year.parse::<i32>()?;
    let month = Month::try_from(month.parse::<u8>()?)?;
    let day = day.parse::<u8>()?;
    Ok(Date::from_calendar_date(year, month, day)?)
}

#[must_use]
pub fn format_calendar_date(date: Date) -> String {
    format!(
        "{:04}-{:02}-{:02}",
        date.year(),
        u8::from(date.month()),
        date.day()
    )
}
