//! HL7 `TS` decoding.

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

/// Decode an HL7 timestamp of the form `YYYYMMDD[HH[MM[SS]]]`.
///
/// Missing time components default to `00`. Anything after the leading run of digits
/// (fractional seconds, a `+ZZZZ` offset) is ignored and the value is read as UTC.
/// Returns `None` when fewer than eight digits are present or the date is not a real
/// calendar date.
pub fn parse_hl7_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    let digits_len = raw.bytes().take_while(u8::is_ascii_digit).count();
    if digits_len < 8 {
        return None;
    }
    let digits = &raw[..digits_len];

    let pair = |start: usize| -> u32 {
        digits
            .get(start..start + 2)
            .and_then(|s| s.parse().ok())
            .unwrap_or(0)
    };

    let year: i32 = digits[0..4].parse().ok()?;
    let month: u32 = digits[4..6].parse().ok()?;
    let day: u32 = digits[6..8].parse().ok()?;

    let naive = NaiveDate::from_ymd_opt(year, month, day)?.and_hms_opt(pair(8), pair(10), pair(12))?;
    Some(Utc.from_utc_datetime(&naive))
}
