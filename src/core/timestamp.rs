// Conversions between `OffsetDateTime` and the stored microsecond column.
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;

use crate::core::error::{Error, ErrorKind};

const NANOS_PER_MICRO: i128 = 1_000;

/// Microseconds since the Unix epoch, rounded down. Used for stored values.
pub fn to_micros(ts: OffsetDateTime) -> Result<i64, Error> {
    let micros = ts.unix_timestamp_nanos().div_euclid(NANOS_PER_MICRO);
    narrow(micros)
}

/// Microseconds since the Unix epoch, rounded up.
///
/// A stored value `m` satisfies `m >= bound_micros(t)` exactly when the instant
/// it encodes is `>= t`, so range bounds keep their half-open meaning even when
/// the caller passes sub-microsecond instants.
pub fn bound_micros(ts: OffsetDateTime) -> Result<i64, Error> {
    let micros = -(-ts.unix_timestamp_nanos()).div_euclid(NANOS_PER_MICRO);
    narrow(micros)
}

pub fn from_micros(micros: i64) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::from_unix_timestamp_nanos(micros as i128 * NANOS_PER_MICRO).map_err(|err| {
        Error::new(ErrorKind::Storage)
            .with_message("stored timestamp is out of range")
            .with_source(err)
    })
}

pub fn format_rfc3339(ts: OffsetDateTime) -> Result<String, Error> {
    ts.format(&Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Internal)
            .with_message("timestamp format failed")
            .with_source(err)
    })
}

pub fn parse_rfc3339(text: &str) -> Result<OffsetDateTime, Error> {
    OffsetDateTime::parse(text.trim(), &Rfc3339).map_err(|err| {
        Error::new(ErrorKind::Usage)
            .with_message(format!("invalid RFC 3339 timestamp: {text}"))
            .with_hint("Use a timestamp like 2024-01-31T12:00:00Z.")
            .with_source(err)
    })
}

fn narrow(micros: i128) -> Result<i64, Error> {
    i64::try_from(micros)
        .map_err(|_| Error::new(ErrorKind::Usage).with_message("timestamp is out of range"))
}
