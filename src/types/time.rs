use ::time::{
    Duration, OffsetDateTime, PrimitiveDateTime,
    format_description::{BorrowedFormatItem as I, Component as C, modifier},
    macros::datetime,
};
use bytes::Buf;

use super::{Decode, DecodeError};
use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgFormat, PgType, oid},
    row::Column,
    value::ValueRef,
};

/// `timestamptz`
const TIMESTAMPTZ: Oid = 1184;

/// Postgres timestamps count microseconds from 2000-01-01 in binary format.
const PG_EPOCH: PrimitiveDateTime = datetime!(2000-01-01 0:00);
const PG_EPOCH_UTC: OffsetDateTime = datetime!(2000-01-01 0:00 UTC);

impl PgType for PrimitiveDateTime {
    const OID: Oid = oid::TIMESTAMP;
}

impl PgType for OffsetDateTime {
    const OID: Oid = TIMESTAMPTZ;
}

impl Decode for PrimitiveDateTime {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if col.oid() != Self::OID {
            return Err(DecodeError::OidMismatch { expected: Self::OID, found: col.oid() });
        }
        let format = col.format();
        let mut value = col.into_value().ok_or(DecodeError::UnexpectedNull)?;
        match format {
            PgFormat::Binary => {
                let micros = value.get_i64();
                Ok(PG_EPOCH + Duration::microseconds(micros))
            }
            PgFormat::Text => {
                let text = std::str::from_utf8(&value)?;
                Ok(PrimitiveDateTime::parse(text, &DESCRIPTION)?)
            }
        }
    }
}

impl Decode for OffsetDateTime {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if col.oid() != Self::OID {
            return Err(DecodeError::OidMismatch { expected: Self::OID, found: col.oid() });
        }
        let format = col.format();
        let mut value = col.into_value().ok_or(DecodeError::UnexpectedNull)?;
        match format {
            PgFormat::Binary => {
                let micros = value.get_i64();
                Ok(PG_EPOCH_UTC + Duration::microseconds(micros))
            }
            PgFormat::Text => {
                let text = std::str::from_utf8(&value)?;
                Ok(OffsetDateTime::parse(text, &DESCRIPTION_TZ)?)
            }
        }
    }
}

impl Encode<'static> for PrimitiveDateTime {
    fn encode(self) -> Encoded<'static> {
        let micros = (self - PG_EPOCH).whole_microseconds() as i64;
        Encoded::new(ValueRef::inline(&micros.to_be_bytes()), Self::OID)
    }
}

impl Encode<'static> for OffsetDateTime {
    fn encode(self) -> Encoded<'static> {
        let micros = (self - PG_EPOCH_UTC).whole_microseconds() as i64;
        Encoded::new(ValueRef::inline(&micros.to_be_bytes()), Self::OID)
    }
}

/// `2026-08-02 12:30:00` with subseconds only when non-zero, the way the
/// server prints `timestamp` under the default DateStyle.
const DATE_TIME: &[I<'_>] = &[
    I::Component(C::Year(modifier::Year::default())),
    I::Literal(b"-"),
    I::Component(C::Month(modifier::Month::default())),
    I::Literal(b"-"),
    I::Component(C::Day(modifier::Day::default())),
    I::Literal(b" "),
    I::Component(C::Hour(modifier::Hour::default())),
    I::Literal(b":"),
    I::Component(C::Minute(modifier::Minute::default())),
    I::Literal(b":"),
    I::Component(C::Second(modifier::Second::default())),
    I::Optional(&I::Compound(SUBSECOND)),
];

const SUBSECOND: &[I<'_>] = &[
    I::Literal(b"."),
    I::Component(C::Subsecond(modifier::Subsecond::default())),
];

const DESCRIPTION: &[I<'_>] = DATE_TIME;

/// `timestamptz` text carries a trailing offset, `+00` under a UTC
/// TimeZone setting, with minutes only for non-integral offsets.
const DESCRIPTION_TZ: &[I<'_>] = &[
    I::Compound(DATE_TIME),
    I::Component(C::OffsetHour(modifier::OffsetHour::default())),
    I::Optional(&I::Compound(OFFSET_MINUTE)),
];

const OFFSET_MINUTE: &[I<'_>] = &[
    I::Literal(b":"),
    I::Component(C::OffsetMinute(modifier::OffsetMinute::default())),
];
