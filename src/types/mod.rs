//! Mapping between postgres types and rust values.
//!
//! Two surfaces share the same wire knowledge:
//!
//! - [`Decode`] for statically typed getters, `row.try_get::<_, i32>(0)`.
//! - [`TypeHandler`]/[`lookup`] for dynamically typed access by the column's
//!   declared OID, falling back to a text handler for OIDs this crate does
//!   not know.
//!
//! A handler advertises the format it prefers a column in; the Bind encoder
//! requests that format once a statement has been described. Values decode
//! in whichever format they were actually transmitted in, so the text
//! representation is always available as the common denominator.
//!
//! Integration with external types lives behind cargo features:
//! [`serde`]-backed [`Json`] (`json` feature) and the [`time`][::time]
//! datetime types (`time` feature).

use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    postgres::{Oid, PgFormat, PgType, oid},
    row::Column,
};

#[cfg(feature = "json")]
mod json;
#[cfg(feature = "json")]
pub use json::Json;

#[cfg(feature = "time")]
mod time;

/// Failure converting a column value into a rust value.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("cannot decode {found} as {expected}")]
    OidMismatch { expected: Oid, found: Oid },
    #[error("unexpected NULL")]
    UnexpectedNull,
    #[error("column index out of bounds")]
    ColumnIndexOutOfBounds,
    #[error("malformed value: {0}")]
    Malformed(&'static str),
    #[error("{0}")]
    NonUtf8(#[from] std::str::Utf8Error),
    #[cfg(feature = "json")]
    #[error("{0}")]
    Json(#[from] serde_json::Error),
    #[cfg(feature = "time")]
    #[error("{0}")]
    Time(#[from] ::time::error::Parse),
}

/// A rust value decodable from a column.
pub trait Decode: Sized {
    fn decode(col: Column) -> Result<Self, DecodeError>;
}

fn expect_oid(col: &Column, accept: &[Oid]) -> Result<(), DecodeError> {
    match accept.contains(&col.oid()) {
        true => Ok(()),
        false => Err(DecodeError::OidMismatch { expected: accept[0], found: col.oid() }),
    }
}

fn expect_value(col: Column) -> Result<Bytes, DecodeError> {
    col.into_value().ok_or(DecodeError::UnexpectedNull)
}

fn text_parse<T: std::str::FromStr>(value: &[u8], err: &'static str) -> Result<T, DecodeError> {
    std::str::from_utf8(value)?
        .trim()
        .parse()
        .map_err(|_| DecodeError::Malformed(err))
}

fn bool_text(value: &[u8]) -> Result<bool, DecodeError> {
    match value {
        b"t" => Ok(true),
        b"f" => Ok(false),
        _ => Err(DecodeError::Malformed("bool text is `t` or `f`")),
    }
}

/// The `\x`-prefixed hex form `bytea` is transmitted as in text format.
fn bytea_text(value: &[u8]) -> Result<Vec<u8>, DecodeError> {
    const MALFORMED: DecodeError = DecodeError::Malformed("bytea text is `\\x` followed by hex");

    let hex = std::str::from_utf8(value)?
        .strip_prefix("\\x")
        .ok_or(MALFORMED)?
        .as_bytes();
    if hex.len() % 2 != 0 {
        return Err(MALFORMED);
    }

    fn nibble(b: u8) -> Result<u8, DecodeError> {
        match b {
            b'0'..=b'9' => Ok(b - b'0'),
            b'a'..=b'f' => Ok(b - b'a' + 10),
            b'A'..=b'F' => Ok(b - b'A' + 10),
            _ => Err(MALFORMED),
        }
    }

    let mut out = Vec::with_capacity(hex.len() / 2);
    for pair in hex.chunks(2) {
        out.push((nibble(pair[0])? << 4) | nibble(pair[1])?);
    }
    Ok(out)
}

macro_rules! decode_number {
    ($($ty:ty: $width:literal, $err:literal;)*) => {$(
        impl Decode for $ty {
            fn decode(col: Column) -> Result<Self, DecodeError> {
                expect_oid(&col, &[<$ty as PgType>::OID])?;
                let format = col.format();
                let value = expect_value(col)?;
                match format {
                    PgFormat::Binary => {
                        if value.len() != $width {
                            return Err(DecodeError::Malformed(concat!(
                                "wrong width for ", stringify!($ty),
                            )));
                        }
                        Ok(<$ty>::from_be_bytes(value[..].try_into().unwrap()))
                    }
                    PgFormat::Text => text_parse(&value, $err),
                }
            }
        }
    )*};
}

decode_number! {
    i16: 2, "malformed int2 text";
    i32: 4, "malformed int4 text";
    i64: 8, "malformed int8 text";
    f32: 4, "malformed float4 text";
    f64: 8, "malformed float8 text";
}

impl Decode for bool {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        expect_oid(&col, &[oid::BOOL])?;
        let format = col.format();
        let value = expect_value(col)?;
        match format {
            PgFormat::Binary => match value.first() {
                Some(0) => Ok(false),
                Some(1) => Ok(true),
                _ => Err(DecodeError::Malformed("bool is one byte")),
            },
            PgFormat::Text => bool_text(&value),
        }
    }
}

impl Decode for String {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        expect_oid(&col, &[oid::TEXT, oid::VARCHAR])?;
        let value = expect_value(col)?;
        Ok(std::str::from_utf8(&value)?.to_owned())
    }
}

impl Decode for ByteStr {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        expect_oid(&col, &[oid::TEXT, oid::VARCHAR])?;
        Ok(ByteStr::from_utf8(expect_value(col)?)?)
    }
}

impl Decode for Vec<u8> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        expect_oid(&col, &[oid::BYTEA])?;
        let format = col.format();
        let value = expect_value(col)?;
        match format {
            PgFormat::Binary => Ok(value.to_vec()),
            PgFormat::Text => bytea_text(&value),
        }
    }
}

impl<T: Decode> Decode for Option<T> {
    fn decode(col: Column) -> Result<Self, DecodeError> {
        match col.is_null() {
            true => Ok(None),
            false => T::decode(col).map(Some),
        }
    }
}

/// A dynamically typed column value.
#[derive(Debug, Clone, PartialEq)]
pub enum PgValue {
    Null,
    Bool(bool),
    Int2(i16),
    Int4(i32),
    Int8(i64),
    Float4(f32),
    Float8(f64),
    Text(ByteStr),
    Bytea(Bytes),
}

/// Per-OID wire codec, the pluggable leaf of the result path.
///
/// The Bind encoder asks the handler which format to request a column in;
/// the row reader picks a handler by the column's type OID and hands it the
/// payload in whatever format it was transmitted in.
pub trait TypeHandler: Send + Sync {
    /// Name of the postgres type, for diagnostics.
    fn name(&self) -> &'static str;

    /// The wire format to request columns of this type in.
    fn format(&self) -> PgFormat;

    /// Decode a value transmitted in `format`; `None` is NULL.
    fn decode(&self, format: PgFormat, value: Option<Bytes>) -> Result<PgValue, DecodeError>;
}

macro_rules! number_handler {
    ($handler:ident, $name:literal, $variant:ident, $get:ident, $err:literal) => {
        struct $handler;

        impl TypeHandler for $handler {
            fn name(&self) -> &'static str {
                $name
            }

            fn format(&self) -> PgFormat {
                PgFormat::Binary
            }

            fn decode(
                &self,
                format: PgFormat,
                value: Option<Bytes>,
            ) -> Result<PgValue, DecodeError> {
                let Some(mut value) = value else {
                    return Ok(PgValue::Null);
                };
                match format {
                    PgFormat::Binary => Ok(PgValue::$variant(value.$get())),
                    PgFormat::Text => Ok(PgValue::$variant(text_parse(&value, $err)?)),
                }
            }
        }
    };
}

number_handler!(Int2Handler, "int2", Int2, get_i16, "malformed int2 text");
number_handler!(Int4Handler, "int4", Int4, get_i32, "malformed int4 text");
number_handler!(Int8Handler, "int8", Int8, get_i64, "malformed int8 text");
number_handler!(Float4Handler, "float4", Float4, get_f32, "malformed float4 text");
number_handler!(Float8Handler, "float8", Float8, get_f64, "malformed float8 text");

struct BoolHandler;

impl TypeHandler for BoolHandler {
    fn name(&self) -> &'static str {
        "bool"
    }

    fn format(&self) -> PgFormat {
        PgFormat::Binary
    }

    fn decode(&self, format: PgFormat, value: Option<Bytes>) -> Result<PgValue, DecodeError> {
        let Some(value) = value else {
            return Ok(PgValue::Null);
        };
        match format {
            PgFormat::Binary => match value.first() {
                Some(0) => Ok(PgValue::Bool(false)),
                Some(1) => Ok(PgValue::Bool(true)),
                _ => Err(DecodeError::Malformed("bool is one byte")),
            },
            PgFormat::Text => Ok(PgValue::Bool(bool_text(&value)?)),
        }
    }
}

struct TextHandler;

impl TypeHandler for TextHandler {
    fn name(&self) -> &'static str {
        "text"
    }

    fn format(&self) -> PgFormat {
        PgFormat::Binary
    }

    // the binary representation of the text family is its text
    fn decode(&self, _format: PgFormat, value: Option<Bytes>) -> Result<PgValue, DecodeError> {
        let Some(value) = value else {
            return Ok(PgValue::Null);
        };
        Ok(PgValue::Text(ByteStr::from_utf8(value)?))
    }
}

struct ByteaHandler;

impl TypeHandler for ByteaHandler {
    fn name(&self) -> &'static str {
        "bytea"
    }

    fn format(&self) -> PgFormat {
        PgFormat::Binary
    }

    fn decode(&self, format: PgFormat, value: Option<Bytes>) -> Result<PgValue, DecodeError> {
        let Some(value) = value else {
            return Ok(PgValue::Null);
        };
        match format {
            PgFormat::Binary => Ok(PgValue::Bytea(value)),
            PgFormat::Text => Ok(PgValue::Bytea(bytea_text(&value)?.into())),
        }
    }
}

// Fallback for OIDs without a registered handler: have the column
// transmitted as text and expose it verbatim. There is no binary decoding
// for a type this crate does not know.
struct UnknownHandler;

impl TypeHandler for UnknownHandler {
    fn name(&self) -> &'static str {
        "unknown"
    }

    fn format(&self) -> PgFormat {
        PgFormat::Text
    }

    fn decode(&self, format: PgFormat, value: Option<Bytes>) -> Result<PgValue, DecodeError> {
        let Some(value) = value else {
            return Ok(PgValue::Null);
        };
        match format {
            PgFormat::Text => Ok(PgValue::Text(ByteStr::from_utf8(value)?)),
            PgFormat::Binary => Err(DecodeError::Malformed(
                "unregistered type transmitted in binary format",
            )),
        }
    }
}

/// Find the handler for a type OID, falling back to the text handler.
pub fn lookup(type_oid: Oid) -> &'static dyn TypeHandler {
    match type_oid {
        oid::BOOL => &BoolHandler,
        oid::INT2 => &Int2Handler,
        oid::INT4 => &Int4Handler,
        oid::INT8 => &Int8Handler,
        oid::FLOAT4 => &Float4Handler,
        oid::FLOAT8 => &Float8Handler,
        oid::TEXT | oid::VARCHAR => &TextHandler,
        oid::BYTEA => &ByteaHandler,
        _ => &UnknownHandler,
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn lookup_decodes_both_formats() {
        let handler = lookup(oid::INT4);
        let v = handler
            .decode(PgFormat::Binary, Some(Bytes::from_static(&[0, 0, 0, 8])))
            .unwrap();
        assert_eq!(v, PgValue::Int4(8));
        let v = handler
            .decode(PgFormat::Text, Some(Bytes::from_static(b"8")))
            .unwrap();
        assert_eq!(v, PgValue::Int4(8));
    }

    #[test]
    fn lookup_falls_back_to_text() {
        let handler = lookup(600); // point, unregistered
        assert_eq!(handler.name(), "unknown");
        assert_eq!(handler.format(), PgFormat::Text);
        let v = handler
            .decode(PgFormat::Text, Some(Bytes::from_static(b"(1,2)")))
            .unwrap();
        assert_eq!(v, PgValue::Text(ByteStr::from_static("(1,2)")));
        // an unregistered type has no binary decoding
        assert!(
            handler
                .decode(PgFormat::Binary, Some(Bytes::from_static(&[1, 2])))
                .is_err()
        );
    }

    #[test]
    fn null_decodes_to_null() {
        assert_eq!(
            lookup(oid::INT8).decode(PgFormat::Binary, None).unwrap(),
            PgValue::Null,
        );
    }

    #[test]
    fn bool_text_representation() {
        let v = lookup(oid::BOOL)
            .decode(PgFormat::Text, Some(Bytes::from_static(b"t")))
            .unwrap();
        assert_eq!(v, PgValue::Bool(true));
    }

    #[test]
    fn bytea_text_representation() {
        let v = lookup(oid::BYTEA)
            .decode(PgFormat::Text, Some(Bytes::from_static(b"\\x6869")))
            .unwrap();
        assert_eq!(v, PgValue::Bytea(Bytes::from_static(b"hi")));
        assert!(
            lookup(oid::BYTEA)
                .decode(PgFormat::Text, Some(Bytes::from_static(b"6869")))
                .is_err()
        );
    }
}
