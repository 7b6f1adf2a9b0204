//! Binding rust values as statement parameters.
use crate::{
    postgres::{Oid, PgFormat, PgType},
    value::ValueRef,
};

/// A value that can be bound to a statement parameter.
///
/// Implementations pick the parameter's type OID and produce the wire
/// payload in the declared format.
pub trait Encode<'q> {
    fn encode(self) -> Encoded<'q>;
}

/// The Bind message's view of one parameter value.
///
/// The value is framed as an `Int32` length followed by that many bytes;
/// length -1 is NULL and no bytes follow.
pub trait BindValue {
    fn wire_len(&self) -> i32;
    fn as_slice(&self) -> &[u8];
}

impl BindValue for Encoded<'_> {
    fn wire_len(&self) -> i32 {
        Encoded::wire_len(self)
    }

    fn as_slice(&self) -> &[u8] {
        Encoded::as_slice(self)
    }
}

/// A parameter value encoded for the Bind message.
#[derive(Debug)]
pub struct Encoded<'q> {
    value: ValueRef<'q>,
    oid: Oid,
    format: PgFormat,
    is_null: bool,
}

impl<'q> Encoded<'q> {
    pub(crate) fn new(value: ValueRef<'q>, oid: Oid) -> Self {
        Self { value, oid, format: PgFormat::Binary, is_null: false }
    }

    pub(crate) fn null(oid: Oid) -> Encoded<'static> {
        Encoded {
            value: ValueRef::Bytes(bytes::Bytes::new()),
            oid,
            format: PgFormat::Binary,
            is_null: true,
        }
    }

    /// The parameter's type OID as sent in Parse.
    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// The transmission format declared in Bind.
    pub fn format(&self) -> PgFormat {
        self.format
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    /// The `Int32` length framing this value: -1 for NULL.
    pub fn wire_len(&self) -> i32 {
        match self.is_null {
            true => -1,
            false => self.value.len().try_into().expect("parameter value too large"),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        match self.is_null {
            true => &[],
            false => self.value.as_slice(),
        }
    }

    /// Deep copy for statement cloning; cheap for shared payloads.
    pub fn to_owned(&self) -> Encoded<'static> {
        Encoded {
            value: self.value.to_owned(),
            oid: self.oid,
            format: self.format,
            is_null: self.is_null,
        }
    }
}

macro_rules! encode_be {
    ($($ty:ty),*) => {$(
        impl Encode<'static> for $ty {
            fn encode(self) -> Encoded<'static> {
                Encoded::new(ValueRef::inline(&self.to_be_bytes()), <$ty as PgType>::OID)
            }
        }
    )*};
}

encode_be!(i16, i32, i64, f32, f64);

impl Encode<'static> for bool {
    fn encode(self) -> Encoded<'static> {
        Encoded::new(ValueRef::inline(&[self as u8]), bool::OID)
    }
}

impl<'q> Encode<'q> for &'q str {
    fn encode(self) -> Encoded<'q> {
        Encoded::new(ValueRef::Slice(self.as_bytes()), str::OID)
    }
}

impl Encode<'static> for String {
    fn encode(self) -> Encoded<'static> {
        Encoded::new(ValueRef::Bytes(self.into_bytes().into()), String::OID)
    }
}

impl<'q> Encode<'q> for &'q String {
    fn encode(self) -> Encoded<'q> {
        Encoded::new(ValueRef::Slice(self.as_bytes()), String::OID)
    }
}

impl<'q> Encode<'q> for &'q [u8] {
    fn encode(self) -> Encoded<'q> {
        Encoded::new(ValueRef::Slice(self), <[u8]>::OID)
    }
}

impl Encode<'static> for Vec<u8> {
    fn encode(self) -> Encoded<'static> {
        Encoded::new(ValueRef::Bytes(self.into()), Vec::<u8>::OID)
    }
}

impl<'q, T> Encode<'q> for Option<T>
where
    T: Encode<'q> + PgType,
{
    fn encode(self) -> Encoded<'q> {
        match self {
            Some(value) => value.encode(),
            None => Encoded::null(T::OID),
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::postgres::oid;

    #[test]
    fn primitives_bind_binary_network_order() {
        let e = 0x01020304i32.encode();
        assert_eq!(e.oid(), oid::INT4);
        assert_eq!(e.as_slice(), [1, 2, 3, 4]);
        assert_eq!(e.wire_len(), 4);
        assert_eq!(e.format(), PgFormat::Binary);
    }

    #[test]
    fn null_has_no_payload() {
        let e = Option::<i64>::None.encode();
        assert!(e.is_null());
        assert_eq!(e.wire_len(), -1);
        assert_eq!(e.oid(), oid::INT8);
        assert!(e.as_slice().is_empty());
    }

    #[test]
    fn text_binds_utf8() {
        let e = "héllo".encode();
        assert_eq!(e.oid(), oid::TEXT);
        assert_eq!(e.as_slice(), "héllo".as_bytes());
    }
}
