use bytes::Buf;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use super::{Decode, DecodeError};
use crate::{
    encode::{Encode, Encoded},
    postgres::{Oid, PgFormat, PgType, oid},
    row::Column,
    value::ValueRef,
};

/// Decode and encode a postgres `jsonb` value.
///
/// The binary representation is a one-byte version tag (currently 1)
/// followed by the json text; the text representation is the json text
/// alone.
///
/// # Panics
///
/// Encoding panics if the [`Serialize`] implementation fails.
#[derive(Debug)]
pub struct Json<T>(pub T);

impl<T> PgType for Json<T> {
    const OID: Oid = oid::JSONB;
}

impl<T> Decode for Json<T>
where
    T: DeserializeOwned,
{
    fn decode(col: Column) -> Result<Self, DecodeError> {
        if col.oid() != Self::OID {
            return Err(DecodeError::OidMismatch { expected: Self::OID, found: col.oid() });
        }
        let format = col.format();
        let mut value = col.into_value().ok_or(DecodeError::UnexpectedNull)?;
        if format == PgFormat::Binary && value.get_u8() != 1 {
            return Err(DecodeError::Malformed("unsupported jsonb version"));
        }
        Ok(Self(serde_json::from_slice(&value)?))
    }
}

impl<T: Serialize> Encode<'static> for Json<T> {
    fn encode(self) -> Encoded<'static> {
        let mut payload = vec![1u8];
        serde_json::to_writer(&mut payload, &self.0).expect("json serialization failed");
        Encoded::new(ValueRef::Bytes(payload.into()), Self::OID)
    }
}

impl<T: Serialize> Serialize for Json<T> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        self.0.serialize(serializer)
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Json<T> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        Ok(Self(T::deserialize(deserializer)?))
    }
}
