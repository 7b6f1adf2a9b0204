use bytes::{Buf, BufMut, Bytes};

use crate::common::ByteStr;
use crate::postgres::ProtocolError;

/// Length narrowing for wire fields.
///
/// Postgres counts in `Int16`/`Int32`; rust lengths are `usize`. Panic on
/// overflow instead of silently wrapping.
pub trait UsizeExt {
    fn to_i16(self) -> i16;
    fn to_i32(self) -> i32;
}

impl UsizeExt for usize {
    fn to_i16(self) -> i16 {
        self.try_into().expect("length does not fit in a protocol Int16")
    }

    fn to_i32(self) -> i32 {
        self.try_into().expect("length does not fit in a protocol Int32")
    }
}

pub trait StrExt {
    /// Wire size of this str encoded as a NUL terminated protocol String.
    fn cstr_len(&self) -> i32;
}

impl StrExt for str {
    fn cstr_len(&self) -> i32 {
        self.len().to_i32() + 1
    }
}

pub trait BufMutExt {
    /// Write a NUL terminated protocol String.
    fn put_cstr(&mut self, string: &str);
}

impl<B: BufMut> BufMutExt for B {
    fn put_cstr(&mut self, string: &str) {
        self.put_slice(string.as_bytes());
        self.put_u8(b'\0');
    }
}

pub trait BytesExt {
    /// Split off the bytes up to the next NUL and consume the terminator.
    fn get_cstr_bytes(&mut self) -> Result<Bytes, ProtocolError>;

    /// [`BytesExt::get_cstr_bytes`] validated as UTF-8.
    fn get_cstr(&mut self) -> Result<ByteStr, ProtocolError>;
}

impl BytesExt for Bytes {
    fn get_cstr_bytes(&mut self) -> Result<Bytes, ProtocolError> {
        let Some(end) = self.iter().position(|b| *b == b'\0') else {
            return Err(ProtocolError::missing_nul());
        };
        let head = self.split_to(end);
        self.advance(1);
        Ok(head)
    }

    fn get_cstr(&mut self) -> Result<ByteStr, ProtocolError> {
        ByteStr::from_utf8(self.get_cstr_bytes()?).map_err(ProtocolError::non_utf8)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn cstr_roundtrip() {
        let mut buf = Vec::new();
        buf.put_cstr("search_path");
        buf.put_cstr("");
        let mut bytes = Bytes::from(buf);
        assert_eq!(bytes.get_cstr().unwrap(), "search_path");
        assert_eq!(bytes.get_cstr().unwrap(), "");
        assert!(bytes.is_empty());
    }

    #[test]
    fn cstr_missing_terminator() {
        let mut bytes = Bytes::from_static(b"oops");
        assert!(bytes.get_cstr().is_err());
    }
}
