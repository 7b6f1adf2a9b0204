use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::{
    common::ByteStr,
    ext::BytesExt,
    postgres::{Oid, ProtocolError, backend::RowDescription},
};

/// One field of a RowDescription.
#[derive(Debug, Clone)]
pub struct FieldDescription {
    /// The field name.
    pub name: ByteStr,
    /// Table OID when the field is a column of a specific table,
    /// otherwise zero.
    pub table_oid: u32,
    /// Attribute number of the column when known, otherwise zero.
    pub column_attr: i16,
    /// The object ID of the field's data type.
    pub type_oid: Oid,
    /// The data type size (see `pg_type.typlen`); negative values denote
    /// variable-width types.
    pub type_size: i16,
    /// The type modifier (see `pg_attribute.atttypmod`), type-specific.
    pub type_modifier: i32,
    /// Format code, text or binary. A description straight off the wire
    /// carries zero, since the statement variant of Describe does not know
    /// the format yet; a negotiated description carries the format each
    /// column is requested in.
    pub format_code: i16,
}

impl FieldDescription {
    fn decode(body: &mut Bytes) -> Result<Self, ProtocolError> {
        Ok(Self {
            name: body.get_cstr()?,
            table_oid: body.get_u32(),
            column_attr: body.get_i16(),
            type_oid: body.get_u32(),
            type_size: body.get_i16(),
            type_modifier: body.get_i32(),
            format_code: body.get_i16(),
        })
    }

    /// Decode the complete field list of a RowDescription.
    pub fn decode_vec(rd: &RowDescription) -> Result<Vec<FieldDescription>, ProtocolError> {
        let mut body = rd.body.clone();
        let mut fields = Vec::with_capacity(rd.field_len as usize);
        for _ in 0..rd.field_len {
            fields.push(Self::decode(&mut body)?);
        }
        Ok(fields)
    }

    /// [`FieldDescription::decode_vec`] as a shared slice.
    pub fn decode_all(rd: &RowDescription) -> Result<Arc<[FieldDescription]>, ProtocolError> {
        Ok(Self::decode_vec(rd)?.into())
    }
}

/// Looks up a column position by ordinal or by field name.
pub trait Index {
    fn position(&self, cols: &[FieldDescription]) -> Option<usize>;
}

impl Index for usize {
    fn position(&self, cols: &[FieldDescription]) -> Option<usize> {
        (*self < cols.len()).then_some(*self)
    }
}

impl Index for &str {
    fn position(&self, cols: &[FieldDescription]) -> Option<usize> {
        cols.iter().position(|c| c.name == **self)
    }
}
