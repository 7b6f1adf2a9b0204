//! One materialized result row.
use std::sync::Arc;

use bytes::{Buf, Bytes};

use crate::{
    column::{FieldDescription, Index},
    postgres::{PgFormat, backend::DataRow},
    types::{Decode, DecodeError},
};

/// A row of the current result, decoded lazily.
///
/// The DataRow body stays in one shared buffer; walking to a column slices
/// its value out without copying.
pub struct Row {
    cols: Arc<[FieldDescription]>,
    column_len: i16,
    values: Bytes,
}

impl Row {
    pub(crate) fn new(cols: Arc<[FieldDescription]>, dr: DataRow) -> Self {
        Self {
            cols,
            column_len: dr.column_len,
            values: dr.body,
        }
    }

    /// Number of columns in the row.
    pub fn len(&self) -> usize {
        self.column_len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.column_len == 0
    }

    /// The column metadata this row was described with.
    pub fn columns(&self) -> &[FieldDescription] {
        &self.cols
    }

    /// Walk the value region to the `nth` column.
    ///
    /// `None` is a SQL NULL, framed as length -1 on the wire.
    fn raw(&self, nth: usize) -> Option<Bytes> {
        let mut values = self.values.clone();
        let mut i = 0;
        loop {
            let len = values.get_i32();
            let value = match len {
                -1 => None,
                len => Some(values.split_to(len as usize)),
            };
            if i == nth {
                return value;
            }
            i += 1;
        }
    }

    /// Get and decode a column by ordinal or name.
    pub fn try_get<I: Index, D: Decode>(&self, idx: I) -> Result<D, DecodeError> {
        let Some(nth) = idx.position(&self.cols) else {
            return Err(DecodeError::ColumnIndexOutOfBounds);
        };
        D::decode(Column {
            field: &self.cols[nth],
            value: self.raw(nth),
        })
    }

    /// Like [`Row::try_get`], panicking on decode failure.
    pub fn get<I: Index, D: Decode>(&self, idx: I) -> D {
        self.try_get(idx).expect("failed to decode column")
    }

    /// Decode a column dynamically through the handler registered for its
    /// type OID, honoring the format the column was transmitted in.
    pub fn try_value<I: Index>(&self, idx: I) -> Result<crate::types::PgValue, DecodeError> {
        let Some(nth) = idx.position(&self.cols) else {
            return Err(DecodeError::ColumnIndexOutOfBounds);
        };
        let field = &self.cols[nth];
        let handler = crate::types::lookup(field.type_oid);
        handler.decode(PgFormat::from_code(field.format_code), self.raw(nth))
    }
}

impl std::fmt::Debug for Row {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut dbg = f.debug_map();
        for (i, col) in self.cols.iter().enumerate() {
            dbg.entry(&col.name.as_str(), &self.raw(i));
        }
        dbg.finish()
    }
}

/// A single column handed to a [`Decode`] implementation.
pub struct Column<'r> {
    field: &'r FieldDescription,
    value: Option<Bytes>,
}

impl<'r> Column<'r> {
    pub(crate) fn new(field: &'r FieldDescription, value: Option<Bytes>) -> Self {
        Self { field, value }
    }

    pub fn name(&self) -> &str {
        &self.field.name
    }

    pub fn oid(&self) -> crate::postgres::Oid {
        self.field.type_oid
    }

    /// The format this column's value was transmitted in.
    pub fn format(&self) -> PgFormat {
        PgFormat::from_code(self.field.format_code)
    }

    pub fn field(&self) -> &FieldDescription {
        self.field
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }

    /// The raw wire payload; `None` for SQL NULL.
    pub fn into_value(self) -> Option<Bytes> {
        self.value
    }
}
