use bytes::Bytes;

const INLINE_LEN: usize = 15;

/// A parameter payload in its wire representation.
///
/// Fixed-width binary values (integers, floats, bool) are byte-swapped into
/// the inline scratch area at bind time, so encoding a primitive never heap
/// allocates.
pub enum ValueRef<'a> {
    Slice(&'a [u8]),
    Inline { len: usize, data: [u8; INLINE_LEN] },
    Bytes(Bytes),
}

impl ValueRef<'_> {
    /// Stash a small value in the inline scratch area.
    pub fn inline(slice: &[u8]) -> ValueRef<'static> {
        let len = slice.len();
        assert!(len <= INLINE_LEN, "inline value too large");
        let mut data = [0u8; INLINE_LEN];
        data[..len].copy_from_slice(slice);
        ValueRef::Inline { len, data }
    }

    pub fn len(&self) -> usize {
        match self {
            ValueRef::Slice(slice) => slice.len(),
            ValueRef::Inline { len, .. } => *len,
            ValueRef::Bytes(bytes) => bytes.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        match self {
            ValueRef::Slice(slice) => slice,
            ValueRef::Inline { len, data } => &data[..*len],
            ValueRef::Bytes(bytes) => bytes,
        }
    }

    /// Detach into an owned payload, copying borrowed slices.
    pub fn to_owned(&self) -> ValueRef<'static> {
        match self {
            ValueRef::Slice(slice) => ValueRef::Bytes(Bytes::copy_from_slice(slice)),
            ValueRef::Inline { len, data } => ValueRef::Inline { len: *len, data: *data },
            ValueRef::Bytes(bytes) => ValueRef::Bytes(bytes.clone()),
        }
    }
}

impl std::fmt::Debug for ValueRef<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self.as_slice())
    }
}
