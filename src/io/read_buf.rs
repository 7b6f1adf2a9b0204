use std::{
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{Buf, Bytes, BytesMut};
use tokio::io::AsyncRead;

use crate::{Error, Result, error::ErrorKind};

/// Fixed-capacity inbound byte buffer over a socket.
///
/// Two logical regions: `[0, read_pos)` already consumed and
/// `[read_pos, filled)` available for decode. [`ReadBuffer::poll_ensure`]
/// pulls from the socket until the requested span is buffered, compacting
/// first when the span would not fit behind `read_pos`.
///
/// Primitive decoding goes through the [`Buf`] impl over the available
/// region, so the big-endian getters of `bytes` are the decoder surface.
pub struct ReadBuffer {
    buf: Box<[u8]>,
    read_pos: usize,
    filled: usize,
    usable: usize,
    /// In-progress oversized body, carried across polls.
    temp: Option<BytesMut>,
}

impl ReadBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            read_pos: 0,
            filled: 0,
            usable: size,
            temp: None,
        }
    }

    /// Physical capacity.
    pub fn size(&self) -> usize {
        self.buf.len()
    }

    /// Capacity currently usable for framing.
    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Reserve headroom: shrink the usable window below physical capacity.
    ///
    /// Used by bulk-copy framing which needs room for its own headers.
    pub fn set_usable_size(&mut self, usable: usize) {
        assert!(usable <= self.buf.len(), "usable size exceeds capacity");
        self.usable = usable;
    }

    pub fn reset_usable_size(&mut self) {
        self.usable = self.buf.len();
    }

    /// Bytes buffered and not yet consumed.
    pub fn bytes_left(&self) -> usize {
        self.filled - self.read_pos
    }

    /// Move `[read_pos, filled)` down to the front of the array.
    fn compact(&mut self) {
        self.buf.copy_within(self.read_pos..self.filled, 0);
        self.filled -= self.read_pos;
        self.read_pos = 0;
    }

    fn poll_read_some<R>(&mut self, reader: &mut R, cx: &mut Context<'_>) -> Poll<Result<()>>
    where
        R: AsyncRead + Unpin,
    {
        let mut dst = tokio::io::ReadBuf::new(&mut self.buf[self.filled..self.usable]);
        ready!(Pin::new(reader).poll_read(cx, &mut dst)).map_err(Error::from)?;
        let n = dst.filled().len();
        if n == 0 {
            return Poll::Ready(Err(ErrorKind::UnexpectedEof.into()));
        }
        self.filled += n;
        Poll::Ready(Ok(()))
    }

    /// Guarantee at least `count` bytes are available at `read_pos`.
    ///
    /// Fails with [`ErrorKind::UnexpectedEof`] if the peer closes first.
    /// `count` must not exceed the usable size; larger payloads go through
    /// [`ReadBuffer::poll_ensure_or_alloc`].
    pub fn poll_ensure<R>(
        &mut self,
        reader: &mut R,
        count: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<()>>
    where
        R: AsyncRead + Unpin,
    {
        debug_assert!(count <= self.usable, "span larger than the buffer");

        while self.bytes_left() < count {
            if self.read_pos + count > self.usable {
                self.compact();
            }
            ready!(self.poll_read_some(reader, cx))?;
        }

        Poll::Ready(Ok(()))
    }

    /// Like `poll_ensure`, but a `count` beyond the usable size detaches
    /// into a temporary allocation which is returned and consumed whole.
    ///
    /// The fixed buffer is left empty of the oversized span afterwards.
    pub fn poll_ensure_or_alloc<R>(
        &mut self,
        reader: &mut R,
        count: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Bytes>>
    where
        R: AsyncRead + Unpin,
    {
        if count <= self.usable {
            ready!(self.poll_ensure(reader, count, cx))?;
            return Poll::Ready(Ok(self.take_bytes(count)));
        }

        let mut temp = match self.temp.take() {
            Some(temp) => temp,
            None => {
                // seed the detached body with whatever is already buffered
                let mut temp = BytesMut::with_capacity(count);
                let grab = self.bytes_left().min(count);
                temp.extend_from_slice(&self.buf[self.read_pos..self.read_pos + grab]);
                self.read_pos += grab;
                temp
            }
        };

        while temp.len() < count {
            let remaining = count - temp.len();
            let mut dst = tokio::io::ReadBuf::uninit(&mut temp.spare_capacity_mut()[..remaining]);
            match Pin::new(&mut *reader).poll_read(cx, &mut dst) {
                Poll::Ready(res) => {
                    res.map_err(Error::from)?;
                    let n = dst.filled().len();
                    if n == 0 {
                        return Poll::Ready(Err(ErrorKind::UnexpectedEof.into()));
                    }
                    // SAFETY: `poll_read` initialized and filled `n` bytes
                    unsafe { temp.set_len(temp.len() + n) };
                }
                Poll::Pending => {
                    self.temp = Some(temp);
                    return Poll::Pending;
                }
            }
        }

        Poll::Ready(Ok(temp.freeze()))
    }

    /// Discard the next `count` bytes, reading through the socket as needed.
    pub fn poll_skip<R>(
        &mut self,
        reader: &mut R,
        count: usize,
        cx: &mut Context<'_>,
    ) -> Poll<Result<()>>
    where
        R: AsyncRead + Unpin,
    {
        let mut left = count;
        loop {
            let here = self.bytes_left().min(left);
            self.read_pos += here;
            left -= here;
            if left == 0 {
                return Poll::Ready(Ok(()));
            }
            if self.bytes_left() == 0 {
                self.read_pos = 0;
                self.filled = 0;
            }
            ready!(self.poll_read_some(reader, cx))?;
        }
    }

    /// Peek the message type byte without consuming.
    pub fn peek_u8(&self) -> u8 {
        self.buf[self.read_pos]
    }

    /// Peek a big-endian `Int32` at `offset` without consuming.
    pub fn peek_i32(&self, offset: usize) -> i32 {
        let at = self.read_pos + offset;
        i32::from_be_bytes(self.buf[at..at + 4].try_into().unwrap())
    }

    /// Detach `count` already-ensured bytes as an owned body.
    pub fn take_bytes(&mut self, count: usize) -> Bytes {
        debug_assert!(count <= self.bytes_left());
        let body = Bytes::copy_from_slice(&self.buf[self.read_pos..self.read_pos + count]);
        self.read_pos += count;
        if self.read_pos == self.filled {
            self.read_pos = 0;
            self.filled = 0;
        }
        body
    }

    /// Read a NUL terminated string; the terminator must already be buffered.
    pub fn read_cstr(&mut self) -> Result<String> {
        let region = &self.buf[self.read_pos..self.filled];
        let Some(end) = region.iter().position(|b| *b == b'\0') else {
            return Err(crate::postgres::ProtocolError::missing_nul().into());
        };
        let s = std::str::from_utf8(&region[..end])
            .map_err(crate::postgres::ProtocolError::non_utf8)?
            .to_owned();
        self.read_pos += end + 1;
        Ok(s)
    }
}

impl Buf for ReadBuffer {
    fn remaining(&self) -> usize {
        self.bytes_left()
    }

    fn chunk(&self) -> &[u8] {
        &self.buf[self.read_pos..self.filled]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.bytes_left(), "advance past filled region");
        self.read_pos += cnt;
    }
}

impl std::fmt::Debug for ReadBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadBuffer")
            .field("size", &self.buf.len())
            .field("read_pos", &self.read_pos)
            .field("filled", &self.filled)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::future::poll_fn;
    use tokio::io::AsyncWriteExt;

    async fn feed(data: &'static [u8]) -> impl AsyncRead + Unpin {
        let (mut tx, rx) = tokio::io::duplex(64);
        tx.write_all(data).await.unwrap();
        drop(tx);
        rx
    }

    #[tokio::test]
    async fn ensure_decodes_primitives() {
        let mut rx = feed(&[0x01, 0x02, 0x03, 0x04, 0xFF]).await;
        let mut buf = ReadBuffer::new(16);

        poll_fn(|cx| buf.poll_ensure(&mut rx, 5, cx)).await.unwrap();
        assert_eq!(buf.get_i32(), 0x01020304);
        assert_eq!(buf.get_u8(), 0xFF);
        assert_eq!(buf.bytes_left(), 0);
    }

    #[tokio::test]
    async fn ensure_compacts_when_span_would_overflow() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut buf = ReadBuffer::new(8);

        tx.write_all(&[1, 2, 3, 4, 5, 6]).await.unwrap();
        poll_fn(|cx| buf.poll_ensure(&mut rx, 6, cx)).await.unwrap();
        buf.advance(5);

        // one byte left at offset 5; a 4 byte span forces a compaction
        tx.write_all(&[7, 8, 9]).await.unwrap();
        poll_fn(|cx| buf.poll_ensure(&mut rx, 4, cx)).await.unwrap();
        assert_eq!(buf.chunk(), &[6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn oversized_span_detaches() {
        let (mut tx, mut rx) = tokio::io::duplex(64);
        let mut buf = ReadBuffer::new(8);

        tx.write_all(&[9; 20]).await.unwrap();
        let body = poll_fn(|cx| buf.poll_ensure_or_alloc(&mut rx, 20, cx))
            .await
            .unwrap();
        assert_eq!(&body[..], &[9; 20]);
        assert_eq!(buf.bytes_left(), 0);
    }

    #[tokio::test]
    async fn skip_crosses_capacity() {
        let mut rx = feed(&[0; 40]).await;
        let mut buf = ReadBuffer::new(8);
        poll_fn(|cx| buf.poll_skip(&mut rx, 40, cx)).await.unwrap();
        assert_eq!(buf.bytes_left(), 0);
    }

    #[tokio::test]
    async fn eof_mid_message() {
        let mut rx = feed(&[1, 2]).await;
        let mut buf = ReadBuffer::new(16);
        let err = poll_fn(|cx| buf.poll_ensure(&mut rx, 4, cx)).await.unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnexpectedEof));
    }

    #[tokio::test]
    async fn cstr_reads_to_terminator() {
        let mut rx = feed(b"hello\0rest").await;
        let mut buf = ReadBuffer::new(16);
        poll_fn(|cx| buf.poll_ensure(&mut rx, 10, cx)).await.unwrap();
        assert_eq!(buf.read_cstr().unwrap(), "hello");
        assert_eq!(buf.chunk(), b"rest");
    }

    #[tokio::test]
    async fn float_round_trip() {
        for v in [0.0f64, -1.5, f64::MAX, f64::MIN_POSITIVE] {
            let be = v.to_be_bytes();
            let (mut tx, mut rx) = tokio::io::duplex(16);
            tx.write_all(&be).await.unwrap();
            let mut buf = ReadBuffer::new(16);
            poll_fn(|cx| buf.poll_ensure(&mut rx, 8, cx)).await.unwrap();
            assert_eq!(buf.get_f64(), v);
        }
    }
}
