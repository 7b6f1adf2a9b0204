use std::{
    io,
    pin::Pin,
    task::{Context, Poll, ready},
};

use bytes::{BufMut, buf::UninitSlice};
use tokio::io::AsyncWrite;

/// Fixed-capacity outbound byte buffer.
///
/// Encoded bytes accumulate in `[start, end)`; [`WriteBuffer::poll_send`]
/// pushes that window to the socket. A short write advances `start` so the
/// next poll resumes from the first unsent byte, which is what makes
/// non-blocking partial sends restartable.
///
/// Primitive encoding goes through the [`BufMut`] impl over the spare
/// capacity; callers gate on [`WriteBuffer::space_left`] before encoding.
pub struct WriteBuffer {
    buf: Box<[u8]>,
    start: usize,
    end: usize,
    usable: usize,
}

impl WriteBuffer {
    pub fn new(size: usize) -> Self {
        Self {
            buf: vec![0u8; size].into_boxed_slice(),
            start: 0,
            end: 0,
            usable: size,
        }
    }

    pub fn size(&self) -> usize {
        self.buf.len()
    }

    pub fn usable_size(&self) -> usize {
        self.usable
    }

    /// Reserve framing headroom, see [`ReadBuffer::set_usable_size`][1].
    ///
    /// [1]: crate::io::ReadBuffer::set_usable_size
    pub fn set_usable_size(&mut self, usable: usize) {
        assert!(usable <= self.buf.len(), "usable size exceeds capacity");
        self.usable = usable;
    }

    pub fn reset_usable_size(&mut self) {
        self.usable = self.buf.len();
    }

    /// Room left for encoding.
    pub fn space_left(&self) -> usize {
        self.usable - self.end
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    /// Bytes written and not yet fully sent.
    pub fn pending(&self) -> usize {
        self.end - self.start
    }

    /// Drop everything buffered without sending.
    pub fn clear(&mut self) {
        self.start = 0;
        self.end = 0;
    }

    /// Flush `[start, end)` to the socket, resuming partial sends.
    ///
    /// Positions zero once everything buffered has been delivered.
    pub fn poll_send<W>(&mut self, writer: &mut W, cx: &mut Context<'_>) -> Poll<io::Result<()>>
    where
        W: AsyncWrite + Unpin,
    {
        while self.start < self.end {
            let n = ready!(Pin::new(&mut *writer).poll_write(cx, &self.buf[self.start..self.end]))?;
            if n == 0 {
                return Poll::Ready(Err(io::ErrorKind::WriteZero.into()));
            }
            self.start += n;
        }
        self.start = 0;
        self.end = 0;
        Poll::Ready(Ok(()))
    }
}

unsafe impl BufMut for WriteBuffer {
    fn remaining_mut(&self) -> usize {
        self.space_left()
    }

    unsafe fn advance_mut(&mut self, cnt: usize) {
        assert!(cnt <= self.space_left(), "advance past usable capacity");
        self.end += cnt;
    }

    fn chunk_mut(&mut self) -> &mut UninitSlice {
        let end = self.end;
        let usable = self.usable;
        UninitSlice::new(&mut self.buf[end..usable])
    }
}

impl std::fmt::Debug for WriteBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WriteBuffer")
            .field("size", &self.buf.len())
            .field("start", &self.start)
            .field("end", &self.end)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::ext::BufMutExt;
    use std::future::poll_fn;
    use tokio::io::AsyncReadExt;

    #[tokio::test]
    async fn sent_bytes_equal_written_bytes() {
        let (mut tx, mut rx) = tokio::io::duplex(256);
        let mut buf = WriteBuffer::new(64);

        buf.put_u8(b'Q');
        buf.put_i32(9);
        buf.put_cstr("Sync");
        let written = buf.pending();

        poll_fn(|cx| buf.poll_send(&mut tx, cx)).await.unwrap();
        assert!(buf.is_empty());
        assert_eq!(buf.start, 0);
        assert_eq!(buf.end, 0);

        let mut out = vec![0u8; written];
        rx.read_exact(&mut out).await.unwrap();
        assert_eq!(&out, &[b'Q', 0, 0, 0, 9, b'S', b'y', b'n', b'c', 0]);
    }

    #[tokio::test]
    async fn partial_send_resumes_from_start() {
        // a 4 byte pipe forces short writes
        let (mut tx, mut rx) = tokio::io::duplex(4);
        let mut buf = WriteBuffer::new(32);
        buf.put_slice(&[7u8; 16]);

        let reader = tokio::spawn(async move {
            let mut out = Vec::new();
            rx.read_to_end(&mut out).await.unwrap();
            out
        });

        poll_fn(|cx| buf.poll_send(&mut tx, cx)).await.unwrap();
        drop(tx);
        assert_eq!(reader.await.unwrap(), vec![7u8; 16]);
    }

    #[test]
    fn space_left_tracks_usable_window() {
        let mut buf = WriteBuffer::new(32);
        assert_eq!(buf.space_left(), 32);
        buf.put_i64(-1);
        assert_eq!(buf.space_left(), 24);
        buf.set_usable_size(16);
        assert_eq!(buf.space_left(), 8);
        buf.reset_usable_size();
        assert_eq!(buf.space_left(), 24);
    }

    #[test]
    fn primitive_round_trip() {
        use bytes::Buf;

        let mut buf = WriteBuffer::new(64);
        buf.put_i16(i16::MIN);
        buf.put_i32(i32::MAX);
        buf.put_i64(i64::MIN);
        buf.put_f32(1.25);
        buf.put_f64(-2.5);

        let mut bytes = &buf.buf[buf.start..buf.end];
        assert_eq!(bytes.get_i16(), i16::MIN);
        assert_eq!(bytes.get_i32(), i32::MAX);
        assert_eq!(bytes.get_i64(), i64::MIN);
        assert_eq!(bytes.get_f32(), 1.25);
        assert_eq!(bytes.get_f64(), -2.5);
    }
}
