//! The buffer pool & channel reader, plus the write-side buffer used
//! by the response encoder.
use std::collections::VecDeque;
use std::io;
use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::{Buf, Bytes};
use tokio::io::{AsyncRead, ReadBuf};

/// Default number of fixed buffers in the pool.
pub(crate) const BUF_COUNT: usize = 5;
/// Default capacity of each pooled buffer.
pub(crate) const BUF_SIZE: usize = 16 * 1024;

/// A resumable, demand-driven reader over a socket-like source: it never
/// has more than [`BUF_COUNT`] buffers' worth of unconsumed bytes
/// outstanding, issues at most one read at a time, and hands completed
/// reads to callers strictly in wire order.
///
/// The "pool" here is a credit counter rather than a literal ring of
/// preallocated buffers: `bytes::Bytes` is a refcounted view, not an arena
/// slot, so reuse is expressed as a bound on buffers-in-flight instead of
/// physical memory reuse. Every other observable invariant (FIFO order,
/// redeliver-on-partial-consume, no-read-without-credit, idempotent
/// release) holds all the same.
pub(crate) struct Pool<T> {
    io: T,
    buf_size: usize,
    total_credits: usize,
    credits: usize,
    readable: VecDeque<Bytes>,
    eof: bool,
}

impl<T> Pool<T> {
    pub(crate) fn new(io: T) -> Self {
        Pool {
            io,
            buf_size: BUF_SIZE,
            total_credits: BUF_COUNT,
            credits: BUF_COUNT,
            readable: VecDeque::new(),
            eof: false,
        }
    }

    pub(crate) fn set_buf_size(&mut self, size: usize) {
        self.buf_size = size;
    }

    pub(crate) fn set_buf_count(&mut self, count: usize) {
        let delta = count.saturating_sub(self.total_credits);
        self.total_credits = count;
        self.credits += delta;
    }

    pub(crate) fn into_inner(self) -> T {
        self.io
    }

    pub(crate) fn get_mut(&mut self) -> &mut T {
        &mut self.io
    }

    fn release_credit(&mut self) {
        if self.credits < self.total_credits {
            self.credits += 1;
        }
    }
}

impl<T: AsyncRead + Unpin> Pool<T> {
    /// Issues at most one socket read, appending a filled buffer to
    /// `readable` (or setting `eof`) on completion. A no-op if there is
    /// already buffered data or no free credit to read into.
    fn poll_fill(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        if self.eof || self.credits == 0 {
            return Poll::Ready(Ok(()));
        }
        let mut raw = vec![0u8; self.buf_size];
        let mut buf = ReadBuf::new(&mut raw);
        match Pin::new(&mut self.io).poll_read(cx, &mut buf) {
            Poll::Ready(Ok(())) => {
                let n = buf.filled().len();
                if n == 0 {
                    self.eof = true;
                } else {
                    self.readable.push_back(Bytes::copy_from_slice(buf.filled()));
                    self.credits -= 1;
                }
                Poll::Ready(Ok(()))
            }
            Poll::Ready(Err(e)) => Poll::Ready(Err(e)),
            Poll::Pending => Poll::Pending,
        }
    }

    /// Pulls a single byte off the wire, in order. `Ok(None)` is the EOS
    /// sentinel: the stream ended with no more bytes available.
    pub(crate) fn poll_read_byte(&mut self, cx: &mut Context<'_>) -> Poll<io::Result<Option<u8>>> {
        loop {
            if let Some(front) = self.readable.front_mut() {
                if front.is_empty() {
                    self.readable.pop_front();
                    self.release_credit();
                    continue;
                }
                let b = front[0];
                front.advance(1);
                if front.is_empty() {
                    self.readable.pop_front();
                    self.release_credit();
                }
                return Poll::Ready(Ok(Some(b)));
            }
            if self.eof {
                return Poll::Ready(Ok(None));
            }
            ready!(self.poll_fill(cx))?;
            if self.readable.is_empty() && self.eof {
                return Poll::Ready(Ok(None));
            }
        }
    }

    /// Pulls up to `want` bytes off the wire as a single contiguous view.
    /// Returns an empty `Bytes` only at genuine end-of-stream.
    pub(crate) fn poll_read_mem(
        &mut self,
        cx: &mut Context<'_>,
        want: usize,
    ) -> Poll<io::Result<Bytes>> {
        loop {
            if let Some(front) = self.readable.front_mut() {
                let n = std::cmp::min(want, front.len());
                let out = front.split_to(n);
                if front.is_empty() {
                    self.readable.pop_front();
                    self.release_credit();
                }
                return Poll::Ready(Ok(out));
            }
            if self.eof {
                return Poll::Ready(Ok(Bytes::new()));
            }
            ready!(self.poll_fill(cx))?;
        }
    }
}

/// The source-abstraction the body decoder reads from; implemented
/// by [`Pool`] and type-erased (`Box<dyn MemRead + Send>`) when a body is
/// handed off to the application, so `Incoming` doesn't need to carry the
/// connection's transport type parameter.
pub(crate) trait MemRead {
    fn read_mem(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<Bytes>>;
}

impl<T: AsyncRead + Unpin> MemRead for Pool<T> {
    fn read_mem(&mut self, cx: &mut Context<'_>, len: usize) -> Poll<io::Result<Bytes>> {
        self.poll_read_mem(cx, len)
    }
}

/// A queue of not-yet-written output buffers. Each `buffer()` call enqueues
/// one encoder-produced chunk; the writer drains the queue one buffer at a
/// time so a single slow write can't let unbounded response data pile up in
/// memory.
pub(crate) struct WriteBuf<B> {
    queue: VecDeque<B>,
}

impl<B: Buf> WriteBuf<B> {
    pub(crate) fn new() -> Self {
        WriteBuf {
            queue: VecDeque::new(),
        }
    }

    pub(crate) fn buffer<I: Into<B>>(&mut self, buf: I) {
        let buf = buf.into();
        if buf.has_remaining() {
            self.queue.push_back(buf);
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.queue.iter().all(|b| !b.has_remaining())
    }

    pub(crate) fn len(&self) -> usize {
        self.queue.len()
    }

    /// Pops the front buffer if it has been fully written.
    pub(crate) fn pop_front_if_empty(&mut self) {
        while matches!(self.queue.front(), Some(b) if !b.has_remaining()) {
            self.queue.pop_front();
        }
    }

    pub(crate) fn front_mut(&mut self) -> Option<&mut B> {
        self.pop_front_if_empty();
        self.queue.front_mut()
    }
}

/// A `Buf` over an in-memory byte source, used to feed fixed-length bodies
/// into the encoder in tests and for internally-constructed responses.
#[derive(Debug)]
pub(crate) struct Cursor<T> {
    bytes: T,
    pos: usize,
}

impl<T: AsRef<[u8]>> Cursor<T> {
    pub(crate) fn new(bytes: T) -> Self {
        Cursor { bytes, pos: 0 }
    }
}

impl<T: AsRef<[u8]>> Buf for Cursor<T> {
    fn remaining(&self) -> usize {
        self.bytes.as_ref().len() - self.pos
    }

    fn chunk(&self) -> &[u8] {
        &self.bytes.as_ref()[self.pos..]
    }

    fn advance(&mut self, cnt: usize) {
        assert!(cnt <= self.remaining());
        self.pos += cnt;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::future::poll_fn;

    #[tokio::test]
    async fn read_byte_then_mem_respects_wire_order() {
        let data = &b"ABCDEFGHIJ"[..];
        let mut pool = Pool::new(data);
        pool.set_buf_size(4);

        let a = poll_fn(|cx| pool.poll_read_byte(cx)).await.unwrap();
        assert_eq!(a, Some(b'A'));

        let rest = poll_fn(|cx| pool.poll_read_mem(cx, 100)).await.unwrap();
        assert_eq!(&rest[..], b"BCD");
    }

    #[tokio::test]
    async fn read_mem_returns_empty_at_eof() {
        let data = &b""[..];
        let mut pool = Pool::new(data);
        let out = poll_fn(|cx| pool.poll_read_mem(cx, 10)).await.unwrap();
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn credits_are_bounded_by_buf_count() {
        // A reader that always has more data available; pulling a single
        // byte should never need more than one read ahead of demand once
        // the configured number of buffers is full.
        struct Infinite;
        impl AsyncRead for Infinite {
            fn poll_read(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                buf.put_slice(&[0u8; 8]);
                Poll::Ready(Ok(()))
            }
        }
        let mut pool = Pool::new(Infinite);
        pool.set_buf_count(2);
        for _ in 0..2 {
            poll_fn(|cx| pool.poll_fill(cx)).await.unwrap();
        }
        assert_eq!(pool.credits, 0);
        assert_eq!(pool.readable.len(), 2);
    }
}
