//! Buffered async-write queue
//!
//! Holds bytes that could not be pushed into the socket buffer in one go.
//! Buffers are flushed strictly front to back, so bytes reach the wire in
//! submission order even when every flush attempt is partial.

use std::collections::VecDeque;
use std::io;

use bytes::{Buf, Bytes};

/// FIFO queue of not-yet-flushed byte buffers for one connection.
#[derive(Debug, Default)]
pub struct WriteQueue {
    buffers: VecDeque<Bytes>,
    queued_bytes: usize,
}

impl WriteQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a buffer behind everything already queued.
    pub fn push(&mut self, buf: Bytes) {
        if buf.is_empty() {
            return;
        }
        self.queued_bytes += buf.len();
        self.buffers.push_back(buf);
    }

    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Number of queued buffers.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Total bytes waiting to be flushed.
    pub fn queued_bytes(&self) -> usize {
        self.queued_bytes
    }

    /// Drain queued buffers into `write`, a non-blocking write function such
    /// as `TcpStream::try_write`. Stops at the first `WouldBlock` or short
    /// write the socket cannot absorb; a partially written front buffer is
    /// advanced in place so the next flush resumes mid-buffer.
    ///
    /// Returns `Ok(true)` once the queue is fully drained.
    pub fn flush_with<F>(&mut self, mut write: F) -> io::Result<bool>
    where
        F: FnMut(&[u8]) -> io::Result<usize>,
    {
        while let Some(front) = self.buffers.front_mut() {
            match write(front.as_ref()) {
                Ok(0) => {
                    // Socket buffer accepts nothing right now; try again on
                    // the next writable event.
                    return Ok(false);
                }
                Ok(n) => {
                    self.queued_bytes -= n;
                    if n == front.len() {
                        self.buffers.pop_front();
                    } else {
                        front.advance(n);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    /// Take every queued buffer out, in order. Used when the connection is
    /// handed off so the receiver can resume the flush.
    pub fn take_all(&mut self) -> Vec<Bytes> {
        self.queued_bytes = 0;
        self.buffers.drain(..).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Write function that accepts at most `budget` bytes in total, then
    /// reports WouldBlock.
    fn capped_sink(budget: usize, out: &mut Vec<u8>) -> impl FnMut(&[u8]) -> io::Result<usize> + '_ {
        let mut remaining = budget;
        move |buf: &[u8]| {
            if remaining == 0 {
                return Err(io::Error::new(io::ErrorKind::WouldBlock, "full"));
            }
            let n = buf.len().min(remaining);
            out.extend_from_slice(&buf[..n]);
            remaining -= n;
            Ok(n)
        }
    }

    #[test]
    fn flush_preserves_submission_order() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"b1"));
        queue.push(Bytes::from_static(b"b2"));
        queue.push(Bytes::from_static(b"b3"));

        let mut wire = Vec::new();
        // Drip three bytes at a time until everything drains.
        let mut drained = false;
        while !drained {
            drained = queue.flush_with(capped_sink(3, &mut wire)).unwrap();
        }
        assert_eq!(wire, b"b1b2b3");
        assert!(queue.is_empty());
        assert_eq!(queue.queued_bytes(), 0);
    }

    #[test]
    fn partial_flush_leaves_remaining_buffers_untouched() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"first"));
        queue.push(Bytes::from_static(b"second"));
        queue.push(Bytes::from_static(b"third"));

        // Peer accepts exactly the first buffer's worth of bytes.
        let mut wire = Vec::new();
        let drained = queue.flush_with(capped_sink(5, &mut wire)).unwrap();

        assert!(!drained);
        assert_eq!(wire, b"first");
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.queued_bytes(), "second".len() + "third".len());
    }

    #[test]
    fn partial_front_buffer_resumes_mid_buffer() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"abcdef"));

        let mut wire = Vec::new();
        assert!(!queue.flush_with(capped_sink(4, &mut wire)).unwrap());
        assert_eq!(wire, b"abcd");
        assert_eq!(queue.queued_bytes(), 2);

        assert!(queue.flush_with(capped_sink(16, &mut wire)).unwrap());
        assert_eq!(wire, b"abcdef");
    }

    #[test]
    fn io_errors_propagate() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::from_static(b"data"));

        let result = queue.flush_with(|_| Err(io::Error::new(io::ErrorKind::BrokenPipe, "gone")));
        assert_eq!(result.unwrap_err().kind(), io::ErrorKind::BrokenPipe);
    }

    #[test]
    fn empty_buffers_are_ignored() {
        let mut queue = WriteQueue::new();
        queue.push(Bytes::new());
        assert!(queue.is_empty());
    }
}
