//! Duplex stream ports.
//!
//! A port is one connection as the relay sees it: an input buffer the reactor
//! fills from the socket, and an output buffer the reactor flushes to the
//! socket. The relay only moves bytes between buffers; it never touches the
//! socket itself.

use std::collections::VecDeque;

use bytes::BytesMut;

/// Scratch size used when moving bytes between two ports.
const MOVE_CHUNK: usize = 4096;

/// A byte-oriented connection with bounded input and output buffers.
pub trait DuplexPort {
    /// Bytes currently buffered on the input side.
    fn input_used(&self) -> usize;

    /// Free space remaining on the input side.
    fn input_free(&self) -> usize;

    /// Bytes currently waiting on the output side.
    fn output_used(&self) -> usize;

    /// Free space remaining on the output side.
    fn output_free(&self) -> usize;

    /// Copy up to `dst.len()` buffered input bytes without consuming them.
    fn peek_input(&self, dst: &mut [u8]) -> usize;

    /// Discard `n` bytes from the front of the input buffer.
    fn consume_input(&mut self, n: usize);

    /// Append as much of `src` as fits into the output buffer.
    ///
    /// Returns the number of bytes stored.
    fn store_into_output(&mut self, src: &[u8]) -> usize;

    /// Close the connection and release its buffers.
    fn close(&mut self);

    /// Whether `close` has been called or the peer went away.
    fn is_closed(&self) -> bool;

    /// Move up to `max` bytes from this port's input into `dest`'s output.
    ///
    /// Stops early when the input runs dry or the destination fills up.
    /// Returns the number of bytes moved; every moved byte is removed from
    /// this input exactly once and appended to the destination exactly once.
    fn move_input_to<D>(&mut self, dest: &mut D, max: usize) -> usize
    where
        D: DuplexPort + ?Sized,
        Self: Sized,
    {
        let mut scratch = [0u8; MOVE_CHUNK];
        let mut moved = 0;
        while moved < max {
            let want = (max - moved).min(MOVE_CHUNK).min(dest.output_free());
            if want == 0 {
                break;
            }
            let peeked = self.peek_input(&mut scratch[..want]);
            if peeked == 0 {
                break;
            }
            let stored = dest.store_into_output(&scratch[..peeked]);
            self.consume_input(stored);
            moved += stored;
            if stored < peeked {
                break;
            }
        }
        moved
    }

    /// Move up to `max` input bytes into an accumulator.
    fn drain_input_into(&mut self, acc: &mut BytesMut, max: usize) -> usize
    where
        Self: Sized,
    {
        let mut scratch = [0u8; MOVE_CHUNK];
        let mut moved = 0;
        while moved < max {
            let want = (max - moved).min(MOVE_CHUNK);
            let peeked = self.peek_input(&mut scratch[..want]);
            if peeked == 0 {
                break;
            }
            acc.extend_from_slice(&scratch[..peeked]);
            self.consume_input(peeked);
            moved += peeked;
        }
        moved
    }
}

// =============================================================================
// Ring Buffer
// =============================================================================

/// A bounded FIFO byte buffer.
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: VecDeque<u8>,
    capacity: usize,
}

impl RingBuffer {
    /// Create an empty buffer holding at most `capacity` bytes.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn used(&self) -> usize {
        self.buf.len()
    }

    pub fn free(&self) -> usize {
        self.capacity - self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Append as much of `src` as fits. Returns the number of bytes stored.
    pub fn store(&mut self, src: &[u8]) -> usize {
        let n = src.len().min(self.free());
        self.buf.extend(&src[..n]);
        n
    }

    /// Copy from the front without consuming.
    pub fn peek(&self, dst: &mut [u8]) -> usize {
        let (front, back) = self.buf.as_slices();
        let from_front = front.len().min(dst.len());
        dst[..from_front].copy_from_slice(&front[..from_front]);
        let from_back = back.len().min(dst.len() - from_front);
        dst[from_front..from_front + from_back].copy_from_slice(&back[..from_back]);
        from_front + from_back
    }

    /// The longest contiguous run of bytes at the front of the buffer.
    pub fn chunk(&self) -> &[u8] {
        let (front, back) = self.buf.as_slices();
        if front.is_empty() {
            back
        } else {
            front
        }
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
    }

    /// Discard everything and release the backing storage.
    pub fn clean(&mut self) {
        self.buf = VecDeque::new();
    }
}

// =============================================================================
// Buffered Port
// =============================================================================

/// An in-memory port backed by two ring buffers.
///
/// The relay side uses it through [`DuplexPort`]. The reactor side pushes
/// received bytes with [`BufferedPort::push_input`] and flushes pending
/// output with [`BufferedPort::output_chunk`] and
/// [`BufferedPort::consume_output`].
#[derive(Debug, Clone)]
pub struct BufferedPort {
    input: RingBuffer,
    output: RingBuffer,
    closed: bool,
}

impl BufferedPort {
    /// Create a port with the given input and output buffer capacities.
    pub fn new(in_capacity: usize, out_capacity: usize) -> Self {
        Self {
            input: RingBuffer::with_capacity(in_capacity),
            output: RingBuffer::with_capacity(out_capacity),
            closed: false,
        }
    }

    /// Append bytes received from the socket. Returns the number accepted.
    pub fn push_input(&mut self, data: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        self.input.store(data)
    }

    /// The next contiguous run of bytes waiting to be written to the socket.
    pub fn output_chunk(&self) -> &[u8] {
        self.output.chunk()
    }

    /// Mark `n` output bytes as written to the socket.
    pub fn consume_output(&mut self, n: usize) {
        self.output.consume(n);
    }

    /// Remove and return everything waiting on the output side.
    pub fn take_output(&mut self) -> Vec<u8> {
        let mut out = vec![0u8; self.output.used()];
        let n = self.output.peek(&mut out);
        self.output.consume(n);
        out
    }
}

impl DuplexPort for BufferedPort {
    fn input_used(&self) -> usize {
        self.input.used()
    }

    fn input_free(&self) -> usize {
        self.input.free()
    }

    fn output_used(&self) -> usize {
        self.output.used()
    }

    fn output_free(&self) -> usize {
        if self.closed {
            return 0;
        }
        self.output.free()
    }

    fn peek_input(&self, dst: &mut [u8]) -> usize {
        self.input.peek(dst)
    }

    fn consume_input(&mut self, n: usize) {
        self.input.consume(n);
    }

    fn store_into_output(&mut self, src: &[u8]) -> usize {
        if self.closed {
            return 0;
        }
        self.output.store(src)
    }

    fn close(&mut self) {
        self.closed = true;
        self.input.clean();
        self.output.clean();
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
