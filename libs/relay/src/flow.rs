//! Per-direction queues of pending write work.
//!
//! A [`ByteFlow`] holds the segments still to be written toward one
//! destination. Copy segments carry their own payload; proxy segments only
//! count bytes that move straight from a paired input buffer into the
//! destination output buffer.

use std::collections::VecDeque;

use bytes::{Buf, Bytes};

use crate::port::DuplexPort;

/// One unit of pending write work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    /// Owned payload; the unread remainder is what is left to write.
    Copy(Bytes),
    /// Bytes still to be moved from the paired input buffer.
    Proxy { remaining: usize },
}

impl Segment {
    pub fn is_proxy(&self) -> bool {
        matches!(self, Segment::Proxy { .. })
    }

    /// Bytes this segment still has to write.
    pub fn pending(&self) -> usize {
        match self {
            Segment::Copy(payload) => payload.len(),
            Segment::Proxy { remaining } => *remaining,
        }
    }
}

/// Result of a single drain step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// Nothing in flight and nothing queued.
    Idle,
    /// Bytes were written (possibly zero when a buffer was exhausted).
    Moved(usize),
    /// A proxy segment reached zero remaining bytes after moving this many.
    ProxyDone(usize),
}

/// Why a drain loop returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drain {
    /// Every queued segment was written.
    Done,
    /// The destination output buffer is full.
    Blocked,
    /// A proxy segment is waiting for bytes on the source input.
    Starved,
}

/// Ordered queue of segments bound for one destination.
#[derive(Debug, Default)]
pub struct ByteFlow {
    current: Option<Segment>,
    queue: VecDeque<Segment>,
}

impl ByteFlow {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a copy of `payload` behind any existing work.
    ///
    /// Empty payloads are ignored.
    pub fn enqueue_bytes(&mut self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.push(Segment::Copy(payload));
    }

    /// Queue a proxy region of `len` bytes.
    ///
    /// A flow holds at most one proxy segment at a time. When one is already
    /// in flight or queued the request refers to the same region and is
    /// ignored, as is an empty region. Returns whether a segment was added.
    pub fn enqueue_proxy(&mut self, len: usize) -> bool {
        if len == 0
            || self.current.as_ref().is_some_and(Segment::is_proxy)
            || self.queue.iter().any(Segment::is_proxy)
        {
            return false;
        }
        self.push(Segment::Proxy { remaining: len });
        true
    }

    fn push(&mut self, segment: Segment) {
        if self.current.is_none() {
            self.current = Some(segment);
        } else {
            self.queue.push_back(segment);
        }
    }

    /// The segment currently being written.
    pub fn current(&self) -> Option<&Segment> {
        self.current.as_ref()
    }

    /// Number of segments in flight or queued.
    pub fn len(&self) -> usize {
        usize::from(self.current.is_some()) + self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.current.is_none()
    }

    /// Whether the in-flight segment is a proxy region.
    pub fn is_proxying(&self) -> bool {
        self.current.as_ref().is_some_and(Segment::is_proxy)
    }

    /// Drop all pending work.
    pub fn clear(&mut self) {
        self.current = None;
        self.queue.clear();
    }

    /// Write as much of the in-flight segment as the buffers allow.
    ///
    /// Proxy segments move bytes from `source`'s input into `dest`'s output;
    /// copy segments write their payload into `dest`'s output. A consumed
    /// segment is replaced by the next queued one.
    pub fn step<S, D>(&mut self, source: &mut S, dest: &mut D) -> Step
    where
        S: DuplexPort,
        D: DuplexPort,
    {
        if self.current.is_none() {
            self.current = self.queue.pop_front();
        }
        let Some(segment) = self.current.as_mut() else {
            return Step::Idle;
        };

        match segment {
            Segment::Proxy { remaining } => {
                let moved = source.move_input_to(dest, *remaining);
                *remaining -= moved;
                if *remaining == 0 {
                    self.current = self.queue.pop_front();
                    Step::ProxyDone(moved)
                } else {
                    Step::Moved(moved)
                }
            }
            Segment::Copy(payload) => {
                let stored = dest.store_into_output(payload.chunk());
                payload.advance(stored);
                if payload.is_empty() {
                    self.current = self.queue.pop_front();
                }
                Step::Moved(stored)
            }
        }
    }

    /// Repeat [`ByteFlow::step`] until the queue empties or a buffer stops it.
    ///
    /// `on_proxy_done` runs each time a proxy region completes.
    pub fn drain<S, D>(&mut self, source: &mut S, dest: &mut D, mut on_proxy_done: impl FnMut()) -> Drain
    where
        S: DuplexPort,
        D: DuplexPort,
    {
        loop {
            let Some(segment) = self.current.as_ref() else {
                return Drain::Done;
            };
            if dest.output_free() == 0 {
                return Drain::Blocked;
            }
            if segment.is_proxy() && source.input_used() == 0 {
                return Drain::Starved;
            }

            match self.step(source, dest) {
                Step::Idle => return Drain::Done,
                Step::ProxyDone(_) => on_proxy_done(),
                Step::Moved(0) => return Drain::Blocked,
                Step::Moved(_) => {}
            }
        }
    }
}
