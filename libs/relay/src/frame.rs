//! Input classification shared by the frontend and backend read paths.

use bytes::{Bytes, BytesMut};

use crate::port::DuplexPort;
use crate::protocol::{Mode, Protocol};

/// Collects exactly `want` bytes of one handle-mode frame.
#[derive(Debug)]
pub(crate) struct FrameAssembler {
    buf: BytesMut,
    want: usize,
}

impl FrameAssembler {
    pub(crate) fn new(want: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(want),
            want,
        }
    }

    fn missing(&self) -> usize {
        self.want - self.buf.len()
    }

    fn fill<P: DuplexPort>(&mut self, port: &mut P) {
        let missing = self.missing();
        port.drain_input_into(&mut self.buf, missing);
    }

    fn is_complete(&self) -> bool {
        self.missing() == 0
    }
}

/// What the next piece of buffered input turned out to be.
#[derive(Debug, PartialEq, Eq)]
pub(crate) enum Input {
    /// Nothing buffered.
    Empty,
    /// A frame is being assembled and needs more bytes.
    Partial,
    /// The protocol wants this many bytes relayed untouched.
    Proxy(usize),
    /// A complete frame.
    Frame(Bytes),
}

/// Classify buffered input on `port`, pulling bytes into `partial` while a
/// handle-mode frame is being assembled.
///
/// Once a frame has started it is finished before the mode is consulted
/// again.
pub(crate) fn next_input<M, P>(
    protocol: &M,
    sub: &M::Sub,
    port: &mut P,
    partial: &mut Option<FrameAssembler>,
) -> Input
where
    M: Protocol,
    P: DuplexPort,
{
    if port.input_used() == 0 {
        return Input::Empty;
    }

    let mut assembler = match partial.take() {
        Some(assembler) => assembler,
        None => {
            let len = protocol.expected_len(sub);
            match protocol.mode(sub) {
                Mode::Proxy => return Input::Proxy(len),
                Mode::Handle => FrameAssembler::new(len),
            }
        }
    };

    assembler.fill(port);
    if assembler.is_complete() {
        Input::Frame(assembler.buf.freeze())
    } else {
        tracing::trace!(missing = assembler.missing(), "frame not complete yet");
        *partial = Some(assembler);
        Input::Partial
    }
}
