//! Backend agents.
//!
//! A [`BackendAgent`] owns one outbound connection together with the two
//! queues that feed it: bytes bound for the backend and bytes bound for the
//! frontend. The session calls into it with the frontend pieces it needs,
//! since the frontend port and sub-context are owned by the session.

use bytes::Bytes;
use tracing::{debug, trace};

use crate::error::ProtocolError;
use crate::flow::{ByteFlow, Drain};
use crate::frame::{self, FrameAssembler, Input};
use crate::port::DuplexPort;
use crate::protocol::Protocol;
use crate::table::BackendId;

/// Which queues gained work during a read.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadOutcome {
    /// Data was queued toward the backend.
    pub(crate) to_backend: bool,
    /// Data was queued toward the frontend.
    pub(crate) to_frontend: bool,
}

/// Result of flushing the backend-bound queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BackendWrite {
    /// The connection has not been established yet.
    NotConnected,
    /// The drain stopped for this reason.
    Drained(Drain),
}

/// One backend connection and its queues.
#[derive(Debug)]
pub struct BackendAgent<P, S, E> {
    id: BackendId,
    endpoint: E,
    port: P,
    sub: S,
    connected: bool,
    to_backend: ByteFlow,
    to_frontend: ByteFlow,
    partial: Option<FrameAssembler>,
}

impl<P, S, E> BackendAgent<P, S, E>
where
    P: DuplexPort,
{
    pub(crate) fn new(id: BackendId, endpoint: E, port: P, sub: S) -> Self {
        Self {
            id,
            endpoint,
            port,
            sub,
            connected: false,
            to_backend: ByteFlow::new(),
            to_frontend: ByteFlow::new(),
            partial: None,
        }
    }

    pub fn id(&self) -> BackendId {
        self.id
    }

    /// The remote endpoint this backend was opened to.
    pub fn endpoint(&self) -> &E {
        &self.endpoint
    }

    pub fn port(&self) -> &P {
        &self.port
    }

    pub fn port_mut(&mut self) -> &mut P {
        &mut self.port
    }

    pub fn sub(&self) -> &S {
        &self.sub
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    /// Queue of bytes waiting to be written to the backend.
    pub fn to_backend(&self) -> &ByteFlow {
        &self.to_backend
    }

    /// Queue of bytes waiting to be written to the frontend.
    pub fn to_frontend(&self) -> &ByteFlow {
        &self.to_frontend
    }

    pub(crate) fn sub_mut(&mut self) -> &mut S {
        &mut self.sub
    }

    pub(crate) fn mark_connected(&mut self) {
        self.connected = true;
    }

    pub(crate) fn has_frontend_work(&self) -> bool {
        !self.to_frontend.is_empty()
    }

    /// Queue bytes for the backend.
    pub(crate) fn write_to_backend(&mut self, data: Bytes) {
        self.to_backend.enqueue_bytes(data);
    }

    /// Queue a proxy region from the frontend input to the backend.
    pub(crate) fn proxy_to_backend(&mut self, len: usize) {
        if !self.to_backend.enqueue_proxy(len) {
            trace!(backend_id = %self.id, "proxy region already queued toward backend");
        }
    }

    /// Consume buffered backend input until it runs out or a decision has to
    /// wait for the frontend side.
    pub(crate) fn read<M>(&mut self, protocol: &mut M) -> Result<ReadOutcome, ProtocolError>
    where
        M: Protocol<Sub = S>,
    {
        let mut outcome = ReadOutcome::default();
        loop {
            match frame::next_input(protocol, &self.sub, &mut self.port, &mut self.partial) {
                Input::Empty | Input::Partial => return Ok(outcome),
                Input::Proxy(0) => {
                    protocol.on_proxy_done(&mut self.sub);
                }
                Input::Proxy(len) => {
                    trace!(backend_id = %self.id, len, "proxying backend input to frontend");
                    self.to_frontend.enqueue_proxy(len);
                    outcome.to_frontend = true;
                    return Ok(outcome);
                }
                Input::Frame(data) => {
                    trace!(backend_id = %self.id, len = data.len(), "feeding backend frame");
                    let empty_frame = data.is_empty();
                    let reply = protocol.feed(&mut self.sub, data)?;

                    if let Some(back) = protocol.produce(&mut self.sub).filter(|b| !b.is_empty()) {
                        debug!(backend_id = %self.id, len = back.len(), "writing back to backend");
                        self.to_backend.enqueue_bytes(back);
                        outcome.to_backend = true;
                    }

                    // Zero-length frames only ever write back.
                    if empty_frame {
                        continue;
                    }
                    if let Some(reply) = reply.filter(|b| !b.is_empty()) {
                        self.to_frontend.enqueue_bytes(reply);
                        outcome.to_frontend = true;
                        return Ok(outcome);
                    }
                }
            }
        }
    }

    /// Flush the backend-bound queue. Proxy regions are taken from the
    /// frontend input; their completion is reported against the frontend
    /// sub-context.
    pub(crate) fn write_backend<M>(
        &mut self,
        frontend: &mut P,
        frontend_sub: &mut S,
        protocol: &mut M,
    ) -> BackendWrite
    where
        M: Protocol<Sub = S>,
    {
        if !self.connected {
            return BackendWrite::NotConnected;
        }
        let drain = self
            .to_backend
            .drain(frontend, &mut self.port, || protocol.on_proxy_done(frontend_sub));
        trace!(backend_id = %self.id, ?drain, "backend write");
        BackendWrite::Drained(drain)
    }

    /// Flush the frontend-bound queue into the frontend output. Proxy
    /// regions are taken from this backend's input.
    pub(crate) fn write_frontend<M>(&mut self, frontend: &mut P, protocol: &mut M) -> Drain
    where
        M: Protocol<Sub = S>,
    {
        let sub = &mut self.sub;
        let drain = self
            .to_frontend
            .drain(&mut self.port, frontend, || protocol.on_proxy_done(sub));
        trace!(backend_id = %self.id, ?drain, "frontend write");
        drain
    }

    /// Close the connection and drop pending work.
    pub(crate) fn close(&mut self) {
        self.to_backend.clear();
        self.to_frontend.clear();
        self.partial = None;
        self.port.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::BufferedPort;
    use crate::protocol::{Mode, Peer, Target};

    /// Two-byte frames; `--` is swallowed, `ak` asks for an ack back to the
    /// backend, anything else is echoed to the frontend.
    struct Pairs;

    impl Protocol for Pairs {
        type Sub = bool;

        fn new_sub(&mut self, _peer: Peer) -> bool {
            false
        }

        fn mode(&self, _sub: &bool) -> Mode {
            Mode::Handle
        }

        fn expected_len(&self, _sub: &bool) -> usize {
            2
        }

        fn feed(&mut self, ack: &mut bool, data: Bytes) -> Result<Option<Bytes>, ProtocolError> {
            match data.as_ref() {
                b"--" => Ok(None),
                b"ak" => {
                    *ack = true;
                    Ok(None)
                }
                _ => Ok(Some(data)),
            }
        }

        fn produce(&mut self, ack: &mut bool) -> Option<Bytes> {
            std::mem::take(ack).then(|| Bytes::from_static(b"ACK"))
        }

        fn target(&self, _frontend: &bool) -> Target {
            Target::Select
        }
    }

    fn agent() -> BackendAgent<BufferedPort, bool, &'static str> {
        let id = BackendId::new(3).unwrap();
        BackendAgent::new(id, "upstream", BufferedPort::new(64, 64), false)
    }

    #[test]
    fn test_read_skips_frames_without_reply() {
        let mut agent = agent();
        agent.port_mut().push_input(b"----hixx");

        let outcome = agent.read(&mut Pairs).unwrap();
        assert!(outcome.to_frontend);
        assert!(!outcome.to_backend);
        assert_eq!(
            agent.to_frontend().current(),
            Some(&crate::flow::Segment::Copy(Bytes::from_static(b"hi")))
        );
        // The read stops after the first frame bound for the frontend.
        assert_eq!(agent.port().input_used(), 2);
    }

    #[test]
    fn test_read_queues_write_back() {
        let mut agent = agent();
        agent.port_mut().push_input(b"ak");

        let outcome = agent.read(&mut Pairs).unwrap();
        assert!(outcome.to_backend);
        assert!(!outcome.to_frontend);
        assert_eq!(agent.to_backend().len(), 1);
    }

    #[test]
    fn test_write_waits_for_connect() {
        let mut agent = agent();
        let mut frontend = BufferedPort::new(64, 64);
        let mut frontend_sub = false;
        agent.write_to_backend(Bytes::from_static(b"queued"));

        assert_eq!(
            agent.write_backend(&mut frontend, &mut frontend_sub, &mut Pairs),
            BackendWrite::NotConnected
        );

        agent.mark_connected();
        assert_eq!(
            agent.write_backend(&mut frontend, &mut frontend_sub, &mut Pairs),
            BackendWrite::Drained(Drain::Done)
        );
        assert_eq!(agent.port_mut().take_output(), b"queued");
    }

    #[test]
    fn test_close_discards_pending_work() {
        let mut agent = agent();
        agent.write_to_backend(Bytes::from_static(b"pending"));
        agent.proxy_to_backend(10);
        agent.close();

        assert!(agent.to_backend().is_empty());
        assert!(agent.port().is_closed());
    }
}
