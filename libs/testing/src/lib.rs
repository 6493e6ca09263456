//! Test doubles for driving a relay session without sockets.
//!
//! - [`SharedPort`]: an in-memory port whose buffers stay reachable from the
//!   test after the session takes ownership of it
//! - [`ScriptedProtocol`]: a configurable protocol that records every call
//! - [`RecordingConnector`]: hands out [`SharedPort`]s and remembers them

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::Rc;

use bytes::Bytes;
use plexus_relay::{
    BackendId, BufferedPort, ConnectOptions, Connector, DuplexPort, Mode, Peer, Protocol,
    ProtocolError, Target,
};

// ============================================================================
// Ports
// ============================================================================

/// Cloneable handle to one [`BufferedPort`].
///
/// Every clone sees the same buffers, so a test can keep a handle to a port
/// the session owns and play the reactor's part on it.
#[derive(Debug, Clone)]
pub struct SharedPort {
    inner: Rc<RefCell<BufferedPort>>,
    closes: Rc<Cell<usize>>,
}

impl SharedPort {
    pub fn new(in_capacity: usize, out_capacity: usize) -> Self {
        Self {
            inner: Rc::new(RefCell::new(BufferedPort::new(in_capacity, out_capacity))),
            closes: Rc::new(Cell::new(0)),
        }
    }

    /// Simulate bytes arriving from the socket.
    pub fn push_input(&self, data: &[u8]) -> usize {
        self.inner.borrow_mut().push_input(data)
    }

    /// Simulate the socket accepting everything buffered for output.
    pub fn take_output(&self) -> Vec<u8> {
        self.inner.borrow_mut().take_output()
    }

    /// How many times `close` was called.
    pub fn close_count(&self) -> usize {
        self.closes.get()
    }
}

impl DuplexPort for SharedPort {
    fn input_used(&self) -> usize {
        self.inner.borrow().input_used()
    }

    fn input_free(&self) -> usize {
        self.inner.borrow().input_free()
    }

    fn output_used(&self) -> usize {
        self.inner.borrow().output_used()
    }

    fn output_free(&self) -> usize {
        self.inner.borrow().output_free()
    }

    fn peek_input(&self, dst: &mut [u8]) -> usize {
        self.inner.borrow().peek_input(dst)
    }

    fn consume_input(&mut self, n: usize) {
        self.inner.borrow_mut().consume_input(n)
    }

    fn store_into_output(&mut self, src: &[u8]) -> usize {
        self.inner.borrow_mut().store_into_output(src)
    }

    fn close(&mut self) {
        self.closes.set(self.closes.get() + 1);
        self.inner.borrow_mut().close()
    }

    fn is_closed(&self) -> bool {
        self.inner.borrow().is_closed()
    }
}

// ============================================================================
// Protocol
// ============================================================================

/// A protocol callback observed by [`ScriptedProtocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    NewSub(Peer),
    Feed(Peer, Bytes),
    Selected(BackendId),
    Connected(BackendId),
    ProxyDone(Peer),
}

/// Framing rule for one side of the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Framing {
    pub mode: Mode,
    pub len: usize,
}

impl Framing {
    pub fn handle(len: usize) -> Self {
        Self {
            mode: Mode::Handle,
            len,
        }
    }

    pub fn proxy(len: usize) -> Self {
        Self {
            mode: Mode::Proxy,
            len,
        }
    }
}

/// Sub-context of [`ScriptedProtocol`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptedSub {
    pub peer: Peer,
    /// Backend chosen for a frontend sub.
    pub chosen: Option<BackendId>,
    /// Completed proxy regions on this connection.
    pub regions_done: usize,
    /// One-shot framings used before the side's default, each consumed by
    /// the next feed or completed proxy region.
    pub preface: VecDeque<Framing>,
}

/// Protocol that echoes frames across the relay and records what it saw.
#[derive(Debug, Clone)]
pub struct ScriptedProtocol {
    frontend: Framing,
    backend: Framing,
    sticky: bool,
    frontend_preface: Vec<Framing>,
    backend_preface: Vec<Framing>,
    greeting: Option<Bytes>,
    write_back: Option<Bytes>,
    fail_on: Option<Bytes>,
    swallow: Option<Bytes>,
    empty_reply: Option<Bytes>,
    calls: Vec<Call>,
}

impl ScriptedProtocol {
    pub fn new(frontend: Framing, backend: Framing) -> Self {
        Self {
            frontend,
            backend,
            sticky: true,
            frontend_preface: Vec::new(),
            backend_preface: Vec::new(),
            greeting: None,
            write_back: None,
            fail_on: None,
            swallow: None,
            empty_reply: None,
            calls: Vec::new(),
        }
    }

    /// Run pool selection for every frontend message instead of pinning the
    /// first chosen backend.
    pub fn unpinned(mut self) -> Self {
        self.sticky = false;
        self
    }

    /// Bytes written first to every new backend.
    pub fn with_greeting(mut self, greeting: &'static [u8]) -> Self {
        self.greeting = Some(Bytes::from_static(greeting));
        self
    }

    /// Bytes written back to a backend after each of its frames.
    pub fn with_write_back(mut self, data: &'static [u8]) -> Self {
        self.write_back = Some(Bytes::from_static(data));
        self
    }

    /// Reject any frame equal to `frame`.
    pub fn failing_on(mut self, frame: &'static [u8]) -> Self {
        self.fail_on = Some(Bytes::from_static(frame));
        self
    }

    /// Framings the frontend uses once, in order, before its default.
    pub fn with_frontend_preface(mut self, preface: impl IntoIterator<Item = Framing>) -> Self {
        self.frontend_preface = preface.into_iter().collect();
        self
    }

    /// Framings every backend uses once, in order, before its default.
    pub fn with_backend_preface(mut self, preface: impl IntoIterator<Item = Framing>) -> Self {
        self.backend_preface = preface.into_iter().collect();
        self
    }

    /// Consume any frame equal to `frame` without replying.
    pub fn swallowing(mut self, frame: &'static [u8]) -> Self {
        self.swallow = Some(Bytes::from_static(frame));
        self
    }

    /// Reply with `data` to zero-length frames instead of echoing them.
    pub fn with_empty_frame_reply(mut self, data: &'static [u8]) -> Self {
        self.empty_reply = Some(Bytes::from_static(data));
        self
    }

    pub fn calls(&self) -> &[Call] {
        &self.calls
    }

    /// Frames fed from `peer`, in order.
    pub fn fed(&self, peer: Peer) -> Vec<Bytes> {
        self.calls
            .iter()
            .filter_map(|call| match call {
                Call::Feed(p, data) if *p == peer => Some(data.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls.iter().filter(|call| pred(call)).count()
    }

    fn framing(&self, sub: &ScriptedSub) -> Framing {
        if let Some(framing) = sub.preface.front() {
            return *framing;
        }
        match sub.peer {
            Peer::Frontend => self.frontend,
            Peer::Backend(_) => self.backend,
        }
    }
}

impl Protocol for ScriptedProtocol {
    type Sub = ScriptedSub;

    fn new_sub(&mut self, peer: Peer) -> ScriptedSub {
        self.calls.push(Call::NewSub(peer));
        let preface = match peer {
            Peer::Frontend => &self.frontend_preface,
            Peer::Backend(_) => &self.backend_preface,
        };
        ScriptedSub {
            peer,
            chosen: None,
            regions_done: 0,
            preface: preface.iter().copied().collect(),
        }
    }

    fn mode(&self, sub: &ScriptedSub) -> Mode {
        self.framing(sub).mode
    }

    fn expected_len(&self, sub: &ScriptedSub) -> usize {
        self.framing(sub).len
    }

    fn feed(&mut self, sub: &mut ScriptedSub, data: Bytes) -> Result<Option<Bytes>, ProtocolError> {
        self.calls.push(Call::Feed(sub.peer, data.clone()));
        sub.preface.pop_front();
        if self.fail_on.as_ref() == Some(&data) {
            return Err(ProtocolError::new(format!("rejected frame {data:?}")));
        }
        if self.swallow.as_ref() == Some(&data) {
            return Ok(None);
        }
        if data.is_empty() {
            return Ok(self.empty_reply.clone());
        }
        Ok(Some(data))
    }

    fn produce(&mut self, sub: &mut ScriptedSub) -> Option<Bytes> {
        match sub.peer {
            Peer::Backend(_) => self.write_back.clone(),
            Peer::Frontend => None,
        }
    }

    fn target(&self, frontend: &ScriptedSub) -> Target {
        match frontend.chosen {
            Some(id) if self.sticky => Target::Backend(id),
            _ => Target::Select,
        }
    }

    fn on_backend_selected(&mut self, frontend: &mut ScriptedSub, backend: &ScriptedSub) {
        if let Some(id) = backend.peer.backend_id() {
            self.calls.push(Call::Selected(id));
            frontend.chosen = Some(id);
        }
    }

    fn on_backend_connected(&mut self, backend: &mut ScriptedSub) -> Option<Bytes> {
        if let Some(id) = backend.peer.backend_id() {
            self.calls.push(Call::Connected(id));
        }
        self.greeting.clone()
    }

    fn on_proxy_done(&mut self, sub: &mut ScriptedSub) {
        sub.regions_done += 1;
        sub.preface.pop_front();
        self.calls.push(Call::ProxyDone(sub.peer));
    }
}

// ============================================================================
// Connector
// ============================================================================

/// A backend port handed out by [`RecordingConnector`].
#[derive(Debug, Clone)]
pub struct Opened {
    pub id: BackendId,
    pub endpoint: String,
    pub port: SharedPort,
}

/// Connector that resolves to a settable endpoint and keeps a handle to
/// every port it opens.
#[derive(Debug, Clone)]
pub struct RecordingConnector {
    endpoint: Option<String>,
    fail_open: bool,
    buffer: Option<usize>,
    opened: Vec<Opened>,
}

impl RecordingConnector {
    pub fn new(endpoint: impl Into<String>) -> Self {
        Self {
            endpoint: Some(endpoint.into()),
            fail_open: false,
            buffer: None,
            opened: Vec::new(),
        }
    }

    /// A connector that never provides an endpoint.
    pub fn refusing() -> Self {
        Self {
            endpoint: None,
            ..Self::new("")
        }
    }

    /// Make every `open` fail with `ConnectionRefused`.
    pub fn failing(mut self) -> Self {
        self.fail_open = true;
        self
    }

    /// Override both buffer sizes of opened ports.
    pub fn with_buffer(mut self, size: usize) -> Self {
        self.buffer = Some(size);
        self
    }

    pub fn set_endpoint(&mut self, endpoint: Option<&str>) {
        self.endpoint = endpoint.map(str::to_owned);
    }

    pub fn opened(&self) -> &[Opened] {
        &self.opened
    }

    /// Handle to the port opened for backend `id`.
    pub fn port(&self, id: BackendId) -> Option<SharedPort> {
        self.opened
            .iter()
            .find(|opened| opened.id == id)
            .map(|opened| opened.port.clone())
    }
}

impl Connector for RecordingConnector {
    type Port = SharedPort;
    type Endpoint = String;

    fn resolve(&mut self, _frontend: &SharedPort) -> Option<String> {
        self.endpoint.clone()
    }

    fn open(&mut self, id: BackendId, endpoint: &String, options: &ConnectOptions) -> io::Result<SharedPort> {
        if self.fail_open {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "connection refused"));
        }
        let port = match self.buffer {
            Some(size) => SharedPort::new(size, size),
            None => SharedPort::new(options.in_buffer, options.out_buffer),
        };
        self.opened.push(Opened {
            id,
            endpoint: endpoint.clone(),
            port: port.clone(),
        });
        Ok(port)
    }
}
