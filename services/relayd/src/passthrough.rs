//! Opaque TCP passthrough.
//!
//! Every byte is relayed untouched. The first frontend byte picks an
//! upstream; the session stays pinned to it afterwards. A PROXY v2 header
//! may be written to the upstream ahead of the client's bytes.

use bytes::Bytes;
use plexus_relay::{BackendId, Mode, Peer, Protocol, ProtocolError, Target};

/// Sub-context of [`Passthrough`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PassthroughSub {
    peer: Peer,
    backend: Option<BackendId>,
}

impl PassthroughSub {
    /// Backend this frontend is pinned to.
    pub fn backend(&self) -> Option<BackendId> {
        self.backend
    }
}

/// Proxy-mode protocol pinning each client to one upstream.
#[derive(Debug, Clone, Default)]
pub struct Passthrough {
    header: Option<Bytes>,
}

impl Passthrough {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write `header` to each new backend before relaying client bytes.
    pub fn with_header(header: Bytes) -> Self {
        Self {
            header: Some(header),
        }
    }
}

impl Protocol for Passthrough {
    type Sub = PassthroughSub;

    fn new_sub(&mut self, peer: Peer) -> PassthroughSub {
        PassthroughSub {
            peer,
            backend: None,
        }
    }

    fn mode(&self, _sub: &PassthroughSub) -> Mode {
        Mode::Proxy
    }

    fn expected_len(&self, _sub: &PassthroughSub) -> usize {
        usize::MAX
    }

    fn feed(&mut self, _sub: &mut PassthroughSub, data: Bytes) -> Result<Option<Bytes>, ProtocolError> {
        Ok(Some(data))
    }

    fn target(&self, frontend: &PassthroughSub) -> Target {
        frontend.backend.map_or(Target::Select, Target::Backend)
    }

    fn on_backend_selected(&mut self, frontend: &mut PassthroughSub, backend: &PassthroughSub) {
        frontend.backend = backend.peer.backend_id();
    }

    fn on_backend_connected(&mut self, _backend: &mut PassthroughSub) -> Option<Bytes> {
        self.header.clone()
    }
}

#[cfg(test)]
mod tests {
    use plexus_relay::{BufferedPort, ConnectOptions, Connector, DuplexPort, Session, SessionConfig};

    use super::*;

    struct Loopback;

    impl Connector for Loopback {
        type Port = BufferedPort;
        type Endpoint = &'static str;

        fn resolve(&mut self, _frontend: &BufferedPort) -> Option<&'static str> {
            Some("loopback")
        }

        fn open(
            &mut self,
            _id: BackendId,
            _endpoint: &&'static str,
            options: &ConnectOptions,
        ) -> std::io::Result<BufferedPort> {
            Ok(BufferedPort::new(options.in_buffer, options.out_buffer))
        }
    }

    #[test]
    fn test_relays_both_directions_after_header() {
        let protocol = Passthrough::with_header(Bytes::from_static(b"HDR"));
        let mut session = Session::new(BufferedPort::new(64, 64), protocol, Loopback, SessionConfig::default());
        let id = BackendId::new(1).unwrap();

        session.port_mut(Peer::Frontend).unwrap().push_input(b"hello");
        session.readable(Peer::Frontend);
        session.connected(id);
        assert_eq!(session.frontend_sub().backend(), Some(id));

        let backend = session.port_mut(Peer::Backend(id)).unwrap();
        assert_eq!(backend.take_output(), b"HDRhello");

        backend.push_input(b"world");
        session.readable(Peer::Backend(id));
        assert_eq!(session.port_mut(Peer::Frontend).unwrap().take_output(), b"world");

        // Later client bytes stay on the same backend.
        session.port_mut(Peer::Frontend).unwrap().push_input(b"again");
        session.readable(Peer::Frontend);
        assert_eq!(session.backend_count(), 1);
        assert_eq!(
            session.port_mut(Peer::Backend(id)).unwrap().take_output(),
            b"again"
        );
    }

    #[test]
    fn test_no_header_by_default() {
        let mut session = Session::new(
            BufferedPort::new(64, 64),
            Passthrough::new(),
            Loopback,
            SessionConfig::default(),
        );
        let id = BackendId::new(1).unwrap();

        session.port_mut(Peer::Frontend).unwrap().push_input(b"x");
        session.readable(Peer::Frontend);
        session.connected(id);

        assert_eq!(session.port_mut(Peer::Backend(id)).unwrap().take_output(), b"x");
        assert_eq!(session.frontend().input_used(), 0);
    }
}
