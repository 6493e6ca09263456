//! The protocol module contract.
//!
//! A [`Protocol`] is the session-wide decision function. It keeps one
//! sub-context per connection (the frontend and each backend) and is asked,
//! for every chunk of input, whether to relay it untouched or to parse a
//! frame of a given length.
//!
//! All methods run synchronously on the session's thread and must not block.

use bytes::Bytes;

use crate::error::ProtocolError;
use crate::table::BackendId;

/// How the next chunk of input on a connection is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Relay `expected_len` bytes without interpretation.
    Proxy,
    /// Assemble `expected_len` bytes and `feed` them as one frame.
    Handle,
}

/// Where a frontend-originated message should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    /// An existing backend.
    Backend(BackendId),
    /// No backend chosen yet; run pool selection.
    Select,
}

/// A connection within a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Peer {
    Frontend,
    Backend(BackendId),
}

impl Peer {
    pub fn backend_id(self) -> Option<BackendId> {
        match self {
            Peer::Frontend => None,
            Peer::Backend(id) => Some(id),
        }
    }
}

/// Protocol-specific framing and routing decisions.
pub trait Protocol {
    /// Per-connection parsing state.
    type Sub;

    /// Create the sub-context for a new connection.
    fn new_sub(&mut self, peer: Peer) -> Self::Sub;

    /// Disposition of the next chunk on this connection.
    fn mode(&self, sub: &Self::Sub) -> Mode;

    /// Bytes needed before the next decision. Zero means decide with no
    /// payload: an empty frame in handle mode, an empty region in proxy mode.
    fn expected_len(&self, sub: &Self::Sub) -> usize;

    /// Consume one fully assembled frame.
    ///
    /// Returns bytes for the other side of the relay: frontend frames go to
    /// the target backend, backend frames go to the frontend. The reply to a
    /// zero-length frame is ignored.
    fn feed(&mut self, sub: &mut Self::Sub, data: Bytes) -> Result<Option<Bytes>, ProtocolError>;

    /// Bytes to write back to the same connection after a `feed`.
    fn produce(&mut self, _sub: &mut Self::Sub) -> Option<Bytes> {
        None
    }

    /// Backend for the current frontend-originated message or region.
    ///
    /// Consulted again each time more input of an unfinished proxy region
    /// arrives, so the answer must stay fixed until `on_proxy_done`.
    fn target(&self, frontend: &Self::Sub) -> Target;

    /// A backend was chosen for the frontend, either reused or new.
    fn on_backend_selected(&mut self, _frontend: &mut Self::Sub, _backend: &Self::Sub) {}

    /// A new backend connection was opened. The returned bytes are the first
    /// thing written to it.
    fn on_backend_connected(&mut self, _backend: &mut Self::Sub) -> Option<Bytes> {
        None
    }

    /// A proxy region on this connection has been fully relayed.
    fn on_proxy_done(&mut self, _sub: &mut Self::Sub) {}
}
