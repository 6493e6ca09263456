//! Outbound connection provider.

use std::fmt::{Debug, Display};
use std::io;
use std::time::Duration;

use crate::port::DuplexPort;
use crate::table::BackendId;

/// Default timeout for establishing a backend connection.
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

/// Default capacity of each connection buffer.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Parameters handed to [`Connector::open`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectOptions {
    /// How long the reactor may wait for the connection to complete.
    pub timeout: Duration,
    /// Input buffer capacity of the new port.
    pub in_buffer: usize,
    /// Output buffer capacity of the new port.
    pub out_buffer: usize,
}

impl Default for ConnectOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_CONNECT_TIMEOUT,
            in_buffer: DEFAULT_BUFFER_SIZE,
            out_buffer: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Resolves backend endpoints and opens connections to them.
///
/// `open` must not block: it returns a port immediately and the reactor
/// reports completion later through the session's `connected` entry point.
pub trait Connector {
    /// Port type of opened connections.
    type Port: DuplexPort;

    /// Remote address of a backend. Equal endpoints share one backend.
    type Endpoint: Clone + PartialEq + Display + Debug;

    /// Pick a remote endpoint for the given frontend, or refuse.
    fn resolve(&mut self, frontend: &Self::Port) -> Option<Self::Endpoint>;

    /// Start connecting to `endpoint` on behalf of backend `id`.
    fn open(
        &mut self,
        id: BackendId,
        endpoint: &Self::Endpoint,
        options: &ConnectOptions,
    ) -> io::Result<Self::Port>;
}
