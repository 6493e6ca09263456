//! # plexus-relay
//!
//! Protocol-aware relay core. A frontend [`Session`] sits between one client
//! connection and a pool of backend connections, and a pluggable
//! [`Protocol`] decides how bytes cross between them.
//!
//! ## Layout
//!
//! - [`port`]: the [`DuplexPort`] buffer contract and an in-memory port
//! - [`flow`]: ordered segment queues ([`ByteFlow`])
//! - [`protocol`]: the [`Protocol`] trait and routing types
//! - [`connector`]: endpoint resolution and outbound connections
//! - [`table`]: backend id allocation and storage
//! - [`backend`]: per-backend queues and read paths
//! - [`session`]: the frontend coordinator
//!
//! The crate does no I/O of its own. A reactor fills and flushes port
//! buffers and reports readiness through the session entry points.

pub mod backend;
pub mod connector;
mod error;
pub mod flow;
mod frame;
pub mod port;
pub mod protocol;
pub mod session;
pub mod table;

pub use backend::BackendAgent;
pub use connector::{ConnectOptions, Connector, DEFAULT_BUFFER_SIZE, DEFAULT_CONNECT_TIMEOUT};
pub use error::{ProtocolError, RelayError};
pub use flow::{ByteFlow, Drain, Segment, Step};
pub use port::{BufferedPort, DuplexPort, RingBuffer};
pub use protocol::{Mode, Peer, Protocol, Target};
pub use session::{Session, SessionBackend, SessionConfig, SessionStats};
pub use table::{BackendId, BackendTable, DEFAULT_MAX_BACKENDS};
