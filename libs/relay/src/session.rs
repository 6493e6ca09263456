//! The frontend session.
//!
//! A [`Session`] owns the frontend connection and every backend agent opened
//! on its behalf. The reactor reports socket events through the entry points
//! ([`Session::readable`], [`Session::writable`], [`Session::connected`],
//! [`Session::exception`], [`Session::closed`], [`Session::removed`]); each
//! one queues a task and drains the task queue before returning.
//!
//! Continuations such as "the backend queue drained, read more frontend
//! input" are queued as tasks instead of being called recursively, so stack
//! depth stays flat however the traffic is chunked.

use std::collections::VecDeque;
use std::io;

use tracing::{debug, error, info, trace, warn};

use crate::backend::{BackendAgent, BackendWrite};
use crate::connector::{ConnectOptions, Connector};
use crate::error::RelayError;
use crate::flow::Drain;
use crate::frame::{self, FrameAssembler, Input};
use crate::port::DuplexPort;
use crate::protocol::{Peer, Protocol, Target};
use crate::table::{BackendId, BackendTable, DEFAULT_MAX_BACKENDS};

/// Backend agent type used by a session.
pub type SessionBackend<M, C> = BackendAgent<
    <C as Connector>::Port,
    <M as Protocol>::Sub,
    <C as Connector>::Endpoint,
>;

/// Session tuning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Maximum number of live backends.
    pub max_backends: usize,
    /// Options passed to the connector for every new backend.
    pub connect: ConnectOptions,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_backends: DEFAULT_MAX_BACKENDS,
            connect: ConnectOptions::default(),
        }
    }
}

/// Counters describing a session's lifetime.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SessionStats {
    /// Backend connections opened.
    pub backends_opened: u64,
    /// Backend selections that reused a live backend.
    pub backends_reused: u64,
    /// Frontend messages dropped because no backend could be chosen.
    pub messages_dropped: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Task {
    ReadFrontend,
    ReadBackend(BackendId),
    WriteBackend(BackendId),
    WriteFrontend,
}

/// One frontend connection and the backends it fans out to.
pub struct Session<M, C>
where
    M: Protocol,
    C: Connector,
{
    protocol: M,
    connector: C,
    config: SessionConfig,
    frontend: C::Port,
    frontend_sub: M::Sub,
    partial: Option<FrameAssembler>,
    backends: BackendTable<SessionBackend<M, C>>,
    /// Backend currently holding the right to write to the frontend.
    writer: Option<BackendId>,
    /// Last backend that finished a frontend write; the next scan starts
    /// after it.
    last_writer: Option<BackendId>,
    tasks: VecDeque<Task>,
    closed: bool,
    close_reason: Option<RelayError>,
    stats: SessionStats,
}

impl<M, C> Session<M, C>
where
    M: Protocol,
    C: Connector,
{
    /// Create a session for an accepted frontend connection.
    pub fn new(frontend: C::Port, mut protocol: M, connector: C, config: SessionConfig) -> Self {
        let frontend_sub = protocol.new_sub(Peer::Frontend);
        Self {
            backends: BackendTable::with_capacity(config.max_backends),
            protocol,
            connector,
            config,
            frontend,
            frontend_sub,
            partial: None,
            writer: None,
            last_writer: None,
            tasks: VecDeque::new(),
            closed: false,
            close_reason: None,
            stats: SessionStats::default(),
        }
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// The error that closed the session, if it was closed by one.
    pub fn close_reason(&self) -> Option<&RelayError> {
        self.close_reason.as_ref()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn protocol(&self) -> &M {
        &self.protocol
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }

    pub fn connector_mut(&mut self) -> &mut C {
        &mut self.connector
    }

    pub fn frontend(&self) -> &C::Port {
        &self.frontend
    }

    pub fn frontend_sub(&self) -> &M::Sub {
        &self.frontend_sub
    }

    pub fn backend(&self, id: BackendId) -> Option<&SessionBackend<M, C>> {
        self.backends.get(id)
    }

    /// Ids of live backends in ascending order.
    pub fn backend_ids(&self) -> Vec<BackendId> {
        self.backends.ids().collect()
    }

    pub fn backend_count(&self) -> usize {
        self.backends.len()
    }

    /// Backend currently holding the frontend write pointer.
    pub fn current_writer(&self) -> Option<BackendId> {
        self.writer
    }

    /// The port behind a peer, for the reactor to fill and flush.
    pub fn port(&self, peer: Peer) -> Option<&C::Port> {
        match peer {
            Peer::Frontend => Some(&self.frontend),
            Peer::Backend(id) => self.backends.get(id).map(BackendAgent::port),
        }
    }

    pub fn port_mut(&mut self, peer: Peer) -> Option<&mut C::Port> {
        match peer {
            Peer::Frontend => Some(&mut self.frontend),
            Peer::Backend(id) => self.backends.get_mut(id).map(BackendAgent::port_mut),
        }
    }

    // =========================================================================
    // Reactor entry points
    // =========================================================================

    /// New input is buffered on `peer`.
    pub fn readable(&mut self, peer: Peer) {
        let task = match peer {
            Peer::Frontend => Task::ReadFrontend,
            Peer::Backend(id) => Task::ReadBackend(id),
        };
        self.schedule(task);
        self.pump();
    }

    /// Output space became available on `peer`.
    pub fn writable(&mut self, peer: Peer) {
        let task = match peer {
            Peer::Frontend => Task::WriteFrontend,
            Peer::Backend(id) => Task::WriteBackend(id),
        };
        self.schedule(task);
        self.pump();
    }

    /// The outbound connection for backend `id` is established.
    pub fn connected(&mut self, id: BackendId) {
        if self.closed {
            return;
        }
        let Some(agent) = self.backends.get_mut(id) else {
            debug!(backend_id = %id, "connect completed for unknown backend");
            return;
        };
        agent.mark_connected();
        debug!(backend_id = %id, endpoint = %agent.endpoint(), "backend connected");
        self.schedule(Task::WriteBackend(id));
        self.pump();
    }

    /// A socket-level error occurred on `peer`.
    pub fn exception(&mut self, peer: Peer, err: io::Error) {
        if self.closed {
            return;
        }
        match peer {
            Peer::Frontend => error!(error = %err, "frontend connection error"),
            Peer::Backend(id) => {
                error!(backend_id = %id, error = %err, "backend connection error, closing frontend")
            }
        }
        self.close_reason = Some(RelayError::Io(err));
        self.close_all();
    }

    /// `peer` was closed.
    pub fn closed(&mut self, peer: Peer) {
        match peer {
            Peer::Frontend => debug!("frontend connection closed"),
            Peer::Backend(id) if self.closed || self.frontend.is_closed() => {
                debug!(backend_id = %id, "backend connection closed after frontend");
            }
            Peer::Backend(id) => {
                error!(backend_id = %id, "backend connection closed before frontend connection");
            }
        }
        self.close_all();
    }

    /// `peer` was deregistered from the reactor.
    pub fn removed(&mut self, peer: Peer) {
        let still_open = match peer {
            Peer::Frontend => !self.frontend.is_closed(),
            Peer::Backend(id) => self
                .backends
                .get(id)
                .is_some_and(|agent| !agent.port().is_closed()),
        };
        if still_open {
            error!(?peer, "connection removed from reactor while still open");
        }
        self.close_all();
    }

    /// Close the frontend and every backend, discarding pending work.
    ///
    /// Safe to call any number of times.
    pub fn close_all(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        debug!(backends = self.backends.len(), "closing session");
        for (id, mut agent) in self.backends.drain() {
            trace!(backend_id = %id, "closing backend");
            agent.close();
        }
        self.frontend.close();
        self.partial = None;
        self.writer = None;
        self.tasks.clear();
    }

    // =========================================================================
    // Task queue
    // =========================================================================

    fn schedule(&mut self, task: Task) {
        if self.closed || self.tasks.contains(&task) {
            return;
        }
        self.tasks.push_back(task);
    }

    fn pump(&mut self) {
        while let Some(task) = self.tasks.pop_front() {
            if self.closed {
                break;
            }
            trace!(?task, "running task");
            let result = match task {
                Task::ReadFrontend => self.read_frontend(),
                Task::ReadBackend(id) => self.read_backend(id),
                Task::WriteBackend(id) => {
                    self.write_backend(id);
                    Ok(())
                }
                Task::WriteFrontend => {
                    self.write_frontend();
                    Ok(())
                }
            };
            if let Err(err) = result {
                self.fail(err);
            }
        }
        if self.closed {
            self.tasks.clear();
        }
    }

    fn fail(&mut self, err: RelayError) {
        match &err {
            RelayError::Protocol(_) => {
                warn!(reason = err.reason_code(), error = %err, "cannot handle input, closing session")
            }
            _ => error!(reason = err.reason_code(), error = %err, "closing session"),
        }
        self.close_reason = Some(err);
        self.close_all();
    }

    // =========================================================================
    // Frontend read path
    // =========================================================================

    fn read_frontend(&mut self) -> Result<(), RelayError> {
        loop {
            let input = frame::next_input(
                &self.protocol,
                &self.frontend_sub,
                &mut self.frontend,
                &mut self.partial,
            );
            match input {
                Input::Empty | Input::Partial => return Ok(()),
                Input::Proxy(0) => {
                    self.protocol.on_proxy_done(&mut self.frontend_sub);
                }
                Input::Proxy(len) => {
                    // Skipping a proxy region would need the framing the
                    // protocol declined to do, so a missing backend is fatal.
                    let id = self.route()?;
                    trace!(backend_id = %id, len, "proxying frontend input");
                    self.agent_mut(id)?.proxy_to_backend(len);
                    self.schedule(Task::WriteBackend(id));
                    return Ok(());
                }
                Input::Frame(data) => {
                    trace!(len = data.len(), "feeding frontend frame");
                    let empty_frame = data.is_empty();
                    let reply = self.protocol.feed(&mut self.frontend_sub, data)?;
                    // Zero-length frames only advance protocol state.
                    if empty_frame {
                        continue;
                    }
                    let reply = reply.filter(|b| !b.is_empty());

                    // A backend is picked even when the frame produced nothing
                    // to send, so its connect payload goes out right away.
                    match self.route() {
                        Ok(id) => {
                            let Some(reply) = reply else {
                                continue;
                            };
                            self.agent_mut(id)?.write_to_backend(reply);
                            self.schedule(Task::WriteBackend(id));
                            return Ok(());
                        }
                        Err(err) if err.is_recoverable() => {
                            self.stats.messages_dropped += 1;
                            warn!(
                                reason = err.reason_code(),
                                error = %err,
                                len = reply.as_ref().map_or(0, |b| b.len()),
                                "dropping frontend message"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    fn agent_mut(&mut self, id: BackendId) -> Result<&mut SessionBackend<M, C>, RelayError> {
        self.backends
            .get_mut(id)
            .ok_or(RelayError::UnknownBackend(id))
    }

    // =========================================================================
    // Pool selection
    // =========================================================================

    fn route(&mut self) -> Result<BackendId, RelayError> {
        match self.protocol.target(&self.frontend_sub) {
            Target::Backend(id) if self.backends.contains(id) => Ok(id),
            Target::Backend(id) => Err(RelayError::UnknownBackend(id)),
            Target::Select => self.select_backend(),
        }
    }

    fn select_backend(&mut self) -> Result<BackendId, RelayError> {
        let Some(endpoint) = self.connector.resolve(&self.frontend) else {
            info!("connector refused to provide a remote endpoint");
            return Err(RelayError::NoEndpoint);
        };

        let pooled = self
            .backends
            .iter()
            .find(|(_, agent)| *agent.endpoint() == endpoint)
            .map(|(id, _)| id);
        if let Some(id) = pooled {
            let agent = self
                .backends
                .get(id)
                .ok_or(RelayError::UnknownBackend(id))?;
            self.protocol
                .on_backend_selected(&mut self.frontend_sub, agent.sub());
            self.stats.backends_reused += 1;
            debug!(backend_id = %id, %endpoint, "reusing pooled backend");
            return Ok(id);
        }

        let id = self.backends.next_id()?;
        let port = self
            .connector
            .open(id, &endpoint, &self.config.connect)
            .map_err(|source| RelayError::Connect {
                endpoint: endpoint.to_string(),
                source,
            })?;
        info!(backend_id = %id, %endpoint, "opening backend connection");

        let sub = self.protocol.new_sub(Peer::Backend(id));
        let id = self
            .backends
            .insert_with(|id| BackendAgent::new(id, endpoint, port, sub))?;
        self.stats.backends_opened += 1;

        let agent = self
            .backends
            .get_mut(id)
            .ok_or(RelayError::UnknownBackend(id))?;
        if let Some(greeting) = self
            .protocol
            .on_backend_connected(agent.sub_mut())
            .filter(|b| !b.is_empty())
        {
            agent.write_to_backend(greeting);
        }
        self.protocol
            .on_backend_selected(&mut self.frontend_sub, agent.sub());

        Ok(id)
    }

    // =========================================================================
    // Backend paths
    // =========================================================================

    fn read_backend(&mut self, id: BackendId) -> Result<(), RelayError> {
        let Some(agent) = self.backends.get_mut(id) else {
            debug!(backend_id = %id, "read for unknown backend");
            return Ok(());
        };
        let outcome = agent.read(&mut self.protocol)?;
        if outcome.to_backend {
            self.schedule(Task::WriteBackend(id));
        }
        if outcome.to_frontend {
            self.schedule(Task::WriteFrontend);
        }
        Ok(())
    }

    fn write_backend(&mut self, id: BackendId) {
        let Some(agent) = self.backends.get_mut(id) else {
            debug!(backend_id = %id, "write for unknown backend");
            return;
        };
        let result = agent.write_backend(
            &mut self.frontend,
            &mut self.frontend_sub,
            &mut self.protocol,
        );
        if result == BackendWrite::Drained(Drain::Done) {
            // More frontend input may be waiting on this queue.
            self.schedule(Task::ReadFrontend);
        }
    }

    // =========================================================================
    // Frontend write arbiter
    // =========================================================================

    fn write_frontend(&mut self) {
        loop {
            let id = match self.writer {
                Some(id) => id,
                None => {
                    let next = self
                        .backends
                        .find_after(self.last_writer, |agent| agent.has_frontend_work());
                    match next {
                        Some(id) => id,
                        None => return,
                    }
                }
            };
            self.writer = Some(id);

            let Some(agent) = self.backends.get_mut(id) else {
                self.writer = None;
                continue;
            };
            match agent.write_frontend(&mut self.frontend, &mut self.protocol) {
                Drain::Done => {
                    self.writer = None;
                    self.last_writer = Some(id);
                    self.schedule(Task::ReadBackend(id));
                }
                Drain::Blocked | Drain::Starved => return,
            }
        }
    }
}
