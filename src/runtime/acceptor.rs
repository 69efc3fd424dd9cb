//! Server role: accepts connections and writes the first round to each.
//!
//! The listener keeps a persistent readable registration. Every readiness
//! notification drains the accept queue completely before returning, so a
//! burst of connects is handled in one callback rather than one per turn.

use crate::config::{Config, Timeouts};
use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, ConnectionRegistry, Role, Step};
use crate::runtime::reactor::{Notification, NotificationKind, Reactor};
use crate::runtime::socket;
use mio::net::{TcpListener, TcpStream};
use mio::Token;
use std::io;
use std::net::SocketAddr;
use std::time::Duration;
use tracing::{debug, error, info, warn};

const LISTENER_TOKEN: Token = Token(usize::MAX);

/// Lifetime counters for the acceptor.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct AcceptorStats {
    pub accepted: u64,
    /// Connections dropped at accept time (allocation or registry limit).
    pub dropped: u64,
    /// Connections torn down after starting.
    pub closed: u64,
    pub accept_timeouts: u64,
}

/// Drives the listener and every accepted connection.
pub struct Acceptor {
    reactor: Reactor,
    listener: TcpListener,
    connections: ConnectionRegistry<TcpStream>,
    max_round: usize,
    timeouts: Timeouts,
    stats: AcceptorStats,
}

impl Acceptor {
    /// Bind and listen on `addr`, then arm the listener.
    pub fn bind(addr: SocketAddr, config: &Config) -> Result<Self> {
        let mut reactor = Reactor::new().map_err(Error::setup("poll"))?;
        let mut listener = socket::listen(addr, config.backlog)?;
        reactor
            .arm_persistent(&mut listener, LISTENER_TOKEN, config.timeouts.accept)
            .map_err(Error::setup("register"))?;

        let local = listener.local_addr().map_err(Error::setup("listen"))?;
        info!(
            addr = %local,
            max_connections = config.max_connections,
            "Listening"
        );
        Ok(Self {
            reactor,
            listener,
            connections: ConnectionRegistry::new(config.max_connections),
            max_round: config.max_round,
            timeouts: config.timeouts,
            stats: AcceptorStats::default(),
        })
    }

    #[cfg(test)]
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve forever. Only listener-level failures return.
    pub fn run(&mut self) -> Result<()> {
        loop {
            self.turn(None)?;
        }
    }

    /// One reactor iteration: wait at most `limit`, then handle everything
    /// that became ready or timed out.
    pub fn turn(&mut self, limit: Option<Duration>) -> Result<()> {
        self.reactor.poll(limit).map_err(Error::setup("poll"))?;
        while let Some(notification) = self.reactor.next() {
            self.dispatch(notification)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    #[cfg(test)]
    pub fn stats(&self) -> AcceptorStats {
        self.stats
    }

    fn dispatch(&mut self, notification: Notification) -> Result<()> {
        match (notification.token, notification.kind) {
            (LISTENER_TOKEN, NotificationKind::Ready(_)) => self.accept_connections(),
            (LISTENER_TOKEN, NotificationKind::Timeout { .. }) => {
                self.stats.accept_timeouts += 1;
                debug!(
                    connections = self.connections.len(),
                    accepted = self.stats.accepted,
                    dropped = self.stats.dropped,
                    closed = self.stats.closed,
                    "Timeout accept"
                );
                self.reactor
                    .arm_persistent(&mut self.listener, LISTENER_TOKEN, self.timeouts.accept)
                    .map_err(Error::setup("register"))?;
            }
            (Token(conn_id), kind) => {
                let Some(conn) = self.connections.get_mut(conn_id) else {
                    return Ok(());
                };
                let step = match kind {
                    NotificationKind::Ready(_) => conn.resume(),
                    NotificationKind::Timeout { after, .. } => Step::Failed(conn.timed_out(after)),
                };
                self.apply(conn_id, step);
            }
        }
        Ok(())
    }

    fn accept_connections(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    info!(peer = %peer, "Accepted");
                    self.stats.accepted += 1;
                    self.open(stream, peer);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if is_per_connection(&e) => {
                    warn!(error = %e, "Accept failed, skipping connection");
                    self.stats.dropped += 1;
                }
                Err(e) => {
                    error!("Accept error: {}", e);
                    break;
                }
            }
        }
    }

    /// Give an accepted stream its own context and write the first round.
    fn open(&mut self, stream: TcpStream, peer: SocketAddr) {
        let inserted = Connection::new(stream, Role::Acceptor, self.max_round)
            .and_then(|conn| self.connections.insert(conn));
        let conn_id = match inserted {
            Ok(conn_id) => conn_id,
            Err(e) => {
                warn!(peer = %peer, error = %e, "Dropping connection");
                self.stats.dropped += 1;
                return;
            }
        };

        debug!(conn_id, peer = %peer, "Connection opened");
        let Some(conn) = self.connections.get_mut(conn_id) else {
            return;
        };
        let step = conn.start();
        self.apply(conn_id, step);
    }

    fn apply(&mut self, conn_id: usize, step: Step) {
        match step {
            Step::Pending(direction) => {
                let Some(conn) = self.connections.get_mut(conn_id) else {
                    return;
                };
                let timeout = self.timeouts.for_direction(direction);
                let armed = self
                    .reactor
                    .arm(conn.stream_mut(), Token(conn_id), direction, timeout);
                if let Err(source) = armed {
                    self.close(conn_id, Some(Error::Io { direction, source }));
                }
            }
            Step::Finished => self.close(conn_id, None),
            Step::Failed(e) => self.close(conn_id, Some(e)),
        }
    }

    /// Release a connection: deregister it, then drop its stream and buffer.
    fn close(&mut self, conn_id: usize, error: Option<Error>) {
        let Some(mut conn) = self.connections.remove(conn_id) else {
            return;
        };
        let _ = self.reactor.release(conn.stream_mut(), Token(conn_id));
        self.stats.closed += 1;

        let rounds = conn.completed_rounds();
        match error {
            Some(e) => warn!(
                conn_id,
                rounds,
                expected = conn.expected(),
                progress = conn.progress(),
                error = %e,
                "Connection closed"
            ),
            None => debug!(conn_id, rounds, "Connection closed"),
        }
    }
}

/// Accept errors that concern only the connection being dequeued. The drain
/// continues past these; the listener gets no new edge for what is queued.
fn is_per_connection(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::PermissionDenied
    )
}
