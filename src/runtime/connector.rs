//! Client role: one outbound connection that reads the first round.

use crate::config::{Config, Timeouts};
use crate::error::{Error, Result};
use crate::runtime::connection::{Connection, Phase, Role, Step};
use crate::runtime::reactor::{Notification, NotificationKind, Reactor};
use crate::runtime::{socket, Direction};
use mio::net::TcpStream;
use mio::Token;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const CONNECTION: Token = Token(0);

/// How a connected session ended.
#[derive(Debug)]
pub struct Session {
    pub rounds: u64,
    pub bytes: u64,
    /// `None` when the round limit was reached.
    pub error: Option<Error>,
}

/// Drives the single client connection.
pub struct Connector {
    reactor: Reactor,
    connection: Option<Connection<TcpStream>>,
    timeouts: Timeouts,
    /// Fixed when the connect starts; spurious wakeups do not extend it.
    connect_deadline: Instant,
    session: Option<Session>,
}

impl Connector {
    /// Start connecting to `addr` and wait for writability with the connect
    /// timeout.
    pub fn connect(addr: SocketAddr, config: &Config) -> Result<Self> {
        let mut reactor = Reactor::new().map_err(Error::setup("poll"))?;
        let connect_deadline = Instant::now() + config.timeouts.connect;
        let stream = socket::connect(addr)?;
        let mut connection =
            Connection::new(stream, Role::Connector, config.max_round)?.with_limit(config.rounds);

        reactor
            .arm(
                connection.stream_mut(),
                CONNECTION,
                Direction::Write,
                config.timeouts.connect,
            )
            .map_err(Error::setup("register"))?;

        debug!(addr = %addr, "Connect in progress");
        Ok(Self {
            reactor,
            connection: Some(connection),
            timeouts: config.timeouts,
            connect_deadline,
            session: None,
        })
    }

    /// Run until the session ends.
    ///
    /// Connect failures are returned as errors. Once connected, the
    /// connection ending for any reason is a normal end of session.
    pub fn run(&mut self) -> Result<Session> {
        loop {
            if let Some(session) = self.session.take() {
                return Ok(session);
            }
            self.turn(None)?;
        }
    }

    /// One reactor iteration: wait at most `limit`, then handle everything
    /// that became ready or timed out.
    pub fn turn(&mut self, limit: Option<Duration>) -> Result<()> {
        if self.connection.is_none() {
            return Ok(());
        }
        self.reactor.poll(limit).map_err(Error::setup("poll"))?;
        while let Some(notification) = self.reactor.next() {
            self.dispatch(notification)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub fn is_finished(&self) -> bool {
        self.connection.is_none()
    }

    #[cfg(test)]
    pub fn take_session(&mut self) -> Option<Session> {
        self.session.take()
    }

    fn dispatch(&mut self, notification: Notification) -> Result<()> {
        let Some(conn) = self.connection.as_mut() else {
            return Ok(());
        };

        let step = match (conn.phase(), notification.kind) {
            (Phase::Connecting, NotificationKind::Timeout { .. }) => {
                warn!("Timeout connect");
                self.abandon();
                return Err(Error::ConnectTimeout(self.timeouts.connect));
            }
            (Phase::Connecting, NotificationKind::Ready(_)) => {
                match socket::connect_result(conn.stream()) {
                    Ok(true) => {
                        info!(peer = ?conn.stream().peer_addr().ok(), "Connected");
                        conn.start()
                    }
                    Ok(false) => Step::Pending(Direction::Write),
                    Err(e) => {
                        self.abandon();
                        return Err(e);
                    }
                }
            }
            (_, NotificationKind::Ready(_)) => conn.resume(),
            (_, NotificationKind::Timeout { after, .. }) => Step::Failed(conn.timed_out(after)),
        };

        self.apply(step);
        Ok(())
    }

    fn apply(&mut self, step: Step) {
        let Some(conn) = self.connection.as_mut() else {
            return;
        };
        match step {
            Step::Pending(direction) => {
                let timeout = match conn.phase() {
                    Phase::Connecting => self
                        .connect_deadline
                        .saturating_duration_since(Instant::now()),
                    _ => self.timeouts.for_direction(direction),
                };
                let armed = self
                    .reactor
                    .arm(conn.stream_mut(), CONNECTION, direction, timeout);
                if let Err(source) = armed {
                    self.close(Some(Error::Io { direction, source }));
                }
            }
            Step::Finished => self.close(None),
            Step::Failed(e) => self.close(Some(e)),
        }
    }

    /// Tear down the connected session and record how it ended.
    fn close(&mut self, error: Option<Error>) {
        let Some(mut conn) = self.connection.take() else {
            return;
        };
        let _ = self.reactor.release(conn.stream_mut(), CONNECTION);

        let (rounds, bytes) = (conn.completed_rounds(), conn.bytes_transferred());
        match &error {
            Some(e) => warn!(
                rounds,
                bytes,
                expected = conn.expected(),
                progress = conn.progress(),
                error = %e,
                "Connection closed"
            ),
            None => info!(rounds, bytes, "Round limit reached"),
        }
        self.session = Some(Session {
            rounds,
            bytes,
            error,
        });
    }

    /// Drop a connection that never got established.
    fn abandon(&mut self) {
        if let Some(mut conn) = self.connection.take() {
            let _ = self.reactor.release(conn.stream_mut(), CONNECTION);
        }
    }
}
