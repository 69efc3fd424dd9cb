//! Connection Context state machine.
//!
//! Each connection owns its stream, a round buffer and its position in the
//! round sequence. Both roles run the same machine; they differ only in which
//! direction the first round goes. Every step reports a [`Step`] and the
//! driver (connector or acceptor) performs registration and teardown.

use crate::error::Error;
use crate::runtime::buffer::RoundBuffer;
use crate::runtime::io::{attempt_receive, attempt_send, Transfer};
use crate::sequence::{generate, validate, RoundSequence};
use mio::Interest;
use slab::Slab;
use std::fmt;
use std::io::{Read, Write};
use std::time::Duration;
use tracing::{debug, error};

/// Which side of the exchange a connection plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Outbound client connection; reads the first round.
    Connector,
    /// Accepted server connection; writes the first round.
    Acceptor,
}

impl Role {
    fn first_direction(self) -> Direction {
        match self {
            Role::Connector => Direction::Read,
            Role::Acceptor => Direction::Write,
        }
    }
}

/// Transfer direction of a round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Read,
    Write,
}

impl Direction {
    pub fn opposite(self) -> Self {
        match self {
            Direction::Read => Direction::Write,
            Direction::Write => Direction::Read,
        }
    }

    /// Readiness interest that unblocks this direction.
    pub fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

impl fmt::Display for Direction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Direction::Read => "read",
            Direction::Write => "write",
        })
    }
}

/// Current phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// Outbound connect in flight (connector only).
    Connecting,
    /// Receiving the current round.
    AwaitingRead,
    /// Sending the current round.
    AwaitingWrite,
    /// Torn down; no further I/O.
    Closed,
}

impl Phase {
    fn direction(self) -> Option<Direction> {
        match self {
            Phase::AwaitingRead => Some(Direction::Read),
            Phase::AwaitingWrite => Some(Direction::Write),
            Phase::Connecting | Phase::Closed => None,
        }
    }
}

/// What the driver must do after a step.
#[derive(Debug)]
pub enum Step {
    /// Suspended mid-round; arm readiness for this direction.
    Pending(Direction),
    /// Round limit reached; close without error.
    Finished,
    /// Connection failed; the context is already `Closed`.
    Failed(Error),
}

/// A single connection and its round state.
#[derive(Debug)]
pub struct Connection<S> {
    stream: S,
    role: Role,
    phase: Phase,
    buffer: RoundBuffer,
    rounds: RoundSequence,
    /// Bytes moved so far in the current round.
    progress: usize,
    completed: u64,
    bytes: u64,
    limit: Option<u64>,
}

impl<S: Read + Write> Connection<S> {
    /// Create a context for `stream`.
    ///
    /// A connector starts in `Connecting`; an acceptor has its first round
    /// staged for writing straight away.
    pub fn new(stream: S, role: Role, max_round: usize) -> Result<Self, Error> {
        let mut conn = Self {
            stream,
            role,
            phase: Phase::Connecting,
            buffer: RoundBuffer::try_new(max_round)?,
            rounds: RoundSequence::new(max_round),
            progress: 0,
            completed: 0,
            bytes: 0,
            limit: None,
        };
        if role == Role::Acceptor {
            conn.enter(Direction::Write);
        }
        Ok(conn)
    }

    /// Close cleanly after `limit` completed rounds.
    pub fn with_limit(mut self, limit: Option<u64>) -> Self {
        self.limit = limit.filter(|&n| n > 0);
        self
    }

    /// Begin the exchange: leave `Connecting` if needed and run the first
    /// round as far as the stream allows.
    pub fn start(&mut self) -> Step {
        if self.phase == Phase::Connecting {
            self.enter(self.role.first_direction());
        }
        self.resume()
    }

    /// Continue after a readiness notification.
    ///
    /// Runs rounds back to back until the stream would block, the round
    /// limit is hit, or the connection fails.
    pub fn resume(&mut self) -> Step {
        loop {
            let direction = match self.phase.direction() {
                Some(direction) => direction,
                // Still waiting for the outbound connect to complete.
                None if self.phase == Phase::Connecting => return Step::Pending(Direction::Write),
                None => return Step::Finished,
            };

            let n = self.rounds.current();
            let target = self.rounds.current_bytes();
            let transfer = match direction {
                Direction::Read => attempt_receive(
                    &mut self.stream,
                    self.buffer.bytes_mut(n),
                    target,
                    &mut self.progress,
                ),
                Direction::Write => attempt_send(
                    &mut self.stream,
                    self.buffer.bytes(n),
                    target,
                    &mut self.progress,
                ),
            };

            match transfer {
                Transfer::Complete => {}
                Transfer::WouldBlock => return Step::Pending(direction),
                Transfer::PeerClosed => {
                    return self.fail(Error::PeerShutdown {
                        direction,
                        progress: self.progress,
                        target,
                    })
                }
                Transfer::Fatal(source) => return self.fail(Error::Io { direction, source }),
            }

            if let Err(e) = self.finish_round(direction) {
                return self.fail(e);
            }

            if self.limit.is_some_and(|limit| self.completed >= limit) {
                self.phase = Phase::Closed;
                return Step::Finished;
            }

            self.enter(direction.opposite());
        }
    }

    /// Abort the pending round because its timeout expired.
    pub fn timed_out(&mut self, after: Duration) -> Error {
        let direction = self.phase.direction().unwrap_or(Direction::Write);
        self.phase = Phase::Closed;
        Error::IoTimeout { direction, after }
    }

    /// Stage the current round for `direction` and reset progress.
    fn enter(&mut self, direction: Direction) {
        let n = self.rounds.current();
        match direction {
            Direction::Read => {
                self.buffer.clear(n);
                self.phase = Phase::AwaitingRead;
            }
            Direction::Write => {
                generate(n, self.buffer.words_mut(n));
                self.phase = Phase::AwaitingWrite;
            }
        }
        self.progress = 0;
    }

    /// Validate a completed read, then advance to the next round size.
    fn finish_round(&mut self, direction: Direction) -> Result<(), Error> {
        let n = self.rounds.current();
        if direction == Direction::Read {
            let words = self.buffer.words(n);
            if let Err(mismatch) = validate(n, words) {
                error!(round = n, %mismatch, "Received incorrect data");
                for (i, actual) in words.iter().enumerate() {
                    error!("buf[{i}] == {actual} != {i}");
                }
                return Err(Error::Integrity { round: n, mismatch });
            }
        }

        debug!(%direction, round = n, completed = self.completed + 1, "Round complete");
        self.completed += 1;
        self.bytes += self.progress as u64;
        self.rounds.advance();
        Ok(())
    }

    fn fail(&mut self, e: Error) -> Step {
        self.phase = Phase::Closed;
        Step::Failed(e)
    }
}

impl<S> Connection<S> {
    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    /// Element count of the round in progress.
    pub fn expected(&self) -> usize {
        self.rounds.current()
    }

    pub fn progress(&self) -> usize {
        self.progress
    }

    /// Rounds completed in either direction.
    pub fn completed_rounds(&self) -> u64 {
        self.completed
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.bytes
    }
}

/// Registry of live connections using slab allocation.
///
/// The slab index doubles as the readiness token.
pub struct ConnectionRegistry<S> {
    connections: Slab<Connection<S>>,
    max_connections: usize,
}

impl<S> ConnectionRegistry<S> {
    /// Create a new registry with specified maximum capacity.
    pub fn new(max_connections: usize) -> Self {
        Self {
            connections: Slab::with_capacity(max_connections.min(1024)),
            max_connections,
        }
    }

    /// Insert a new connection.
    ///
    /// Fails when the registry is at capacity; the connection is dropped.
    pub fn insert(&mut self, conn: Connection<S>) -> Result<usize, Error> {
        if self.connections.len() >= self.max_connections {
            return Err(Error::RegistryFull(self.max_connections));
        }
        Ok(self.connections.insert(conn))
    }

    pub fn get_mut(&mut self, id: usize) -> Option<&mut Connection<S>> {
        self.connections.get_mut(id)
    }

    /// Remove a connection, handing back ownership for teardown.
    pub fn remove(&mut self, id: usize) -> Option<Connection<S>> {
        self.connections.try_remove(id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
