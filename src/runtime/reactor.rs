//! Readiness reactor over `mio`.
//!
//! `mio` reports readiness edges and nothing else. This layer adds what the
//! connection drivers rely on:
//!
//! - a timeout on every registration, delivered as its own notification,
//! - oneshot registrations that are consumed by the first notification,
//! - persistent registrations (the listener) whose deadline is pushed forward
//!   on every readiness event,
//! - arming a token again replaces whatever was pending for it.
//!
//! Notifications are handed out one at a time through [`Reactor::next`], and
//! pending state is checked at hand-out time, so a registration cancelled
//! while a batch is being processed never fires.

use crate::runtime::Direction;
use mio::event::Source;
use mio::{Events, Interest, Poll, Token};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::io;
use std::time::{Duration, Instant};

/// Event batch size per poll.
const EVENT_CAPACITY: usize = 1024;

/// A notification for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Notification {
    pub token: Token,
    pub kind: NotificationKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    /// The source is ready in the armed direction.
    Ready(Direction),
    /// No readiness arrived before the deadline. The registration is gone.
    Timeout { direction: Direction, after: Duration },
}

#[derive(Debug, Clone, Copy)]
struct Registration {
    direction: Direction,
    timeout: Duration,
    deadline: Instant,
    persistent: bool,
}

#[derive(Debug, Clone, Copy)]
struct Readiness {
    readable: bool,
    writable: bool,
}

/// Single-threaded readiness reactor.
pub struct Reactor {
    poll: Poll,
    events: Events,
    pending: HashMap<Token, Registration>,
    deadlines: BTreeSet<(Instant, Token)>,
    /// Interest currently registered with the OS, per token.
    interests: HashMap<Token, Interest>,
    ready: VecDeque<(Token, Readiness)>,
    polled_at: Instant,
}

impl Reactor {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            poll: Poll::new()?,
            events: Events::with_capacity(EVENT_CAPACITY),
            pending: HashMap::new(),
            deadlines: BTreeSet::new(),
            interests: HashMap::new(),
            ready: VecDeque::new(),
            polled_at: Instant::now(),
        })
    }

    /// Arm a oneshot registration for `direction`, replacing any pending one.
    pub fn arm<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        direction: Direction,
        timeout: Duration,
    ) -> io::Result<()> {
        self.set_interest(source, token, direction.interest())?;
        self.insert(token, direction, timeout, false);
        Ok(())
    }

    /// Arm a persistent readable registration.
    pub fn arm_persistent<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        timeout: Duration,
    ) -> io::Result<()> {
        self.set_interest(source, token, Interest::READABLE)?;
        self.insert(token, Direction::Read, timeout, true);
        Ok(())
    }

    /// Drop the pending registration for `token`, if any.
    ///
    /// The source stays registered with the OS; its events are ignored until
    /// the token is armed again.
    pub fn cancel(&mut self, token: Token) -> bool {
        match self.pending.remove(&token) {
            Some(reg) => {
                self.deadlines.remove(&(reg.deadline, token));
                true
            }
            None => false,
        }
    }

    /// Forget `token` entirely and deregister its source.
    pub fn release<S: Source + ?Sized>(&mut self, source: &mut S, token: Token) -> io::Result<()> {
        self.cancel(token);
        self.ready.retain(|&(t, _)| t != token);
        if self.interests.remove(&token).is_some() {
            self.poll.registry().deregister(source)?;
        }
        Ok(())
    }

    /// Whether `token` has a registration waiting to fire.
    #[cfg(test)]
    pub fn is_armed(&self, token: Token) -> bool {
        self.pending.contains_key(&token)
    }

    #[cfg(test)]
    pub fn deadline(&self, token: Token) -> Option<Instant> {
        self.pending.get(&token).map(|reg| reg.deadline)
    }

    /// Wait for readiness or the nearest deadline, whichever is first.
    ///
    /// `limit` caps the wait; `None` waits as long as the deadlines allow,
    /// forever if nothing is armed.
    pub fn poll(&mut self, limit: Option<Duration>) -> io::Result<()> {
        let now = Instant::now();
        let until_deadline = self
            .deadlines
            .first()
            .map(|&(deadline, _)| deadline.saturating_duration_since(now));
        let wait = match (limit, until_deadline) {
            (Some(limit), Some(deadline)) => Some(limit.min(deadline)),
            (limit, deadline) => limit.or(deadline),
        };

        match self.poll.poll(&mut self.events, wait) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }

        for event in self.events.iter() {
            let failed = event.is_error();
            self.ready.push_back((
                event.token(),
                Readiness {
                    readable: event.is_readable() || event.is_read_closed() || failed,
                    writable: event.is_writable() || event.is_write_closed() || failed,
                },
            ));
        }
        self.polled_at = Instant::now();
        Ok(())
    }

    /// Next notification from the last poll, or `None` when drained.
    ///
    /// Readiness is handed out before timeouts, so a registration that became
    /// ready in the same poll that its deadline passed counts as ready.
    pub fn next(&mut self) -> Option<Notification> {
        while let Some((token, readiness)) = self.ready.pop_front() {
            let Some(reg) = self.pending.get(&token).copied() else {
                continue;
            };
            let ready = match reg.direction {
                Direction::Read => readiness.readable,
                Direction::Write => readiness.writable,
            };
            if !ready {
                continue;
            }

            if reg.persistent {
                self.insert(token, reg.direction, reg.timeout, true);
            } else {
                self.cancel(token);
            }
            return Some(Notification {
                token,
                kind: NotificationKind::Ready(reg.direction),
            });
        }

        while let Some(&(deadline, token)) = self.deadlines.first() {
            if deadline > self.polled_at {
                return None;
            }
            self.deadlines.pop_first();
            if let Some(reg) = self.pending.remove(&token) {
                return Some(Notification {
                    token,
                    kind: NotificationKind::Timeout {
                        direction: reg.direction,
                        after: reg.timeout,
                    },
                });
            }
        }
        None
    }

    fn set_interest<S: Source + ?Sized>(
        &mut self,
        source: &mut S,
        token: Token,
        interest: Interest,
    ) -> io::Result<()> {
        match self.interests.get(&token) {
            Some(&current) if current == interest => return Ok(()),
            Some(_) => self.poll.registry().reregister(source, token, interest)?,
            None => self.poll.registry().register(source, token, interest)?,
        }
        self.interests.insert(token, interest);
        Ok(())
    }

    fn insert(&mut self, token: Token, direction: Direction, timeout: Duration, persistent: bool) {
        self.cancel(token);
        let deadline = Instant::now() + timeout;
        self.pending.insert(
            token,
            Registration {
                direction,
                timeout,
                deadline,
                persistent,
            },
        );
        self.deadlines.insert((deadline, token));
    }
}
