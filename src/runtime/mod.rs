//! Event-driven runtime for both roles.
//!
//! Readiness comes from mio (epoll on Linux, kqueue on macOS) through the
//! [`reactor`], which adds timeouts and oneshot delivery. Everything runs on
//! one thread; each notification touches only its own connection.
//!
//! - `Connector`: the client's single outbound connection
//! - `Acceptor`: the listener plus one context per accepted peer
//! - `Connection`: per-connection round state machine

mod acceptor;
mod buffer;
mod connection;
mod connector;
mod io;
mod reactor;
mod socket;

pub(crate) use acceptor::Acceptor;
pub(crate) use connection::Direction;
pub(crate) use connector::Connector;

use crate::config::Config;
use crate::error::Result;
use tracing::info;

/// Connect to `host:port` and exchange rounds until the connection ends.
pub fn run_client(config: &Config, host: &str, port: u16) -> Result<()> {
    let addr = socket::resolve(host, port)?;
    info!(addr = %addr, "Connecting");

    let session = Connector::connect(addr, config)?.run()?;
    info!(
        rounds = session.rounds,
        bytes = session.bytes,
        clean = session.error.is_none(),
        "Session finished"
    );
    Ok(())
}

/// Listen on `port` and serve connections until a listener-level failure.
pub fn run_server(config: &Config, port: u16) -> Result<()> {
    let addr = socket::resolve(&config.bind, port)?;
    Acceptor::bind(addr, config)?.run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Timeouts;
    use crate::error::Error;
    use crate::sequence::generate;
    use socket2::{Domain, Socket, Type};
    use std::io::{Read, Write};
    use std::net::{SocketAddr, TcpListener, TcpStream};
    use std::thread;
    use std::time::{Duration, Instant};

    const TURN: Option<Duration> = Some(Duration::from_millis(5));
    const BUDGET: Duration = Duration::from_secs(10);

    fn test_config(max_round: usize) -> Config {
        Config {
            max_round,
            timeouts: Timeouts {
                connect: Duration::from_secs(2),
                accept: Duration::from_secs(2),
                read: Duration::from_secs(2),
                write: Duration::from_secs(2),
            },
            ..Config::default()
        }
    }

    fn loopback() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn pattern_bytes(n: usize) -> Vec<u8> {
        let mut words = vec![0u32; n];
        generate(n, &mut words);
        bytemuck::cast_slice(&words).to_vec()
    }

    /// Turn the acceptor until `done` holds or the budget runs out.
    fn serve_until(acceptor: &mut Acceptor, mut done: impl FnMut(&Acceptor) -> bool) {
        let start = Instant::now();
        while !done(acceptor) {
            assert!(start.elapsed() < BUDGET, "acceptor condition never met");
            acceptor.turn(TURN).unwrap();
        }
    }

    /// A listener whose accept queue is already full, so further connects
    /// stay in flight until they time out.
    pub(super) fn saturated_listener() -> (Socket, Vec<Socket>, SocketAddr) {
        let listener = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
        listener.bind(&loopback().into()).unwrap();
        listener.listen(0).unwrap();
        let addr = listener.local_addr().unwrap().as_socket().unwrap();

        let fillers = (0..4)
            .map(|_| {
                let socket = Socket::new(Domain::IPV4, Type::STREAM, None).unwrap();
                socket.set_nonblocking(true).unwrap();
                let _ = socket.connect(&addr.into());
                socket
            })
            .collect();
        (listener, fillers, addr)
    }

    fn raw_peer(addr: SocketAddr) -> TcpStream {
        let peer = TcpStream::connect(addr).unwrap();
        peer.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
        peer
    }

    #[test]
    fn test_client_and_server_exchange_through_wrap() {
        let config = test_config(8);
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client_config = Config {
            rounds: Some(40),
            ..config.clone()
        };
        let mut connector = Connector::connect(addr, &client_config).unwrap();

        let start = Instant::now();
        while !connector.is_finished() {
            assert!(start.elapsed() < BUDGET, "session never finished");
            acceptor.turn(TURN).unwrap();
            connector.turn(TURN).unwrap();
        }

        let session = connector.take_session().unwrap();
        assert!(session.error.is_none(), "{:?}", session.error);
        assert_eq!(session.rounds, 40);
        // Sizes cycle 1..=8 five times.
        assert_eq!(session.bytes, 5 * 4 * (1..=8).sum::<u64>());

        // The server sees the client go away and releases its context.
        serve_until(&mut acceptor, |a| a.connection_count() == 0);
        let stats = acceptor.stats();
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.closed, 1);
    }

    #[test]
    fn test_server_handles_simultaneous_clients() {
        let config = test_config(5);
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let mut connectors: Vec<Connector> = (0..3u64)
            .map(|i| {
                let config = Config {
                    rounds: Some(10 + 2 * i),
                    ..config.clone()
                };
                Connector::connect(addr, &config).unwrap()
            })
            .collect();

        let start = Instant::now();
        while !connectors.iter().all(|c| c.is_finished()) {
            assert!(start.elapsed() < BUDGET, "sessions never finished");
            acceptor.turn(TURN).unwrap();
            for connector in &mut connectors {
                connector.turn(TURN).unwrap();
            }
        }

        for (i, connector) in connectors.iter_mut().enumerate() {
            let session = connector.take_session().unwrap();
            assert!(session.error.is_none(), "{:?}", session.error);
            assert_eq!(session.rounds, 10 + 2 * i as u64);
        }
        assert_eq!(acceptor.stats().accepted, 3);
    }

    #[test]
    fn test_server_read_timeout_closes_connection() {
        let mut config = test_config(8);
        config.timeouts.read = Duration::from_millis(50);
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();
        let started = Instant::now();
        let mut peer = raw_peer(acceptor.local_addr().unwrap());

        serve_until(&mut acceptor, |a| a.connection_count() == 1);
        let mut round = [0u8; 4];
        peer.read_exact(&mut round).unwrap();
        assert_eq!(round.to_vec(), pattern_bytes(1));

        // The peer never answers round 2.
        serve_until(&mut acceptor, |a| a.connection_count() == 0);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(acceptor.stats().closed, 1);

        let mut rest = Vec::new();
        peer.read_to_end(&mut rest).unwrap();
        assert!(rest.is_empty());
    }

    #[test]
    fn test_accept_timeout_rearms_listener() {
        let mut config = test_config(8);
        config.timeouts.accept = Duration::from_millis(20);
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();

        serve_until(&mut acceptor, |a| a.stats().accept_timeouts >= 3);
        assert_eq!(acceptor.connection_count(), 0);

        let mut peer = raw_peer(acceptor.local_addr().unwrap());
        serve_until(&mut acceptor, |a| a.stats().accepted == 1);
        let mut round = [0u8; 4];
        peer.read_exact(&mut round).unwrap();
        assert_eq!(round.to_vec(), pattern_bytes(1));
    }

    #[test]
    fn test_server_drops_connections_over_limit() {
        let config = Config {
            max_connections: 1,
            ..test_config(8)
        };
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let _first = raw_peer(addr);
        let mut second = raw_peer(addr);
        serve_until(&mut acceptor, |a| a.stats().accepted == 2);

        let stats = acceptor.stats();
        assert_eq!(stats.dropped, 1);
        assert_eq!(acceptor.connection_count(), 1);

        let mut rest = Vec::new();
        let _ = second.read_to_end(&mut rest);
        assert!(rest.is_empty());
    }

    #[test]
    fn test_client_peer_shutdown_mid_round() {
        let server = TcpListener::bind(loopback()).unwrap();
        let mut connector =
            Connector::connect(server.local_addr().unwrap(), &test_config(8)).unwrap();

        let (mut fake, _) = server.accept().unwrap();
        fake.write_all(&[0, 0]).unwrap();
        drop(fake);

        let session = connector.run().unwrap();
        assert_eq!(session.rounds, 0);
        match session.error {
            Some(Error::PeerShutdown {
                direction,
                progress,
                target,
            }) => {
                assert_eq!(direction, Direction::Read);
                assert_eq!((progress, target), (2, 4));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_detects_corrupt_round() {
        let server = TcpListener::bind(loopback()).unwrap();
        let mut connector =
            Connector::connect(server.local_addr().unwrap(), &test_config(8)).unwrap();

        let (mut fake, _) = server.accept().unwrap();
        fake.set_nonblocking(true).unwrap();
        fake.write_all(&pattern_bytes(1)).unwrap();
        let mut reply = [0u8; 8];

        let start = Instant::now();
        while !connector.is_finished() && fake.peek(&mut reply).unwrap_or(0) < 8 {
            assert!(start.elapsed() < BUDGET);
            connector.turn(TURN).unwrap();
        }
        fake.read_exact(&mut reply).unwrap();
        assert_eq!(reply.to_vec(), pattern_bytes(2));

        let mut bad = pattern_bytes(3);
        bad[5] ^= 0xff;
        fake.write_all(&bad).unwrap();

        let session = connector.run().unwrap();
        match session.error {
            Some(Error::Integrity { round, mismatch }) => {
                assert_eq!(round, 3);
                assert_eq!(mismatch.index, 1);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_client_read_timeout() {
        let server = TcpListener::bind(loopback()).unwrap();
        let mut config = test_config(8);
        config.timeouts.read = Duration::from_millis(30);
        let mut connector = Connector::connect(server.local_addr().unwrap(), &config).unwrap();
        let (_fake, _) = server.accept().unwrap();

        let session = connector.run().unwrap();
        assert!(matches!(
            session.error,
            Some(Error::IoTimeout {
                direction: Direction::Read,
                ..
            })
        ));
    }

    #[test]
    fn test_connect_timeout_is_fatal() {
        let (_listener, _fillers, addr) = saturated_listener();
        let mut config = test_config(8);
        config.timeouts.connect = Duration::from_millis(200);

        let started = Instant::now();
        let result = Connector::connect(addr, &config).and_then(|mut c| c.run());
        match result {
            Err(Error::ConnectTimeout(after)) => assert_eq!(after, Duration::from_millis(200)),
            other => panic!("unexpected {other:?}"),
        }
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn test_server_write_timeout_closes_connection() {
        let mut config = test_config(1 << 20);
        config.timeouts.write = Duration::from_millis(200);
        config.timeouts.read = Duration::from_secs(60);
        let mut acceptor = Acceptor::bind(loopback(), &config).unwrap();
        let addr = acceptor.local_addr().unwrap();

        // Answers every round in order but never reads, so the server's
        // rounds pile up until its send buffer is full.
        let peer = thread::spawn(move || {
            let mut stream = TcpStream::connect(addr).unwrap();
            stream
                .set_write_timeout(Some(Duration::from_secs(10)))
                .unwrap();
            let mut n = 2;
            while stream.write_all(&pattern_bytes(n)).is_ok() {
                n += 2;
            }
        });

        serve_until(&mut acceptor, |a| a.stats().accepted == 1);
        let started = Instant::now();
        serve_until(&mut acceptor, |a| a.connection_count() == 0);
        assert!(started.elapsed() < Duration::from_secs(60));
        assert_eq!(acceptor.stats().closed, 1);
        peer.join().unwrap();
    }

    #[test]
    fn test_connect_refused_is_fatal() {
        let addr = {
            let listener = TcpListener::bind(loopback()).unwrap();
            listener.local_addr().unwrap()
        };

        let result = Connector::connect(addr, &test_config(8)).and_then(|mut c| c.run());
        assert!(matches!(
            result,
            Err(Error::ConnectFailed(_)) | Err(Error::Setup { op: "connect", .. })
        ));
    }
}
