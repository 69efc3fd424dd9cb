//! Socket setup for both roles.
//!
//! Sockets are created non-blocking with `SO_REUSEADDR` through `socket2`,
//! then handed to `mio`.

use crate::error::{Error, Result};
use mio::net::{TcpListener, TcpStream};
use socket2::{Domain, Protocol, Socket, Type};
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Resolve `host:port` to the first address the system returns.
pub fn resolve(host: &str, port: u16) -> Result<SocketAddr> {
    (host, port)
        .to_socket_addrs()
        .map_err(Error::setup("resolve"))?
        .next()
        .ok_or_else(|| Error::Setup {
            op: "resolve",
            source: io::Error::new(
                io::ErrorKind::NotFound,
                format!("no addresses for {host}:{port}"),
            ),
        })
}

/// Create a non-blocking listener bound to `addr`.
pub fn listen(addr: SocketAddr, backlog: i32) -> Result<TcpListener> {
    let socket = new_socket(addr)?;
    socket.bind(&addr.into()).map_err(Error::setup("bind"))?;
    socket.listen(backlog).map_err(Error::setup("listen"))?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Start a non-blocking connect to `addr`.
///
/// The returned stream is usually still connecting; completion is signalled
/// by writability and confirmed with [`connect_result`].
pub fn connect(addr: SocketAddr) -> Result<TcpStream> {
    let socket = new_socket(addr)?;
    match socket.connect(&addr.into()) {
        Ok(()) => {}
        Err(ref e) if connect_in_progress(e) => {}
        Err(e) => return Err(Error::setup("connect")(e)),
    }

    Ok(TcpStream::from_std(socket.into()))
}

/// Outcome of an outbound connect once the stream reports writable.
///
/// `Ok(true)` means connected, `Ok(false)` a spurious wakeup with the connect
/// still in flight.
pub fn connect_result(stream: &TcpStream) -> Result<bool> {
    if let Some(e) = stream.take_error().map_err(Error::ConnectFailed)? {
        return Err(Error::ConnectFailed(e));
    }
    match stream.peer_addr() {
        Ok(_) => Ok(true),
        Err(ref e) if e.kind() == io::ErrorKind::NotConnected => Ok(false),
        Err(e) => Err(Error::ConnectFailed(e)),
    }
}

fn new_socket(addr: SocketAddr) -> Result<Socket> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
        .map_err(Error::setup("socket"))?;
    socket
        .set_reuse_address(true)
        .map_err(Error::setup("setsockopt"))?;
    socket
        .set_nonblocking(true)
        .map_err(Error::setup("set_nonblocking"))?;
    Ok(socket)
}

#[cfg(unix)]
fn connect_in_progress(e: &io::Error) -> bool {
    e.raw_os_error() == Some(libc::EINPROGRESS) || e.kind() == io::ErrorKind::WouldBlock
}

#[cfg(not(unix))]
fn connect_in_progress(e: &io::Error) -> bool {
    e.kind() == io::ErrorKind::WouldBlock
}
