use std::io;
use std::net::SocketAddr;

use mio::net::TcpStream;
use socket2::{Domain, Protocol, Socket, Type};

/// Pending connections the kernel queues before `accept`.
pub const LISTEN_BACKLOG: i32 = 1024;

/// Sets per-connection flags on an accepted stream.
///
/// * `TCP_NODELAY` (Disable Nagle's Algorithm): frames are small and should
///   leave immediately instead of waiting to coalesce.
pub fn apply_optimizations(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}

/// Creates a bound, listening, non-blocking socket for the `mio` event loop.
///
/// `SO_REUSEADDR` lets a restarted server rebind while old connections sit in TIME_WAIT.
pub fn create_listener(addr: SocketAddr) -> io::Result<mio::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;

    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;

    Ok(mio::net::TcpListener::from_std(socket.into()))
}
