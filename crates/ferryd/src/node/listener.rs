//! Primary socket setup.

use std::io;
use std::net::{IpAddr, SocketAddr};

use socket2::{Domain, Protocol, Socket, Type};

use super::NodeError;

const LISTEN_BACKLOG: i32 = 128;

/// Bind the primary listening socket, scanning upward from `base_port`.
///
/// Tries `base_port + offset` for `offset in 0..attempts`. A base port of 0
/// asks the OS for any free port and is tried once.
pub(crate) fn bind_primary(
    host: &str,
    base_port: u16,
    attempts: u16,
) -> Result<std::net::TcpListener, NodeError> {
    let ip: IpAddr = host
        .parse()
        .map_err(|_| NodeError::InvalidAddress(host.to_string()))?;

    if base_port == 0 {
        return try_bind(SocketAddr::new(ip, 0)).map_err(NodeError::Bind);
    }

    for offset in 0..attempts.max(1) {
        let Some(port) = base_port.checked_add(offset) else {
            break;
        };
        match try_bind(SocketAddr::new(ip, port)) {
            Ok(listener) => return Ok(listener),
            Err(e) => tracing::debug!(port, error = %e, "port unavailable"),
        }
    }
    Err(NodeError::BindExhausted {
        base: base_port,
        attempts,
    })
}

fn try_bind(addr: SocketAddr) -> io::Result<std::net::TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
