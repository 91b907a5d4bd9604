use std::{io, net::SocketAddr};

use socket2::{Domain, Socket, Type};
use tokio::net::TcpListener;

// Public listeners are created nonblocking with Nagle's algorithm disabled.
// An IPv6 bind serves v4-mapped peers too, so one listener covers both
// stacks when a tunnel asks for the any-address. The address is marked
// reusable (except on Windows, where reusing an actively bound address
// allows socket hijacking) so a reconnecting tenant can take its port back
// without waiting for the OS to finish tearing the old socket down.
pub(crate) fn bind_listener(addr: SocketAddr) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, None)?;
    socket.set_nonblocking(true)?;
    socket.set_nodelay(true)?;
    if addr.is_ipv6() {
        socket.set_only_v6(false)?;
    }
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;

    socket.bind(&addr.into())?;
    let backlog = if cfg!(windows) { 128 } else { -1 };
    socket.listen(backlog)?;
    TcpListener::from_std(socket.into())
}
