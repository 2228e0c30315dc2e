//! Small TCP helpers shared by the conductor and player.

use std::io;
use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio_util::codec::Framed;

use crate::protocol::MessageCodec;

/// Listen backlog for both listeners.
const BACKLOG: u32 = 64;

/// Binds a listener with `SO_REUSEADDR` set when the platform supports
/// it, so consecutive runs can rebind the well-known ports immediately.
/// The option is best-effort; failure to set it is ignored.
///
/// # Errors
///
/// Returns an I/O error if the address cannot be resolved or bound.
pub async fn bind_reuse(addr: &str) -> io::Result<TcpListener> {
    let mut last_err = None;
    for sockaddr in tokio::net::lookup_host(addr).await? {
        match try_bind(sockaddr) {
            Ok(listener) => return Ok(listener),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::AddrNotAvailable, format!("cannot resolve {addr}"))
    }))
}

fn try_bind(sockaddr: SocketAddr) -> io::Result<TcpListener> {
    let socket = if sockaddr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    let _ = socket.set_reuseaddr(true);
    socket.bind(sockaddr)?;
    socket.listen(BACKLOG)
}

/// Wraps a stream in the message codec with the given size limit.
#[must_use]
pub fn framed(stream: TcpStream, max_message_size: usize) -> Framed<TcpStream, MessageCodec> {
    Framed::new(stream, MessageCodec::new(max_message_size))
}
