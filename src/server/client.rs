use std::net::SocketAddr;

use tokio::net::TcpStream;

use crate::utils::types::Result;

/// A freshly accepted connection, handed out on the server's client feed.
///
/// What happens next (handshake, session setup) is up to whoever receives it.
#[derive(Debug)]
pub struct Client {
    stream: TcpStream,
    addr: SocketAddr,
}

impl Client {
    pub fn new(stream: TcpStream, addr: SocketAddr) -> Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self { stream, addr })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn into_parts(self) -> (TcpStream, SocketAddr) {
        (self.stream, self.addr)
    }
}
